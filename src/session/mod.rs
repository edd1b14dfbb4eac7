//! Expiring per-browser sessions.
//!
//! A [`Session`] is a bag of JSON values identified by an unguessable hex id.
//! It expires once it has not been accessed for longer than its timeout.
//! Sessions are kept in a [`SessionStore`]:
//!
//! - [`LocalSessionStore`] keeps them in process, and a reaper task
//!   periodically evicts expired ones;
//! - [`SharedSessionStore`] serialises them into a [`SharedMap`] and lets the
//!   map expire them through per-entry TTLs.
//!
//! [`SessionHandler`] ties a store to the router: it loads the session named by
//! the session cookie before the rest of the chain runs and writes it back when
//! the response headers are finalised.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod config;
mod handler;
mod local;
mod shared;
mod store;

pub use config::{LocalStoreConfig, SessionConfig};
pub use handler::SessionHandler;
pub use local::LocalSessionStore;
pub use shared::{InMemorySharedMap, SharedMap, SharedSessionStore};
pub use store::SessionStore;

/// Default number of random bytes in a session id (hex encoded, so ids are
/// twice as long).
pub const DEFAULT_ID_LENGTH: usize = 16;

/// Errors returned by session stores.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The store was closed with [`SessionStore::close`].
    #[error("session store is closed")]
    Closed,

    /// A session could not be encoded for, or decoded from, a shared map.
    #[error("session serialization failed")]
    Serialization(#[from] serde_json::Error),

    /// The backing storage failed.
    #[error("session backend error: {0}")]
    Backend(String),
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub(crate) fn generate_id(length: usize) -> String {
    let mut bytes = vec![0u8; length.max(1)];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A session handle.
///
/// Clones share state, so a handler that changes the session through its
/// context changes what the store will see.
///
/// ```
/// use std::time::Duration;
/// use switchyard::session::Session;
///
/// let session = Session::new(Duration::from_secs(60));
/// session.put("visits", 1);
/// assert_eq!(session.get_as::<u32>("visits"), Some(1));
/// assert_eq!(session.id().len(), 32);
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<RwLock<SessionState>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionState {
    id: String,
    timeout_ms: u64,
    last_accessed_ms: u64,
    data: HashMap<String, Value>,
    #[serde(skip)]
    destroyed: bool,
    #[serde(skip)]
    old_id: Option<String>,
}

impl SessionState {
    fn regenerate(&mut self) {
        let length = self.id.len() / 2;
        let previous = std::mem::replace(&mut self.id, generate_id(length));
        // Regenerating twice before a flush must still delete the stored id.
        if self.old_id.is_none() {
            self.old_id = Some(previous);
        }
    }
}

impl Session {
    /// A new, empty session with a fresh id of [`DEFAULT_ID_LENGTH`] bytes.
    pub fn new(timeout: Duration) -> Self {
        Self::with_id_length(timeout, DEFAULT_ID_LENGTH)
    }

    /// A new, empty session whose id is `id_length` random bytes.
    pub fn with_id_length(timeout: Duration, id_length: usize) -> Self {
        Self::from_state(SessionState {
            id: generate_id(id_length),
            timeout_ms: timeout.as_millis() as u64,
            last_accessed_ms: now_millis(),
            data: HashMap::new(),
            destroyed: false,
            old_id: None,
        })
    }

    pub(crate) fn from_state(state: SessionState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub(crate) fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&*self.inner.read())
    }

    pub(crate) fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice::<SessionState>(bytes).map(Self::from_state)
    }

    pub fn id(&self) -> String {
        self.inner.read().id.clone()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.inner.read().timeout_ms)
    }

    /// Last access time in milliseconds since the Unix epoch.
    pub fn last_accessed(&self) -> u64 {
        self.inner.read().last_accessed_ms
    }

    /// Mark the session as used now.
    pub fn set_accessed(&self) {
        self.inner.write().last_accessed_ms = now_millis();
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    pub(crate) fn is_expired_at(&self, now_ms: u64) -> bool {
        let state = self.inner.read();
        now_ms.saturating_sub(state.last_accessed_ms) > state.timeout_ms
    }

    // ── Data ──────────────────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().data.get(key).cloned()
    }

    /// Get the value under `key` decoded as `T`. Returns `None` when the key is
    /// missing or the value does not decode.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Store a value. Putting into a destroyed session revives it under a new
    /// id; the destroyed id is kept in [`old_id`](Self::old_id) so the store
    /// entry under it is deleted on the next flush.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut state = self.inner.write();
        if state.destroyed {
            state.destroyed = false;
            state.regenerate();
        }
        state.data.insert(key.into(), value.into());
    }

    /// Store any serialisable value.
    pub fn put_serialized<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.put(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().data.remove(key)
    }

    /// A copy of all the data.
    pub fn data(&self) -> HashMap<String, Value> {
        self.inner.read().data.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().data.is_empty()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Clear the data and mark the session for deletion from its store.
    pub fn destroy(&self) {
        let mut state = self.inner.write();
        state.destroyed = true;
        state.data.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.read().destroyed
    }

    /// Give the session a fresh id, keeping its data. The previous id is kept
    /// in [`old_id`](Self::old_id) until the session is next stored.
    pub fn regenerate_id(&self) {
        self.inner.write().regenerate();
    }

    /// The id the session had before [`regenerate_id`](Self::regenerate_id).
    pub fn old_id(&self) -> Option<String> {
        self.inner.read().old_id.clone()
    }

    pub(crate) fn take_old_id(&self) -> Option<String> {
        self.inner.write().old_id.take()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.read();
        f.debug_struct("Session")
            .field("id", &state.id)
            .field("timeout_ms", &state.timeout_ms)
            .field("last_accessed_ms", &state.last_accessed_ms)
            .field("keys", &state.data.keys().collect::<Vec<_>>())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_hex_and_unique() {
        let a = Session::new(Duration::from_secs(1));
        let b = Session::new(Duration::from_secs(1));
        assert_eq!(a.id().len(), DEFAULT_ID_LENGTH * 2);
        assert!(a.id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.id(), b.id());
        assert_eq!(Session::with_id_length(Duration::ZERO, 4).id().len(), 8);
    }

    #[test]
    fn data_round_trip() {
        let s = Session::new(Duration::from_secs(60));
        assert!(s.is_empty());
        s.put("name", "ada");
        s.put_serialized("tags", &vec!["a", "b"]).unwrap();
        assert_eq!(s.get("name"), Some(Value::from("ada")));
        assert_eq!(s.get_as::<Vec<String>>("tags").unwrap(), vec!["a", "b"]);
        assert_eq!(s.get_as::<u32>("name"), None);
        assert_eq!(s.len(), 2);
        assert_eq!(s.remove("name"), Some(Value::from("ada")));
        assert_eq!(s.data().len(), 1);
    }

    #[test]
    fn clones_share_state() {
        let s = Session::new(Duration::from_secs(60));
        let t = s.clone();
        t.put("k", 1);
        assert_eq!(s.get_as::<i32>("k"), Some(1));
    }

    #[test]
    fn expiry_is_relative_to_last_access() {
        let s = Session::new(Duration::from_millis(100));
        let accessed = s.last_accessed();
        assert!(!s.is_expired_at(accessed + 100));
        assert!(s.is_expired_at(accessed + 101));
    }

    #[test]
    fn destroy_clears_and_put_revives() {
        let s = Session::new(Duration::from_secs(60));
        let id = s.id();
        s.put("k", true);
        s.destroy();
        assert!(s.is_destroyed());
        assert!(s.is_empty());
        s.put("k", false);
        assert!(!s.is_destroyed());
        assert_ne!(s.id(), id);
        assert_eq!(s.old_id(), Some(id));
    }

    #[test]
    fn regenerate_keeps_data_and_first_old_id() {
        let s = Session::new(Duration::from_secs(60));
        let original = s.id();
        s.put("k", 1);
        s.regenerate_id();
        s.regenerate_id();
        assert_ne!(s.id(), original);
        assert_eq!(s.old_id(), Some(original.clone()));
        assert_eq!(s.get_as::<i32>("k"), Some(1));
        assert_eq!(s.take_old_id(), Some(original));
        assert_eq!(s.old_id(), None);
    }

    #[test]
    fn json_round_trip_skips_transient_flags() {
        let s = Session::new(Duration::from_secs(5));
        s.put("n", 3);
        s.regenerate_id();
        let copy = Session::from_json(&s.to_json().unwrap()).unwrap();
        assert_eq!(copy.id(), s.id());
        assert_eq!(copy.timeout(), Duration::from_secs(5));
        assert_eq!(copy.get_as::<i32>("n"), Some(3));
        assert_eq!(copy.old_id(), None);
    }
}
