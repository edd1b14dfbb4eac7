//! Session store over a shared key/value map.
//!
//! [`SharedSessionStore`] does not track expiry itself. Every session is
//! written with a TTL equal to its timeout and the [`SharedMap`] is trusted to
//! drop it when that runs out, so several processes can share one map without
//! each running a reaper.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use super::{Session, SessionError, SessionStore};

/// A key/value map with per-entry time-to-live, shared between processes.
///
/// Implement it over whatever distributed cache the deployment provides.
/// [`InMemorySharedMap`] is the in-process implementation.
#[async_trait]
pub trait SharedMap: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, SessionError>;

    /// Store `value`, to be dropped by the map after `ttl`.
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), SessionError>;

    async fn remove(&self, key: &str) -> Result<(), SessionError>;

    async fn clear(&self) -> Result<(), SessionError>;

    /// Number of unexpired entries.
    async fn size(&self) -> Result<usize, SessionError>;
}

/// A [`SharedMap`] kept in this process. Expired entries are purged lazily on
/// access.
#[derive(Debug, Default)]
pub struct InMemorySharedMap {
    entries: DashMap<String, (Bytes, Instant)>,
}

impl InMemorySharedMap {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedMap for InMemorySharedMap {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, SessionError> {
        let now = Instant::now();
        let found = self
            .entries
            .get(key)
            .map(|e| (e.value().0.clone(), e.value().1));
        match found {
            Some((value, expires_at)) if expires_at > now => Ok(Some(value)),
            Some(_) => {
                self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), SessionError> {
        self.entries
            .insert(key.to_owned(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SessionError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), SessionError> {
        self.entries.clear();
        Ok(())
    }

    async fn size(&self) -> Result<usize, SessionError> {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(self.entries.len())
    }
}

/// Sessions serialised as JSON into a [`SharedMap`].
///
/// Sessions read back are detached copies: changes must be
/// [`put`](SessionStore::put) to be seen by other readers.
#[derive(Clone)]
pub struct SharedSessionStore {
    map: Arc<dyn SharedMap>,
    closed: Arc<AtomicBool>,
}

impl SharedSessionStore {
    pub fn new(map: impl SharedMap) -> Self {
        Self::from_arc(Arc::new(map))
    }

    pub fn from_arc(map: Arc<dyn SharedMap>) -> Self {
        Self {
            map,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A store over a fresh [`InMemorySharedMap`].
    pub fn in_memory() -> Self {
        Self::new(InMemorySharedMap::new())
    }

    fn check_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionStore for SharedSessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        self.check_open()?;
        let Some(bytes) = self.map.get(id).await? else {
            return Ok(None);
        };
        let session = Session::from_json(&bytes)?;
        // The map's TTL is the authority, but never hand out a session whose
        // own clock says it is stale.
        if session.is_expired() {
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn put(&self, session: &Session) -> Result<(), SessionError> {
        self.check_open()?;
        let bytes = Bytes::from(session.to_json()?);
        self.map.put(&session.id(), bytes, session.timeout()).await
    }

    async fn delete(&self, id: &str) -> Result<(), SessionError> {
        self.check_open()?;
        self.map.remove(id).await
    }

    async fn clear(&self) -> Result<(), SessionError> {
        self.check_open()?;
        self.map.clear().await
    }

    async fn size(&self) -> Result<usize, SessionError> {
        self.check_open()?;
        self.map.size().await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("shared session store closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_json() {
        let store = SharedSessionStore::in_memory();
        let session = store.create_session(Duration::from_secs(60));
        session.put("user", "ada");
        store.put(&session).await.unwrap();

        let loaded = store.get(&session.id()).await.unwrap().unwrap();
        assert_eq!(loaded.get_as::<String>("user").as_deref(), Some("ada"));
        assert_eq!(loaded.timeout(), Duration::from_secs(60));

        // Detached copy: local edits are invisible until put.
        loaded.put("user", "grace");
        let again = store.get(&session.id()).await.unwrap().unwrap();
        assert_eq!(again.get_as::<String>("user").as_deref(), Some("ada"));
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let store = SharedSessionStore::in_memory();
        let session = store.create_session(Duration::from_millis(20));
        store.put(&session).await.unwrap();
        assert_eq!(store.size().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get(&session.id()).await.unwrap().is_none());
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let store = SharedSessionStore::in_memory();
        let a = store.create_session(Duration::from_secs(60));
        let b = store.create_session(Duration::from_secs(60));
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();
        store.delete(&a.id()).await.unwrap();
        assert!(store.get(&a.id()).await.unwrap().is_none());
        assert_eq!(store.size().await.unwrap(), 1);
        store.clear().await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_serialization_error() {
        let map = Arc::new(InMemorySharedMap::new());
        map.put("bad", Bytes::from_static(b"not json"), Duration::from_secs(5))
            .await
            .unwrap();
        let store = SharedSessionStore::from_arc(map);
        assert!(matches!(
            store.get("bad").await,
            Err(SessionError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = SharedSessionStore::in_memory();
        store.close().await;
        assert!(matches!(store.size().await, Err(SessionError::Closed)));
    }
}
