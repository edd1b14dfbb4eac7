//! In-process session store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{LocalStoreConfig, Session, SessionError, SessionStore, now_millis};

/// Sessions held in a concurrent map inside this process.
///
/// A reaper task wakes every
/// [`reaper_interval`](LocalStoreConfig::reaper_interval_ms) and evicts
/// expired sessions; [`get`](SessionStore::get) also refuses expired ones in
/// between. The store holds the very [`Session`] handles it is given, so a
/// session fetched from it and then modified is modified in the store too.
///
/// The reaper stops when the store is closed or its last clone is dropped.
#[derive(Clone)]
pub struct LocalSessionStore {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    sessions: DashMap<String, Session>,
    closed: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl LocalInner {
    fn check_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn reap(&self) -> usize {
        let now = now_millis();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired_at(now));
        before.saturating_sub(self.sessions.len())
    }
}

impl Drop for LocalInner {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.get_mut().take() {
            reaper.abort();
        }
    }
}

impl LocalSessionStore {
    /// Create a store with the default configuration.
    ///
    /// Must be called from within a Tokio runtime: the reaper is spawned here.
    pub fn new() -> Self {
        Self::with_config(LocalStoreConfig::default())
    }

    /// Create a store whose reaper runs on `config.reaper_interval_ms`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(config: LocalStoreConfig) -> Self {
        let inner = Arc::new(LocalInner {
            sessions: DashMap::new(),
            closed: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });
        let handle = tokio::spawn(run_reaper(Arc::downgrade(&inner), config));
        *inner.reaper.lock() = Some(handle);
        Self { inner }
    }
}

impl Default for LocalSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_reaper(store: Weak<LocalInner>, config: LocalStoreConfig) {
    let mut interval = tokio::time::interval(config.reaper_interval());
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = store.upgrade() else {
            trace!("session store dropped; reaper exiting");
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let evicted = inner.reap();
        if evicted > 0 {
            debug!(evicted, remaining = inner.sessions.len(), "reaped expired sessions");
        }
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        self.inner.check_open()?;
        let Some(session) = self.inner.sessions.get(id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let now = now_millis();
        if session.is_expired_at(now) {
            self.inner
                .sessions
                .remove_if(id, |_, s| s.is_expired_at(now));
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn put(&self, session: &Session) -> Result<(), SessionError> {
        self.inner.check_open()?;
        self.inner.sessions.insert(session.id(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SessionError> {
        self.inner.check_open()?;
        self.inner.sessions.remove(id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), SessionError> {
        self.inner.check_open()?;
        self.inner.sessions.clear();
        Ok(())
    }

    async fn size(&self) -> Result<usize, SessionError> {
        self.inner.check_open()?;
        let now = now_millis();
        Ok(self
            .inner
            .sessions
            .iter()
            .filter(|e| !e.value().is_expired_at(now))
            .count())
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reaper) = self.inner.reaper.lock().take() {
            reaper.abort();
        }
        self.inner.sessions.clear();
        debug!("local session store closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn store(reaper_ms: u64) -> LocalSessionStore {
        LocalSessionStore::with_config(LocalStoreConfig {
            reaper_interval_ms: reaper_ms,
        })
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = store(1000);
        let session = store.create_session(Duration::from_secs(60));
        session.put("cart", 3);
        store.put(&session).await.unwrap();

        let loaded = store.get(&session.id()).await.unwrap().unwrap();
        assert_eq!(loaded.get_as::<i32>("cart"), Some(3));
        assert_eq!(store.size().await.unwrap(), 1);

        store.delete(&session.id()).await.unwrap();
        assert!(store.get(&session.id()).await.unwrap().is_none());
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_id_is_none() {
        let store = store(1000);
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_session_is_never_returned() {
        let store = store(60_000);
        let session = store.create_session(Duration::from_millis(20));
        store.put(&session).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get(&session.id()).await.unwrap().is_none());
        assert_eq!(store.inner.sessions.len(), 0);
    }

    #[tokio::test]
    async fn reaper_evicts_expired_sessions() {
        let store = store(10);
        let short = store.create_session(Duration::from_millis(20));
        let long = store.create_session(Duration::from_secs(60));
        store.put(&short).await.unwrap();
        store.put(&long).await.unwrap();
        assert_eq!(store.inner.sessions.len(), 2);

        let mut reaped = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.inner.sessions.len() == 1 {
                reaped = true;
                break;
            }
        }
        assert!(reaped, "reaper did not evict the expired session");
        assert!(store.inner.sessions.contains_key(&long.id()));
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let store = store(1000);
        for _ in 0..3 {
            store
                .put(&store.create_session(Duration::from_secs(60)))
                .await
                .unwrap();
        }
        assert_eq!(store.size().await.unwrap(), 3);
        store.clear().await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = store(1000);
        store.close().await;
        store.close().await;
        assert!(matches!(store.size().await, Err(SessionError::Closed)));
        assert!(matches!(store.get("x").await, Err(SessionError::Closed)));
    }
}
