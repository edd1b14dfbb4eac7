use std::time::Duration;

use async_trait::async_trait;

use super::{Session, SessionError};

/// Async CRUD over sessions.
///
/// Every operation is atomic for a given id. Implementations never hand out
/// an expired session from [`get`](Self::get), whatever their eviction
/// schedule. Errors are returned to the caller; stores do not fail HTTP
/// requests on their own.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Create a new session. It is not stored until [`put`](Self::put).
    fn create_session(&self, timeout: Duration) -> Session {
        Session::new(timeout)
    }

    /// Create a new session whose id is `id_length` random bytes.
    fn create_session_with_id_length(&self, timeout: Duration, id_length: usize) -> Session {
        Session::with_id_length(timeout, id_length)
    }

    /// The live session with `id`, or `None` if it is unknown or expired.
    async fn get(&self, id: &str) -> Result<Option<Session>, SessionError>;

    /// Insert or replace the session under its current id.
    async fn put(&self, session: &Session) -> Result<(), SessionError>;

    async fn delete(&self, id: &str) -> Result<(), SessionError>;

    /// Remove every session.
    async fn clear(&self) -> Result<(), SessionError>;

    /// Number of live sessions.
    async fn size(&self) -> Result<usize, SessionError>;

    /// Release the store's resources. Later operations fail with
    /// [`SessionError::Closed`].
    async fn close(&self);
}
