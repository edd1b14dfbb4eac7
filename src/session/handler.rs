use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{Session, SessionConfig, SessionStore};
use crate::Response;
use crate::context::RoutingContext;
use crate::http::Cookie;
use crate::router::{BoxFuture, Handler, HandlerResult};

// Context data key holding the id of the registered flush hook.
const FLUSH_HOOK_KEY: &str = "switchyard.session.flush";

/// Attaches a [`Session`] to every request it sees.
///
/// The session named by the session cookie is loaded from the store, or a new
/// one is created when the cookie is missing or names an expired session.
/// When the response headers are finalised the session is written back and
/// the cookie sent if the id changed. Sessions are only saved for 2xx and 3xx
/// responses; a [destroyed](Session::destroy) session is deleted and its
/// cookie expired instead.
///
/// Store writes happen in the background after the response is produced.
/// Failures there are logged and do not affect the response.
///
/// ```rust,no_run
/// use switchyard::Router;
/// use switchyard::session::{LocalSessionStore, SessionHandler};
///
/// # async fn run() {
/// let router = Router::new();
/// router
///     .route()
///     .handled_by(SessionHandler::new(LocalSessionStore::new()));
/// router.get("/visits").sync_handler(|ctx| {
///     let session = ctx.session().cloned().unwrap();
///     let visits = session.get_as::<u64>("visits").unwrap_or(0) + 1;
///     session.put("visits", visits);
///     ctx.end_json(&visits)?;
///     Ok(())
/// });
/// # }
/// ```
#[derive(Clone)]
pub struct SessionHandler {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl SessionHandler {
    pub fn new(store: impl SessionStore) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<dyn SessionStore>) -> Self {
        Self::with_config(store, SessionConfig::default())
    }

    pub fn with_config(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.config.cookie_name = name.into();
        self
    }

    pub fn cookie_path(mut self, path: impl Into<String>) -> Self {
        self.config.cookie_path = path.into();
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    pub fn cookie_secure(mut self, secure: bool) -> Self {
        self.config.cookie_secure = secure;
        self
    }

    pub fn cookie_http_only(mut self, http_only: bool) -> Self {
        self.config.cookie_http_only = http_only;
        self
    }

    pub fn id_length(mut self, id_length: usize) -> Self {
        self.config.id_length = id_length;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    async fn load_or_create(&self, cookie_id: Option<&str>) -> Result<Session, anyhow::Error> {
        if let Some(id) = cookie_id {
            if let Some(session) = self.store.get(id).await? {
                return Ok(session);
            }
            debug!(cookie = %self.config.cookie_name, "session cookie names no live session");
        }
        Ok(self
            .store
            .create_session_with_id_length(self.config.timeout(), self.config.id_length))
    }

    fn session_cookie(&self, value: impl Into<String>) -> Cookie {
        let mut cookie = Cookie::new(self.config.cookie_name.clone(), value);
        cookie
            .set_path(self.config.cookie_path.clone())
            .set_secure(self.config.cookie_secure)
            .set_http_only(self.config.cookie_http_only)
            .set_same_site(self.config.cookie_same_site);
        if let Some(max_age) = self.config.cookie_max_age_secs {
            cookie.set_max_age(max_age);
        }
        cookie
    }

    // Runs once the response headers are final.
    fn flush(&self, session: &Session, cookie_id: Option<&str>, response: &mut Response) {
        if session.is_destroyed() {
            if cookie_id.is_some() {
                let mut expired = self.session_cookie("");
                expired.set_max_age(0);
                response.add_header("Set-Cookie", expired.encode());
            }
            let mut ids = vec![session.id()];
            ids.extend(session.take_old_id());
            self.spawn_delete(ids);
            return;
        }

        let status = response.status().as_u16();
        if !(200..400).contains(&status) {
            debug!(status, "not saving session for unsuccessful response");
            return;
        }

        if let Some(old_id) = session.take_old_id() {
            self.spawn_delete(vec![old_id]);
        }
        let id = session.id();
        if cookie_id != Some(id.as_str()) || self.config.cookie_max_age_secs.is_some() {
            response.add_header("Set-Cookie", self.session_cookie(id).encode());
        }

        let store = Arc::clone(&self.store);
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = store.put(&session).await {
                error!(error = %e, "failed to store session");
            }
        });
    }

    fn spawn_delete(&self, ids: Vec<String>) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            for id in ids {
                if let Err(e) = store.delete(&id).await {
                    error!(error = %e, "failed to delete session");
                }
            }
        });
    }

    fn register_flush(&self, ctx: &mut RoutingContext, session: Session, cookie_id: Option<String>) {
        let handler = self.clone();
        let hook = ctx.add_headers_end_handler(move |response| {
            handler.flush(&session, cookie_id.as_deref(), response);
        });
        ctx.put(FLUSH_HOOK_KEY, hook);
    }
}

impl Handler for SessionHandler {
    fn handle<'a>(&'a self, ctx: &'a mut RoutingContext) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let cookie_id = ctx
                .cookie(&self.config.cookie_name)
                .map(|c| c.value().to_owned())
                .filter(|v| !v.is_empty());

            // Already attached: a reroute dropped the flush hook, or the handler
            // is installed twice.
            if let Some(session) = ctx.session().cloned() {
                if let Some(previous) = ctx.remove::<u32>(FLUSH_HOOK_KEY) {
                    if ctx.remove_headers_end_handler(previous) {
                        warn!("session handler seems to be installed more than once");
                    }
                }
                self.register_flush(ctx, session, cookie_id);
                ctx.next();
                return Ok(());
            }

            let session = self.load_or_create(cookie_id.as_deref()).await?;
            session.set_accessed();
            self.register_flush(ctx, session.clone(), cookie_id);
            ctx.set_session(session);
            ctx.next();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::router::HttpError;
    use crate::session::{LocalSessionStore, SessionError};
    use crate::{Method, Request, Router, StatusCode};

    fn app(store: &LocalSessionStore) -> Router {
        let router = Router::new();
        router
            .route()
            .handled_by(SessionHandler::new(store.clone()).cookie_http_only(true));
        router.get("/count").sync_handler(|ctx| {
            let Some(session) = ctx.session().cloned() else {
                return Err(anyhow::Error::new(HttpError::new(500, "no session")));
            };
            let n = session.get_as::<u64>("n").unwrap_or(0) + 1;
            session.put("n", n);
            ctx.response_mut().set_body(n.to_string());
            ctx.end();
            Ok(())
        });
        router.get("/logout").sync_handler(|ctx| {
            if let Some(session) = ctx.session() {
                session.destroy();
            }
            ctx.end();
            Ok(())
        });
        router.get("/login").sync_handler(|ctx| {
            if let Some(session) = ctx.session() {
                session.regenerate_id();
            }
            ctx.end();
            Ok(())
        });
        router.get("/switch-user").sync_handler(|ctx| {
            if let Some(session) = ctx.session() {
                session.destroy();
                session.put("user", "bob");
            }
            ctx.end();
            Ok(())
        });
        router.get("/boom").sync_handler(|ctx| {
            ctx.fail(StatusCode::SERVICE_UNAVAILABLE);
            Ok(())
        });
        router
    }

    fn session_id(set_cookie: &str) -> String {
        let pair = set_cookie.split(';').next().unwrap_or_default();
        pair.split_once('=').map(|(_, v)| v.to_owned()).unwrap_or_default()
    }

    fn get(path: &str, session: Option<&str>) -> Request {
        let req = Request::new(Method::Get, path);
        match session {
            Some(id) => req.with_header("Cookie", format!("switchyard.session={id}")),
            None => req,
        }
    }

    async fn eventually_size(store: &LocalSessionStore, expected: usize) {
        for _ in 0..100 {
            if store.size().await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("store never reached {expected} sessions");
    }

    #[tokio::test]
    async fn new_session_sets_cookie_and_is_stored() {
        let store = LocalSessionStore::new();
        let router = app(&store);

        let res = router.accept(get("/count", None)).await;
        assert_eq!(res.text(), "1");
        let cookie = res.headers().get("set-cookie").unwrap().to_owned();
        assert!(cookie.starts_with("switchyard.session="));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("HttpOnly"));
        assert_eq!(session_id(&cookie).len(), 32);

        eventually_size(&store, 1).await;
    }

    #[tokio::test]
    async fn cookie_resumes_the_session() {
        let store = LocalSessionStore::new();
        let router = app(&store);

        let first = router.accept(get("/count", None)).await;
        let id = session_id(first.headers().get("set-cookie").unwrap());
        eventually_size(&store, 1).await;

        let second = router.accept(get("/count", Some(&id))).await;
        assert_eq!(second.text(), "2");
        // Same id: no need to resend the cookie.
        assert!(second.headers().get("set-cookie").is_none());
    }

    #[tokio::test]
    async fn unknown_cookie_starts_a_new_session() {
        let store = LocalSessionStore::new();
        let router = app(&store);
        let res = router.accept(get("/count", Some("deadbeef"))).await;
        assert_eq!(res.text(), "1");
        let id = session_id(res.headers().get("set-cookie").unwrap());
        assert_ne!(id, "deadbeef");
    }

    #[tokio::test]
    async fn destroy_expires_cookie_and_deletes() {
        let store = LocalSessionStore::new();
        let router = app(&store);
        let first = router.accept(get("/count", None)).await;
        let id = session_id(first.headers().get("set-cookie").unwrap());
        eventually_size(&store, 1).await;

        let res = router.accept(get("/logout", Some(&id))).await;
        let cookie = res.headers().get("set-cookie").unwrap();
        assert!(cookie.starts_with("switchyard.session=;"));
        assert!(cookie.contains("Max-Age=0"));
        eventually_size(&store, 0).await;
    }

    #[tokio::test]
    async fn regenerate_replaces_stored_id() {
        let store = LocalSessionStore::new();
        let router = app(&store);
        let first = router.accept(get("/count", None)).await;
        let old = session_id(first.headers().get("set-cookie").unwrap());
        eventually_size(&store, 1).await;

        let res = router.accept(get("/login", Some(&old))).await;
        let new = session_id(res.headers().get("set-cookie").unwrap());
        assert_ne!(new, old);

        for _ in 0..100 {
            if store.get(&old).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.get(&old).await.unwrap().is_none());
        let moved = store.get(&new).await.unwrap().unwrap();
        assert_eq!(moved.get_as::<u64>("n"), Some(1));
    }

    #[tokio::test]
    async fn writing_after_destroy_retires_the_old_id() {
        let store = LocalSessionStore::new();
        let router = app(&store);
        let first = router.accept(get("/count", None)).await;
        let old = session_id(first.headers().get("set-cookie").unwrap());
        eventually_size(&store, 1).await;

        let res = router.accept(get("/switch-user", Some(&old))).await;
        let new = session_id(res.headers().get("set-cookie").unwrap());
        assert_ne!(new, old);

        for _ in 0..100 {
            let retired = store.get(&old).await.unwrap().is_none();
            let saved = store.get(&new).await.unwrap().is_some();
            if retired && saved {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.get(&old).await.unwrap().is_none());
        let revived = store.get(&new).await.unwrap().unwrap();
        assert_eq!(revived.get_as::<String>("user").as_deref(), Some("bob"));
        assert_eq!(revived.get_as::<u64>("n"), None);
        assert_eq!(store.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_requests_do_not_save() {
        let store = LocalSessionStore::new();
        let router = app(&store);
        let res = router.accept(get("/boom", None)).await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(res.headers().get("set-cookie").is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_error_fails_the_request() {
        let store = LocalSessionStore::new();
        store.close().await;
        let router = app(&store);
        let errors = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        router.exception_handler(move |e| {
            seen.lock()
                .push(e.downcast_ref::<SessionError>().map(ToString::to_string));
        });

        let res = router.accept(get("/count", Some("abc"))).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            *errors.lock(),
            vec![Some("session store is closed".to_owned())]
        );
    }
}
