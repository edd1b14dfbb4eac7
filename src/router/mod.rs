//! Request routing: ordered route lists, failure chains and sub-router mounting.
//!
//! A [`Router`] holds an ordered list of [`Route`]s. Dispatch walks that list
//! and runs the handler of every route that matches, as long as each handler
//! hands over with [`RoutingContext::next`]. A handler that calls
//! [`RoutingContext::fail`] (or returns `Err`) restarts the walk from the top of
//! the root router, this time running failure handlers.
//!
//! | Concept        | Entry point                                     |
//! |----------------|-------------------------------------------------|
//! | Add a route    | [`Router::route`], [`Router::get`], ...         |
//! | Mount a router | [`Router::mount_sub_router`]                    |
//! | Serve one      | [`Router::accept`]                              |
//! | Custom errors  | [`Router::error_handler`], [`Router::exception_handler`] |
//!
//! # Examples
//!
//! ```rust,no_run
//! use switchyard::{Method, Request, Router};
//!
//! # async fn example() {
//! let api = Router::new();
//! api.get("/ping").sync_handler(|ctx| {
//!     ctx.response_mut().set_body("pong");
//!     ctx.end();
//!     Ok(())
//! });
//!
//! let root = Router::new();
//! root.mount_sub_router("/api", api).unwrap();
//!
//! let response = root.accept(Request::new(Method::Get, "/api/ping")).await;
//! assert_eq!(response.text(), "pong");
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, trace};

use crate::context::RoutingContext;
use crate::{Method, Request, Response, StatusCode};

mod handler;
mod path;
mod route;

pub use handler::{BoxFuture, Handler, HandlerResult, HttpError};
pub use path::normalize_path;
pub use route::Route;

pub(crate) use route::RouteMatch;

/// Callback notified of every error a handler returns.
pub type ExceptionHandler = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Errors raised while configuring a router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A path regex did not compile.
    #[error("invalid path regex `{pattern}`")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Sub-routers are mounted on a prefix; wildcards make no sense there.
    #[error("mount point `{0}` must not end with `*`")]
    InvalidMountPoint(String),
}

/// An ordered set of routes plus the router-level error hooks.
///
/// `Router` is a handle: clones share the same routes, so a router can be
/// configured from one place while it is already serving requests from
/// another. Route lists are snapshotted when dispatch enters the router,
/// so adding or removing routes never disturbs a request in flight.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

pub(crate) struct RouterInner {
    state: RwLock<RouterState>,
}

struct RouterState {
    // Always sorted by `Route::sort_key`.
    routes: Arc<[Route]>,
    next_seq: u64,
    exception_handler: Option<ExceptionHandler>,
    error_handlers: HashMap<u16, Arc<dyn Handler>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Router")
            .field("routes", &state.routes)
            .field("error_handlers", &state.error_handlers.keys().collect::<Vec<_>>())
            .field("exception_handler", &state.exception_handler.is_some())
            .finish()
    }
}

impl Router {
    /// Create a new, empty `Router`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use switchyard::Router;
    ///
    /// let router = Router::new();
    /// assert!(router.is_empty());
    /// ```
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                state: RwLock::new(RouterState {
                    routes: Arc::from(Vec::new()),
                    next_seq: 0,
                    exception_handler: None,
                    error_handlers: HashMap::new(),
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RouterInner>) -> Self {
        Self { inner }
    }

    // ── Route creation ────────────────────────────────────────────────────────

    /// Append a route that matches every request until criteria are added.
    ///
    /// Its order defaults to its insertion index, so routes run in the order
    /// they were added unless [`Route::order`] says otherwise.
    pub fn route(&self) -> Route {
        let mut state = self.inner.state.write();
        let route = Route::new(state.next_seq, Arc::downgrade(&self.inner));
        state.next_seq += 1;

        let mut routes = state.routes.to_vec();
        routes.push(route.clone());
        sort_routes(&mut routes);
        state.routes = routes.into();
        route
    }

    /// Append a route matching the path prefix `path`.
    pub fn route_at(&self, path: &str) -> Route {
        let route = self.route();
        route.path(path);
        route
    }

    /// Append a route whose path criterion is a regex.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InvalidRegex`] if `regex` does not compile; no
    /// route is added in that case.
    pub fn route_with_regex(&self, regex: &str) -> Result<Route, RouterError> {
        let pattern = path::PathPattern::regex(regex)?;
        let route = self.route();
        route.set_pattern(pattern);
        Ok(route)
    }

    /// Append a route for `GET` requests matching `path`.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use switchyard::Router;
    ///
    /// let router = Router::new();
    /// router.get("/hello").sync_handler(|ctx| {
    ///     ctx.end();
    ///     Ok(())
    /// });
    /// ```
    pub fn get(&self, path: &str) -> Route {
        self.route_for(Method::Get, path)
    }

    /// Append a route for `POST` requests matching `path`.
    pub fn post(&self, path: &str) -> Route {
        self.route_for(Method::Post, path)
    }

    /// Append a route for `PUT` requests matching `path`.
    pub fn put(&self, path: &str) -> Route {
        self.route_for(Method::Put, path)
    }

    /// Append a route for `DELETE` requests matching `path`.
    pub fn delete(&self, path: &str) -> Route {
        self.route_for(Method::Delete, path)
    }

    /// Append a route for `PATCH` requests matching `path`.
    pub fn patch(&self, path: &str) -> Route {
        self.route_for(Method::Patch, path)
    }

    /// Append a route for `HEAD` requests matching `path`.
    pub fn head(&self, path: &str) -> Route {
        self.route_for(Method::Head, path)
    }

    /// Append a route for `OPTIONS` requests matching `path`.
    pub fn options(&self, path: &str) -> Route {
        self.route_for(Method::Options, path)
    }

    fn route_for(&self, method: Method, path: &str) -> Route {
        let route = self.route_at(path);
        route.method(method);
        route
    }

    /// Mount `sub` under `mount_point`.
    ///
    /// Requests whose path starts with `mount_point` are dispatched through
    /// `sub`'s routes, which see the remainder of the path; when `sub` runs out
    /// of matching routes dispatch carries on with the routes after the mount.
    /// Failures raised in `sub` are offered to `sub`'s failure handlers too.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InvalidMountPoint`] if `mount_point` ends with `*`.
    pub fn mount_sub_router(&self, mount_point: &str, sub: Router) -> Result<Route, RouterError> {
        if mount_point.ends_with('*') {
            return Err(RouterError::InvalidMountPoint(mount_point.to_owned()));
        }
        let route = self.route_at(mount_point);
        route
            .handled_by(MountHandler { router: sub.clone() })
            .failure_handled_by(MountHandler { router: sub });
        debug!(mount_point, "sub-router mounted");
        Ok(route)
    }

    /// Register a callback notified of every error returned by a handler
    /// dispatched through this router. Replaces any previous callback.
    pub fn exception_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.inner.state.write().exception_handler = Some(Arc::new(handler));
        self
    }

    /// Register the handler that renders unhandled failures with status `code`
    /// (including the 404 produced when nothing matches).
    ///
    /// Only the error handlers of the router that accepted the request are
    /// consulted.
    pub fn error_handler<F>(&self, code: impl Into<StatusCode>, handler: F) -> &Self
    where
        F: for<'a> Fn(&'a mut RoutingContext) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.error_handled_by(code, handler)
    }

    pub fn error_handled_by<H: Handler>(&self, code: impl Into<StatusCode>, handler: H) -> &Self {
        self.inner
            .state
            .write()
            .error_handlers
            .insert(code.into().as_u16(), Arc::new(handler));
        self
    }

    /// Remove every route. Error and exception handlers are kept.
    ///
    /// A request already being dispatched finishes against the routes it
    /// started with; only later requests see the empty list.
    pub fn clear(&self) -> &Self {
        self.inner.state.write().routes = Arc::from(Vec::new());
        self
    }

    /// The routes in dispatch order.
    pub fn routes(&self) -> Vec<Route> {
        self.inner.state.read().routes.to_vec()
    }

    /// Return the number of routes registered in this router.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use switchyard::Router;
    ///
    /// let router = Router::new();
    /// assert_eq!(router.len(), 0);
    /// router.get("/a");
    /// assert_eq!(router.len(), 1);
    /// ```
    pub fn len(&self) -> usize {
        self.inner.state.read().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.read().routes.is_empty()
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Dispatch `request` through this router and return the finished response.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use switchyard::{Method, Request, Router, StatusCode};
    ///
    /// # async fn example() {
    /// let router = Router::new();
    /// let response = router.accept(Request::new(Method::Get, "/nowhere")).await;
    /// assert_eq!(response.status(), StatusCode::NOT_FOUND);
    /// # }
    /// ```
    pub async fn accept(&self, request: Request) -> Response {
        trace!(method = %request.method(), path = request.path(), "accepting request");
        let mut ctx = RoutingContext::new(request, self.clone());
        ctx.dispatch().await;
        ctx.into_response()
    }

    /// Continue dispatch of `ctx` inside this router.
    ///
    /// Meant to be called from a handler: the router's routes are tried next,
    /// relative to the path the current route matched, and dispatch resumes
    /// after the current route once they are exhausted. The handler should not
    /// call `next` itself afterwards.
    pub fn handle_context(&self, ctx: &mut RoutingContext) {
        ctx.enter_router(self.clone());
    }

    /// Failure-chain counterpart of [`handle_context`](Self::handle_context).
    pub fn handle_failure(&self, ctx: &mut RoutingContext) {
        ctx.enter_router(self.clone());
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    pub(crate) fn snapshot(&self) -> Arc<[Route]> {
        Arc::clone(&self.inner.state.read().routes)
    }

    pub(crate) fn exception_handler_ref(&self) -> Option<ExceptionHandler> {
        self.inner.state.read().exception_handler.clone()
    }

    pub(crate) fn error_handler_for(&self, code: u16) -> Option<Arc<dyn Handler>> {
        self.inner.state.read().error_handlers.get(&code).cloned()
    }

    pub(crate) fn remove_route(&self, route: &Route) {
        let mut state = self.inner.state.write();
        if state.routes.iter().any(|r| r.same_as(route)) {
            let routes: Vec<Route> = state
                .routes
                .iter()
                .filter(|r| !r.same_as(route))
                .cloned()
                .collect();
            state.routes = routes.into();
        }
    }

    pub(crate) fn resort(&self) {
        let mut routes = self.snapshot().to_vec();
        sort_routes(&mut routes);
        let mut state = self.inner.state.write();
        // A concurrent add or remove may have raced the sort; keep its result.
        if routes.len() == state.routes.len()
            && routes.iter().all(|r| state.routes.iter().any(|s| s.same_as(r)))
        {
            state.routes = routes.into();
        } else {
            let mut current = state.routes.to_vec();
            sort_routes(&mut current);
            state.routes = current.into();
        }
    }
}

fn sort_routes(routes: &mut [Route]) {
    routes.sort_by_cached_key(Route::sort_key);
}

// Route handler installed by `mount_sub_router`.
struct MountHandler {
    router: Router,
}

impl Handler for MountHandler {
    fn handle<'a>(&'a self, ctx: &'a mut RoutingContext) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            if ctx.failed() {
                self.router.handle_failure(ctx);
            } else {
                self.router.handle_context(ctx);
            }
            Ok(())
        })
    }
}
