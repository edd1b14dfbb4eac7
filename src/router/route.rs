//! A single routing rule.
//!
//! A [`Route`] is a cheap, cloneable handle onto a rule owned by a
//! [`Router`](super::Router). Its matching criteria are refined with fluent
//! setters, and the router sees every change immediately:
//!
//! ```rust,no_run
//! use switchyard::{Method, Router};
//!
//! let router = Router::new();
//! router
//!     .route_at("/orders")
//!     .method(Method::Post)
//!     .consumes("application/json")
//!     .produces("application/json")
//!     .sync_handler(|ctx| {
//!         ctx.response_mut().set_status(201u16);
//!         ctx.end();
//!         Ok(())
//!     });
//! ```
//!
//! A request matches a route when all of the following hold, checked in this
//! order: the route is enabled, the method set is empty or contains the
//! request method, the path criterion (if any) matches a prefix of the path,
//! the request `Content-Type` is one of the consumed types (if any are
//! declared), and the `Accept` header admits one of the produced types (if any
//! are declared).

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::handler::{BoxFuture, Handler, HandlerResult, SyncHandler};
use super::path::PathPattern;
use super::{Router, RouterError, RouterInner};
use crate::context::RoutingContext;
use crate::http::MediaType;
use crate::http::mime::{negotiate, parse_accept};
use crate::{Method, Request};

/// A handle onto one routing rule.
///
/// Clones refer to the same rule. Handles stay valid after
/// [`remove`](Route::remove); the rule simply stops being dispatched.
#[derive(Clone)]
pub struct Route {
    inner: Arc<RouteInner>,
}

struct RouteInner {
    // Insertion sequence number; the default order and the tie-breaker.
    seq: u64,
    router: Weak<RouterInner>,
    state: RwLock<RouteState>,
}

struct RouteState {
    order: i64,
    last: bool,
    methods: HashSet<Method>,
    path: Option<PathPattern>,
    consumes: Vec<MediaType>,
    produces: Vec<MediaType>,
    enabled: bool,
    use_normalized_path: bool,
    name: Option<String>,
    handler: Option<Arc<dyn Handler>>,
    failure_handler: Option<Arc<dyn Handler>>,
}

/// Result of evaluating a route against a request.
pub(crate) struct RouteMatch {
    pub params: Vec<(String, String)>,
    // The part of the (normalised or raw) path the criterion consumed.
    pub matched_prefix: String,
    pub acceptable: Option<String>,
    pub handler: Arc<dyn Handler>,
}

impl Route {
    pub(super) fn new(seq: u64, router: Weak<RouterInner>) -> Self {
        Self {
            inner: Arc::new(RouteInner {
                seq,
                router,
                state: RwLock::new(RouteState {
                    order: seq as i64,
                    last: false,
                    methods: HashSet::new(),
                    path: None,
                    consumes: Vec::new(),
                    produces: Vec::new(),
                    enabled: true,
                    use_normalized_path: true,
                    name: None,
                    handler: None,
                    failure_handler: None,
                }),
            }),
        }
    }

    // ── Criteria ──────────────────────────────────────────────────────────────

    /// Adds `method` to the accepted methods. With no methods added the route
    /// accepts every method.
    pub fn method(&self, method: Method) -> &Self {
        self.inner.state.write().methods.insert(method);
        self
    }

    /// Sets the literal or parameterised path prefix this route matches.
    ///
    /// A trailing `*` or `/` is ignored; `:name` segments capture path
    /// parameters.
    pub fn path(&self, path: &str) -> &Self {
        self.inner.state.write().path = Some(PathPattern::parse(path));
        self
    }

    /// Sets a regular expression the start of the path must match.
    ///
    /// Named groups become path parameters under their name, unnamed groups
    /// under `param0`, `param1`, ... by position.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InvalidRegex`] if the expression does not compile.
    pub fn path_regex(&self, regex: &str) -> Result<&Self, RouterError> {
        self.set_pattern(PathPattern::regex(regex)?);
        Ok(self)
    }

    pub(super) fn set_pattern(&self, pattern: PathPattern) {
        self.inner.state.write().path = Some(pattern);
    }

    /// Adds a media type the request `Content-Type` may carry. A trailing
    /// `*` subtype (`text/*`) accepts any subtype.
    ///
    /// # Panics
    ///
    /// Panics if `content_type` is not a `type/subtype` media type. Route
    /// definitions are static, so a malformed one is a programming error.
    pub fn consumes(&self, content_type: &str) -> &Self {
        let media = parse_declared(content_type);
        self.inner.state.write().consumes.push(media);
        self
    }

    /// Adds a media type this route can produce for `Accept` negotiation.
    ///
    /// # Panics
    ///
    /// Panics if `content_type` is not a `type/subtype` media type.
    pub fn produces(&self, content_type: &str) -> &Self {
        let media = parse_declared(content_type);
        self.inner.state.write().produces.push(media);
        self
    }

    /// Sets the dispatch order. Routes run in ascending order; equal orders
    /// keep insertion order.
    pub fn order(&self, order: i64) -> &Self {
        {
            let mut state = self.inner.state.write();
            state.order = order;
            state.last = false;
        }
        self.resort();
        self
    }

    /// Moves the route after every route not marked last.
    pub fn last(&self) -> &Self {
        self.inner.state.write().last = true;
        self.resort();
        self
    }

    /// Chooses whether the path criterion sees the normalised path (the
    /// default) or the raw request path.
    pub fn use_normalized_path(&self, use_normalized: bool) -> &Self {
        self.inner.state.write().use_normalized_path = use_normalized;
        self
    }

    /// Attaches a name, used in log output.
    pub fn name(&self, name: impl Into<String>) -> &Self {
        self.inner.state.write().name = Some(name.into());
        self
    }

    pub fn enable(&self) -> &Self {
        self.inner.state.write().enabled = true;
        self
    }

    /// Disabled routes are skipped by dispatch but keep their position.
    pub fn disable(&self) -> &Self {
        self.inner.state.write().enabled = false;
        self
    }

    /// Detaches the route from its router. Requests already being dispatched
    /// may still reach it.
    pub fn remove(&self) -> &Self {
        if let Some(router) = self.inner.router.upgrade() {
            Router::from_inner(router).remove_route(self);
        }
        self
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    /// Sets the handler run when the route matches on the normal chain.
    ///
    /// ```rust,no_run
    /// use switchyard::Router;
    ///
    /// let router = Router::new();
    /// router.get("/slow").handler(|ctx| {
    ///     Box::pin(async move {
    ///         tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    ///         ctx.end();
    ///         Ok(())
    ///     })
    /// });
    /// ```
    pub fn handler<F>(&self, handler: F) -> &Self
    where
        F: for<'a> Fn(&'a mut RoutingContext) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.handled_by(handler)
    }

    /// Sets a handler that completes without awaiting.
    pub fn sync_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn(&mut RoutingContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.handled_by(SyncHandler(handler))
    }

    /// Sets a [`Handler`] implementation as the normal-chain handler.
    pub fn handled_by<H: Handler>(&self, handler: H) -> &Self {
        self.inner.state.write().handler = Some(Arc::new(handler));
        self
    }

    /// Sets the handler run when the route matches on the failure chain.
    pub fn failure_handler<F>(&self, handler: F) -> &Self
    where
        F: for<'a> Fn(&'a mut RoutingContext) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.failure_handled_by(handler)
    }

    pub fn sync_failure_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn(&mut RoutingContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.failure_handled_by(SyncHandler(handler))
    }

    pub fn failure_handled_by<H: Handler>(&self, handler: H) -> &Self {
        self.inner.state.write().failure_handler = Some(Arc::new(handler));
        self
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    /// The path criterion as configured, if any.
    pub fn get_path(&self) -> Option<String> {
        self.inner
            .state
            .read()
            .path
            .as_ref()
            .map(|p| p.as_str().to_owned())
    }

    pub fn is_regex_path(&self) -> bool {
        self.inner
            .state
            .read()
            .path
            .as_ref()
            .is_some_and(PathPattern::is_regex)
    }

    pub fn get_name(&self) -> Option<String> {
        self.inner.state.read().name.clone()
    }

    pub fn get_order(&self) -> i64 {
        self.inner.state.read().order
    }

    pub fn is_last(&self) -> bool {
        self.inner.state.read().last
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.read().enabled
    }

    /// The accepted methods, in no particular order.
    pub fn methods(&self) -> Vec<Method> {
        self.inner.state.read().methods.iter().cloned().collect()
    }

    pub fn has_handler(&self) -> bool {
        self.inner.state.read().handler.is_some()
    }

    pub fn has_failure_handler(&self) -> bool {
        self.inner.state.read().failure_handler.is_some()
    }

    /// Whether this route would accept the request in `ctx`, evaluated
    /// against the path relative to the current mount point.
    ///
    /// Ignores whether a handler is set and never mutates `ctx`.
    pub fn matches(&self, ctx: &RoutingContext) -> bool {
        let state = self.inner.state.read();
        criteria_match(
            &state,
            ctx.request(),
            ctx.normalised_path(),
            ctx.path_from_mount_point(),
        )
        .is_some()
    }

    // ── Dispatch internals ────────────────────────────────────────────────────

    // Match the route for the chain in progress. Routes lacking a handler for
    // that chain never match.
    pub(crate) fn evaluate(
        &self,
        request: &Request,
        path: &str,
        raw_path: &str,
        failed: bool,
    ) -> Option<RouteMatch> {
        let state = self.inner.state.read();
        let handler = if failed {
            state.failure_handler.clone()?
        } else {
            state.handler.clone()?
        };
        let (params, matched_prefix, acceptable) =
            criteria_match(&state, request, path, raw_path)?;
        Some(RouteMatch {
            params,
            matched_prefix,
            acceptable,
            handler,
        })
    }

    // (last, order, seq): the total order the router sorts by.
    pub(super) fn sort_key(&self) -> (bool, i64, u64) {
        let state = self.inner.state.read();
        (state.last, state.order, self.inner.seq)
    }

    pub(crate) fn label(&self) -> String {
        let state = self.inner.state.read();
        match (&state.name, &state.path) {
            (Some(name), _) => name.clone(),
            (None, Some(path)) => path.as_str().to_owned(),
            (None, None) => format!("route#{}", self.inner.seq),
        }
    }

    pub(crate) fn same_as(&self, other: &Route) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn resort(&self) {
        if let Some(router) = self.inner.router.upgrade() {
            Router::from_inner(router).resort();
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Route")
            .field("seq", &self.inner.seq)
            .field("order", &state.order)
            .field("last", &state.last)
            .field("path", &state.path.as_ref().map(PathPattern::as_str))
            .field("methods", &state.methods)
            .field("enabled", &state.enabled)
            .field("name", &state.name)
            .finish()
    }
}

fn parse_declared(content_type: &str) -> MediaType {
    match MediaType::parse(content_type) {
        Some(media) => media,
        None => panic!("invalid media type in route definition: {content_type:?}"),
    }
}

type CriteriaMatch = (Vec<(String, String)>, String, Option<String>);

fn criteria_match(
    state: &RouteState,
    request: &Request,
    path: &str,
    raw_path: &str,
) -> Option<CriteriaMatch> {
    if !state.enabled {
        return None;
    }
    if !state.methods.is_empty() && !state.methods.contains(request.method()) {
        return None;
    }

    let (params, matched_prefix) = match &state.path {
        Some(pattern) => {
            let candidate = if state.use_normalized_path {
                path
            } else {
                raw_path
            };
            let m = pattern.matches(candidate)?;
            (m.params, candidate[..m.matched_len].to_owned())
        }
        None => (Vec::new(), String::new()),
    };

    if !state.consumes.is_empty() {
        let content_type = MediaType::parse(request.content_type()?)?;
        if !state.consumes.iter().any(|c| c.accepts(&content_type)) {
            return None;
        }
    }

    let mut acceptable = None;
    if !state.produces.is_empty() {
        if let Some(accept) = request.accept() {
            let chosen = negotiate(&parse_accept(accept), &state.produces)?;
            acceptable = Some(chosen.to_string());
        }
    }

    Some((params, matched_prefix, acceptable))
}
