//! The handler contract.
//!
//! A handler receives the per-request [`RoutingContext`] and consumes it in
//! exactly one of three ways before its future completes:
//!
//! - [`RoutingContext::next`]: continue with the next matching route;
//! - [`RoutingContext::fail`]: switch to the failure chain;
//! - [`RoutingContext::end`] / [`RoutingContext::respond`]: finish the response.
//!
//! Returning `Err` from a handler is the Rust rendering of "the handler threw":
//! the router's exception handler is notified and the request moves onto the
//! failure chain.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::StatusCode;
use crate::context::RoutingContext;

/// A heap-allocated, type-erased future borrowed for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What every handler returns.
pub type HandlerResult = Result<(), anyhow::Error>;

/// An error that carries the HTTP status the failure chain should see.
///
/// Returning it from a handler (directly or through `?` into
/// [`anyhow::Error`]) selects `status` instead of the default 500.
///
/// ```
/// use switchyard::router::HttpError;
///
/// let err = HttpError::new(409, "version mismatch");
/// assert_eq!(err.status().as_u16(), 409);
/// ```
#[derive(Debug, Error)]
#[error("HTTP {status}: {message}")]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: impl Into<StatusCode>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Anything that can process a [`RoutingContext`].
///
/// Implemented automatically for functions and closures of the shape
/// `for<'a> Fn(&'a mut RoutingContext) -> BoxFuture<'a, HandlerResult>`:
///
/// ```rust,no_run
/// use switchyard::context::RoutingContext;
/// use switchyard::router::{BoxFuture, HandlerResult};
///
/// fn stamp(ctx: &mut RoutingContext) -> BoxFuture<'_, HandlerResult> {
///     Box::pin(async move {
///         ctx.put("stamped", true);
///         ctx.next();
///         Ok(())
///     })
/// }
/// ```
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because handlers are shared by
///   every request the router serves.
/// - The returned future may await I/O before continuing; the chain for this
///   request is suspended until it completes.
pub trait Handler: Send + Sync + 'static {
    /// Process the request held by `ctx`.
    fn handle<'a>(&'a self, ctx: &'a mut RoutingContext) -> BoxFuture<'a, HandlerResult>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut RoutingContext) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, ctx: &'a mut RoutingContext) -> BoxFuture<'a, HandlerResult> {
        (self)(ctx)
    }
}

// Adapter for handlers that never await.
pub(crate) struct SyncHandler<F>(pub F);

impl<F> Handler for SyncHandler<F>
where
    F: Fn(&mut RoutingContext) -> HandlerResult + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, ctx: &'a mut RoutingContext) -> BoxFuture<'a, HandlerResult> {
        Box::pin(std::future::ready((self.0)(ctx)))
    }
}
