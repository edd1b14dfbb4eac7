//! Built-in handlers that decorate every request they see.
//!
//! Both are ordinary [`Handler`]s: install them on a catch-all route ahead of
//! the application routes and they continue the chain straight away, doing
//! their work from the response hooks.
//!
//! - [`Logger`] logs each request's method, path, status and duration once
//!   the response is complete.
//! - [`ResponseTime`] stamps an `X-Response-Time` header.

use tokio::time::Instant;

use crate::context::RoutingContext;
use crate::router::{BoxFuture, Handler, HandlerResult};

/// Logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` line when the response body is complete,
/// in the format:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
///
/// The path is the one the request arrived with, before any mount point
/// rewriting or reroute.
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard::Router;
/// use switchyard::middleware::Logger;
///
/// let router = Router::new();
/// router.route().order(-1).handled_by(Logger);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Logger;

impl Handler for Logger {
    fn handle<'a>(&'a self, ctx: &'a mut RoutingContext) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.method().as_str().to_owned();
            let path = ctx.request().path().to_owned();

            ctx.add_body_end_handler(move |response| {
                let duration = start.elapsed();
                let status = response.status().as_u16();
                tracing::info!("{} {} - {} ({:?})", method, path, status, duration);
            });
            ctx.next();
            Ok(())
        })
    }
}

/// Adds an `X-Response-Time` header holding the time from this handler to the
/// response being finalised, in milliseconds (`"12ms"`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseTime;

impl ResponseTime {
    pub const HEADER: &'static str = "X-Response-Time";
}

impl Handler for ResponseTime {
    fn handle<'a>(&'a self, ctx: &'a mut RoutingContext) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let start = Instant::now();
            ctx.add_headers_end_handler(move |response| {
                let millis = start.elapsed().as_millis();
                response.set_header(Self::HEADER, format!("{millis}ms"));
            });
            ctx.next();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::{Method, Request, Router, StatusCode};

    fn hello(router: &Router) {
        router.get("/hello").sync_handler(|ctx| {
            ctx.response_mut().set_body("hi");
            ctx.end();
            Ok(())
        });
    }

    #[tokio::test]
    async fn logger_passes_the_request_on() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let router = Router::new();
        router.route().handled_by(Logger);
        hello(&router);

        let res = router.accept(Request::new(Method::Get, "/hello")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.text(), "hi");

        let res = router.accept(Request::new(Method::Get, "/missing")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logger_hook_runs_after_later_body_end_hooks() {
        // Body-end hooks run most recent first, so the logger sees the final
        // response after everything registered downstream of it.
        let router = Router::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        router.route().handled_by(Logger);
        let seen = Arc::clone(&order);
        router.route().sync_handler(move |ctx| {
            let seen = Arc::clone(&seen);
            ctx.add_body_end_handler(move |res| {
                seen.lock().unwrap().push(res.status().as_u16());
            });
            ctx.next();
            Ok(())
        });
        hello(&router);

        router.accept(Request::new(Method::Get, "/hello")).await;
        assert_eq!(*order.lock().unwrap(), vec![200]);
    }

    #[tokio::test(start_paused = true)]
    async fn response_time_header_is_set() {
        let router = Router::new();
        router.route().handled_by(ResponseTime);
        router.get("/slow").handler(|ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(25)).await;
                ctx.end();
                Ok(())
            })
        });

        let res = router.accept(Request::new(Method::Get, "/slow")).await;
        let header = res.headers().get(ResponseTime::HEADER).unwrap();
        let millis: u64 = header.trim_end_matches("ms").parse().unwrap();
        assert!(millis >= 25, "{header}");
    }

    #[tokio::test]
    async fn response_time_is_set_on_error_responses() {
        let router = Router::new();
        router.route().handled_by(ResponseTime);
        router.get("/fail").sync_handler(|ctx| {
            ctx.fail(StatusCode::SERVICE_UNAVAILABLE);
            Ok(())
        });

        let res = router.accept(Request::new(Method::Get, "/fail")).await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(res.headers().get(ResponseTime::HEADER).is_some());
    }
}
