//! # switchyard
//!
//! Ordered request routing for async HTTP services: routes matched in
//! priority order, a failure chain for recovering from errors, sub-routers
//! mounted under a path prefix, content negotiation and expiring sessions.
//!
//! A [`Router`] holds an ordered list of [`Route`]s. Each request gets a
//! [`RoutingContext`] that walks the matching routes: a handler passes the
//! request on with [`next`](RoutingContext::next), ends the response, or
//! [`fail`](RoutingContext::fail)s it, at which point only failure handlers
//! run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use switchyard::middleware::Logger;
//! use switchyard::{Router, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = Router::new();
//!     router.route().handled_by(Logger);
//!     router.get("/hello/:name").sync_handler(|ctx| {
//!         let name = ctx.path_param("name").unwrap_or("world").to_owned();
//!         ctx.response_mut().set_body(format!("Hello, {name}!"));
//!         ctx.end();
//!         Ok(())
//!     });
//!     router.route_at("/admin").sync_handler(|ctx| {
//!         ctx.fail(StatusCode::FORBIDDEN);
//!         Ok(())
//!     });
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://{}", server.local_addr());
//!     server.serve(router).await?;
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod http;
pub mod middleware;
pub mod router;
pub mod server;
pub mod session;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::RoutingContext;
pub use http::{Cookie, Headers, Method, Request, Response, StatusCode};
pub use router::{Handler, HandlerResult, HttpError, Route, Router, RouterError};
pub use server::{Server, ServerError};
pub use session::{Session, SessionError, SessionStore};
