//! The dispatch loop.
//!
//! Dispatch is a cursor walk over a stack of route-list snapshots, one per
//! router entered. Handlers never call each other: they leave a [`Signal`] on
//! the context and the loop acts on it once the handler's future completes, so
//! a long chain of handlers never grows the call stack.

use std::sync::Arc;

use tracing::{debug, error, trace};

use super::{RoutingContext, http_status};
use crate::Method;
use crate::router::Handler;

const NOT_FOUND_PAGE: &str = "<html><body><h1>Resource not found</h1></body></html>";

impl RoutingContext {
    /// Run the request through the routers until the response ends, then fire
    /// the body-end hooks.
    pub(crate) async fn dispatch(&mut self) {
        while !self.ended {
            let Some(handler) = self.advance() else {
                self.finish_unmatched().await;
                break;
            };

            let was_failing = self.failed;
            self.signal = None;
            let outcome = handler.handle(self).await;

            let error = match outcome {
                Err(err) => Some(err),
                Ok(()) if !self.ended && self.signal.is_none() => {
                    let label = self
                        .current_route
                        .as_ref()
                        .map(|r| r.label())
                        .unwrap_or_default();
                    Some(anyhow::anyhow!(
                        "handler for `{label}` returned without ending the response, calling next() or failing"
                    ))
                }
                Ok(()) => None,
            };

            if let Some(err) = error {
                if self.handler_error(err, was_failing) {
                    let status = self.status_code.unwrap_or(500);
                    self.render_error(status).await;
                    break;
                }
            }
        }

        let hooks = std::mem::take(&mut self.body_end);
        for (_, hook) in hooks.into_iter().rev() {
            hook(&self.response);
        }
    }

    // Find the next route that matches in the innermost router, popping
    // exhausted sub-routers back to their parent.
    fn advance(&mut self) -> Option<Arc<dyn Handler>> {
        loop {
            let failed = self.failed;
            let depth = self.frames.len();
            let frame = self.frames.last_mut()?;

            if frame.cursor >= frame.routes.len() {
                if depth == 1 {
                    return None;
                }
                let done = self.frames.pop();
                trace!(
                    mount_point = ?done.and_then(|f| f.mount_point),
                    "sub-router exhausted"
                );
                continue;
            }

            let route = frame.routes[frame.cursor].clone();
            frame.cursor += 1;
            let Some(matched) = route.evaluate(&self.request, &frame.path, &frame.raw_path, failed)
            else {
                continue;
            };

            trace!(route = %route.label(), failed, "route matched");
            for (name, value) in matched.params {
                self.params.insert(name, value);
            }
            if matched.acceptable.is_some() {
                self.acceptable_content_type = matched.acceptable;
            }
            self.matched_prefix = matched.matched_prefix;
            self.current_route = Some(route);
            return Some(matched.handler);
        }
    }

    // A handler returned `Err`. Returns `true` when no failure handler can
    // take over and the error must be rendered now.
    fn handler_error(&mut self, err: anyhow::Error, was_failing: bool) -> bool {
        self.notify_exception_handler(&err);
        if self.ended {
            return false;
        }

        if was_failing {
            if let Some(status) = http_status(&err) {
                self.status_code = Some(status);
            }
            error!(error = %err, "failure handler returned an error");
            self.failure = Some(err);
            return true;
        }

        let status = http_status(&err).or(self.status_code).unwrap_or(500);
        debug!(status, error = %err, "handler returned an error");
        self.fail_inner(status, Some(err));
        false
    }

    // Offer the error to the innermost router that has an exception handler.
    fn notify_exception_handler(&self, err: &anyhow::Error) {
        let handler = self
            .frames
            .iter()
            .rev()
            .find_map(|f| f.router.exception_handler_ref())
            .or_else(|| self.root.exception_handler_ref());
        if let Some(handler) = handler {
            handler(err);
        }
    }

    async fn finish_unmatched(&mut self) {
        let status = if self.failed {
            let status = self.status_code.unwrap_or(500);
            debug!(status, "failure not handled by any route");
            status
        } else {
            debug!(path = self.request.path(), "no route matched");
            404
        };
        self.render_error(status).await;
    }

    // Render `status` with the root router's error handler for it, falling
    // back to the built-in page.
    async fn render_error(&mut self, status: u16) {
        if let Some(handler) = self.root.error_handler_for(status) {
            self.signal = None;
            if let Err(err) = handler.handle(self).await {
                error!(status, error = %err, "error handler returned an error");
            }
            if self.ended {
                return;
            }
        }

        self.response.set_status(status);
        if self.request.method() == &Method::Head {
            self.response.set_body(Vec::new());
        } else if status == 404 {
            self.response
                .set_header("Content-Type", "text/html; charset=utf-8");
            self.response.set_body(NOT_FOUND_PAGE);
        } else {
            let reason = self.response.status().canonical_reason();
            self.response.set_body(reason);
        }
        self.end();
    }
}
