//! Async TCP transport using Tokio.
//!
//! Accepts TCP connections, parses HTTP/1.1 requests and hands each one to
//! [`Router::accept`]. Persistent connections (keep-alive) are supported; the
//! transport adds nothing to routing.

use std::net::SocketAddr;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::Router;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The HTTP/1.1 listener in front of a [`Router`].
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard::{Router, Server};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let router = Router::new();
///     router.get("/").sync_handler(|ctx| {
///         ctx.response_mut().set_body("Hello!");
///         ctx.end();
///         Ok(())
///     });
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.serve(router).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections and routes every request through `router`.
    ///
    /// Each connection runs on its own Tokio task sharing a clone of the
    /// router, so routes added or removed while serving affect requests that
    /// arrive afterwards.
    ///
    /// This method runs until the process is terminated or an unrecoverable
    /// listener error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn serve(self, router: Router) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "switchyard listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let router = router.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, router).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    router: Router,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    // Pipelined requests may already be buffered after a response is written.
    let mut need_more = true;

    loop {
        if need_more {
            let bytes_read = stream.read_buf(&mut buf).await?;
            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
        }

        // Guard against excessively large requests.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PAYLOAD_TOO_LARGE)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // Attempt to parse the buffered data as an HTTP request.
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                // Headers not yet fully received; read more data.
                need_more = true;
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BAD_REQUEST)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            need_more = true;
            continue;
        }

        let consumed = buf.split_to(total_needed).freeze();
        let request = request.with_body(consumed.slice(body_offset..));
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = router.accept(request).await.keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
        need_more = buf.is_empty();
    }

    Ok(())
}
