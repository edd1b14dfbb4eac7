//! HTTP/1.1 request parsing using the [`httparse`] crate.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request body exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },
}

/// An HTTP/1.1 request as seen by the router.
///
/// Created by [`Request::parse`] from a raw byte buffer, or by [`Request::new`]
/// when a request is synthesised in code (tests, alternate transports). The
/// body is stored as a [`Bytes`] buffer.
///
/// # Examples
///
/// ```
/// use switchyard::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
    params: HashMap<String, String>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Builds an HTTP/1.1 request for `target` (path plus optional query) with no
    /// headers and an empty body.
    ///
    /// ```
    /// use switchyard::{Method, Request};
    ///
    /// let req = Request::new(Method::Post, "/items?draft=1")
    ///     .with_header("Content-Type", "application/json")
    ///     .with_body(r#"{"name":"bolt"}"#);
    /// assert_eq!(req.path(), "/items");
    /// assert_eq!(req.content_type(), Some("application/json"));
    /// ```
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        let params = query.as_deref().map(parse_query_string).unwrap_or_default();
        Self {
            method,
            path,
            version: 1,
            headers: Headers::new(),
            query,
            body: Bytes::new(),
            params,
        }
    }

    /// Appends a header; builder-style companion of [`Request::new`].
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the body; builder-style companion of [`Request::new`].
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf` (i.e. immediately after the `\r\n\r\n` header terminator).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw_req.method {
            Some(m) => match m.parse() {
                Ok(method) => method,
                Err(never) => match never {},
            },
            None => return Err(RequestError::MissingField { field: "method" }),
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let (path, query) = split_target(raw_path);

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let params = query.as_deref().map(parse_query_string).unwrap_or_default();
        let body = Bytes::copy_from_slice(&buf[body_offset..]);

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                body,
                params,
            },
            body_offset,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a parsed query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the raw `Content-Type` header, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// Returns the raw `Accept` header, if any.
    pub fn accept(&self) -> Option<&str> {
        self.headers.get("accept")
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1, // HTTP/1.1 default: keep-alive
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }

    // Used by `RoutingContext::reroute`: the request keeps its headers and body
    // but takes on a new method and target.
    pub(crate) fn change_to(&mut self, method: Method, target: &str) {
        let (path, query) = split_target(target);
        self.params = query.as_deref().map(parse_query_string).unwrap_or_default();
        self.method = method;
        self.path = path;
        self.query = query;
    }
}

// Split `/path?query` into its two halves.
fn split_target(target: &str) -> (String, Option<String>) {
    match target.find('?') {
        Some(pos) => (target[..pos].to_owned(), Some(target[pos + 1..].to_owned())),
        None => (target.to_owned(), None),
    }
}

/// Parses a URL query string (`key=value&key2=value2`) into a `HashMap`.
///
/// Keys and values have `+` decoded as a space. Full percent-decoding is left to
/// body/query parsing handlers.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.replace('+', " ");
            let value = parts.next().unwrap_or("").replace('+', " ");
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.method().as_str(), "GET");
        assert_eq!(req.path(), "/");
        assert_eq!(req.version(), 1);
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len()); // no body
    }

    #[test]
    fn parse_query_string() {
        let raw = b"GET /search?q=rust&page=2 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=rust&page=2"));
        assert_eq!(req.query_param("q"), Some("rust"));
        assert_eq!(req.query_param("page"), Some("2"));
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn connection_close() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn built_request_exposes_negotiation_headers() {
        let req = Request::new(Method::Get, "/a?x=1")
            .with_header("Accept", "text/html")
            .with_header("Content-Type", "text/plain");
        assert_eq!(req.accept(), Some("text/html"));
        assert_eq!(req.content_type(), Some("text/plain"));
        assert_eq!(req.query_param("x"), Some("1"));
        assert!(req.is_keep_alive());
    }

    #[test]
    fn change_to_replaces_method_path_and_query() {
        let mut req = Request::new(Method::Post, "/old?a=1").with_body("payload");
        req.change_to(Method::Get, "/new?b=2");
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.path(), "/new");
        assert_eq!(req.query_param("a"), None);
        assert_eq!(req.query_param("b"), Some("2"));
        assert_eq!(req.body().as_ref(), b"payload");
    }
}
