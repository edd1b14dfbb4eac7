//! Per-request routing state.
//!
//! A [`RoutingContext`] is created for every request a [`Router`] accepts and
//! is handed, by exclusive reference, to each handler dispatch reaches. It
//! carries:
//!
//! - the request and the response being built;
//! - a string-keyed [`Data`] map for passing values between handlers;
//! - cookies, the session and path parameters;
//! - the dispatch position (current route, mount point, relative path);
//! - the failure state (`failed`, status code, error);
//! - hooks fired when the headers or the body are finalised.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::http::Cookie;
use crate::router::{HttpError, Route, Router, normalize_path};
use crate::session::Session;
use crate::{Method, Request, Response, StatusCode};

mod dispatch;

/// Type-erased per-request values, keyed by name.
///
/// Handlers use it to hand data down the chain without knowing about each
/// other's types.
///
/// ```
/// use switchyard::context::Data;
///
/// let mut data = Data::new();
/// data.insert("user_id", 42u64);
/// assert_eq!(data.get::<u64>("user_id"), Some(&42));
/// assert_eq!(data.get::<String>("user_id"), None);
/// ```
#[derive(Default)]
pub struct Data {
    map: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing whatever was stored under `key`.
    pub fn insert<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(key.into(), Box::new(value));
    }

    /// Get the value under `key` if it has type `T`.
    pub fn get<T>(&self, key: &str) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map.get(key).and_then(|value| value.downcast_ref::<T>())
    }

    /// Get a mutable reference to the value under `key` if it has type `T`.
    pub fn get_mut<T>(&mut self, key: &str) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(key)
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Remove the value under `key`. Returns it if it had type `T`; a value of
    /// another type is removed all the same.
    pub fn remove<T>(&mut self, key: &str) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(key)
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Path parameters captured by the routes matched so far.
#[derive(Default, Debug, Clone)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A file received in a multipart request and stored on disk.
///
/// The router does not parse multipart bodies itself; a body handler fills
/// these in through [`RoutingContext::add_file_upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    name: String,
    file_name: String,
    content_type: String,
    uploaded_path: PathBuf,
    size: u64,
}

impl FileUpload {
    pub fn new(
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        uploaded_path: impl Into<PathBuf>,
        size: u64,
    ) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            uploaded_path: uploaded_path.into(),
            size,
        }
    }

    /// Name of the form field.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File name the client supplied.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Where the upload was written.
    pub fn uploaded_path(&self) -> &Path {
        &self.uploaded_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

type HeadersEndHook = Box<dyn FnOnce(&mut Response) + Send>;
type BodyEndHook = Box<dyn FnOnce(&Response) + Send>;

// How the running handler handed control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Next,
    Fail,
    Reroute,
}

// One level of router nesting: the root router, or a mounted sub-router.
struct Frame {
    router: Router,
    routes: Arc<[Route]>,
    cursor: usize,
    mount_point: Option<String>,
    // Path relative to `mount_point`, normalised and raw.
    path: String,
    raw_path: String,
}

/// State of one request as it travels through the routers.
///
/// # Handing over
///
/// Every handler must leave the context in one of three ways before its
/// future completes: call [`next`](Self::next), call [`fail`](Self::fail) (or
/// return `Err`), or end the response with [`end`](Self::end) /
/// [`respond`](Self::respond). A handler that does none of these is treated
/// as an error and the request fails with 500.
pub struct RoutingContext {
    request: Request,
    response: Response,
    ended: bool,
    root: Router,
    data: Data,
    params: PathParams,
    cookies: Vec<Cookie>,
    session: Option<Session>,
    body: Bytes,
    uploads: Vec<FileUpload>,
    frames: Vec<Frame>,
    current_route: Option<Route>,
    matched_prefix: String,
    status_code: Option<u16>,
    failed: bool,
    failure: Option<anyhow::Error>,
    acceptable_content_type: Option<String>,
    headers_end: BTreeMap<u32, HeadersEndHook>,
    body_end: BTreeMap<u32, BodyEndHook>,
    next_hook_id: u32,
    signal: Option<Signal>,
}

impl RoutingContext {
    /// Create the context for `request`, positioned before the first route of
    /// `router`.
    ///
    /// An empty path fails the request with 400 and a path without a leading
    /// `/` fails it with 404.
    pub fn new(request: Request, router: Router) -> Self {
        let body = request.body().clone();
        let cookies = request
            .headers()
            .get_all("cookie")
            .flat_map(Cookie::parse_header)
            .collect();

        let mut ctx = Self {
            request,
            response: Response::default(),
            ended: false,
            root: router,
            data: Data::new(),
            params: PathParams::new(),
            cookies,
            session: None,
            body,
            uploads: Vec::new(),
            frames: Vec::new(),
            current_route: None,
            matched_prefix: String::new(),
            status_code: None,
            failed: false,
            failure: None,
            acceptable_content_type: None,
            headers_end: BTreeMap::new(),
            body_end: BTreeMap::new(),
            next_hook_id: 0,
            signal: None,
        };
        ctx.reset_frames();

        let path = ctx.request.path();
        let invalid = if path.is_empty() {
            Some(StatusCode::BAD_REQUEST)
        } else if !path.starts_with('/') {
            Some(StatusCode::NOT_FOUND)
        } else {
            None
        };
        if let Some(status) = invalid {
            ctx.fail(status);
        }
        ctx
    }

    // ── Flow control ──────────────────────────────────────────────────────────

    /// Pass the request to the next matching route.
    ///
    /// Only the first hand-over of a handler counts: a second `next`, or a
    /// `next` after the response ended, is logged and ignored.
    pub fn next(&mut self) {
        if self.ended {
            debug!("next() called after the response ended; ignoring");
            return;
        }
        match self.signal {
            None => self.signal = Some(Signal::Next),
            Some(previous) => {
                warn!(?previous, "next() called twice by the same handler; ignoring");
            }
        }
    }

    /// Fail the request with `status`.
    ///
    /// The first failure restarts dispatch at the top of the root router with
    /// failure handlers only. Failing again from a failure handler replaces the
    /// status and carries on from the current position.
    pub fn fail(&mut self, status: impl Into<StatusCode>) {
        self.fail_inner(status.into().as_u16(), None);
    }

    /// Fail the request with an error. The status is taken from an
    /// [`HttpError`] in the error's chain, or 500.
    pub fn fail_with(&mut self, error: impl Into<anyhow::Error>) {
        let error = error.into();
        let status = http_status(&error).unwrap_or(500);
        self.fail_inner(status, Some(error));
    }

    fn fail_inner(&mut self, status: u16, error: Option<anyhow::Error>) {
        if self.ended {
            warn!(status, "fail() called after the response ended; ignoring");
            return;
        }
        self.status_code = Some(status);
        if error.is_some() {
            self.failure = error;
        }
        if !self.failed {
            self.failed = true;
            self.restart_at_root();
        }
        self.signal = Some(Signal::Fail);
    }

    /// Restart dispatch with a different method and path.
    ///
    /// Path parameters, the failure state, the pending response and the end
    /// hooks are discarded; data, cookies and the session survive.
    pub fn reroute(&mut self, method: Method, path: &str) {
        if self.ended {
            warn!(path, "reroute() called after the response ended; ignoring");
            return;
        }
        debug!(%method, path, "rerouting");
        self.request.change_to(method, path);
        self.response = Response::default();
        self.params.clear();
        self.status_code = None;
        self.failed = false;
        self.failure = None;
        self.acceptable_content_type = None;
        self.current_route = None;
        self.headers_end.clear();
        self.body_end.clear();
        self.reset_frames();
        self.signal = Some(Signal::Reroute);
    }

    // ── Response ──────────────────────────────────────────────────────────────

    pub fn response(&self) -> &Response {
        &self.response
    }

    /// The pending response. Changes after [`end`](Self::end) are lost.
    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Finish the response: run the headers-end hooks (most recently added
    /// first) and emit `Set-Cookie` for every changed cookie.
    pub fn end(&mut self) {
        if self.ended {
            warn!("response already ended");
            return;
        }
        let hooks = std::mem::take(&mut self.headers_end);
        for (_, hook) in hooks.into_iter().rev() {
            hook(&mut self.response);
        }
        for cookie in self.cookies.iter().filter(|c| c.is_changed()) {
            self.response.add_header("Set-Cookie", cookie.encode());
        }
        self.ended = true;
    }

    /// Replace the pending response with `response` and end it.
    pub fn respond(&mut self, response: Response) {
        if self.ended {
            warn!("response already ended");
            return;
        }
        self.response = response;
        self.end();
    }

    /// Serialise `value` as the JSON body and end the response.
    pub fn end_json<T: Serialize>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        self.response
            .set_header("Content-Type", "application/json");
        self.response.set_body(body);
        self.end();
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Register a hook run just before the response is finalised. Returns an
    /// id for [`remove_headers_end_handler`](Self::remove_headers_end_handler).
    pub fn add_headers_end_handler<F>(&mut self, hook: F) -> u32
    where
        F: FnOnce(&mut Response) + Send + 'static,
    {
        let id = self.next_hook_id();
        self.headers_end.insert(id, Box::new(hook));
        id
    }

    pub fn remove_headers_end_handler(&mut self, id: u32) -> bool {
        self.headers_end.remove(&id).is_some()
    }

    /// Register a hook run once the response is complete, most recently
    /// added first.
    pub fn add_body_end_handler<F>(&mut self, hook: F) -> u32
    where
        F: FnOnce(&Response) + Send + 'static,
    {
        let id = self.next_hook_id();
        self.body_end.insert(id, Box::new(hook));
        id
    }

    pub fn remove_body_end_handler(&mut self, id: u32) -> bool {
        self.body_end.remove(&id).is_some()
    }

    fn next_hook_id(&mut self) -> u32 {
        let id = self.next_hook_id;
        self.next_hook_id = self.next_hook_id.wrapping_add(1);
        id
    }

    // ── Request ───────────────────────────────────────────────────────────────

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn path_params(&self) -> &PathParams {
        &self.params
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.request.query_param(name)
    }

    /// The request body, unless a handler replaced it.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn body_as_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON.
    pub fn body_json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }

    pub fn file_uploads(&self) -> &[FileUpload] {
        &self.uploads
    }

    pub fn add_file_upload(&mut self, upload: FileUpload) {
        self.uploads.push(upload);
    }

    // ── Data ──────────────────────────────────────────────────────────────────

    pub fn put<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.data.insert(key, value);
    }

    pub fn get<T>(&self, key: &str) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.data.get(key)
    }

    pub fn get_mut<T>(&mut self, key: &str) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.data.get_mut(key)
    }

    pub fn remove<T>(&mut self, key: &str) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.data.remove(key)
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    // ── Cookies and session ───────────────────────────────────────────────────

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name() == name)
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Add a cookie to send back, replacing any cookie with the same name.
    pub fn add_cookie(&mut self, cookie: Cookie) {
        self.cookies.retain(|c| c.name() != cookie.name());
        self.cookies.push(cookie);
    }

    /// Expire the named cookie on the client. Returns the cookie as it was.
    pub fn remove_cookie(&mut self, name: &str) -> Option<Cookie> {
        let cookie = self.cookies.iter_mut().find(|c| c.name() == name)?;
        let previous = cookie.clone();
        cookie.set_value("").set_max_age(0);
        Some(previous)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    // ── Dispatch position ─────────────────────────────────────────────────────

    /// The route whose handler is running.
    pub fn current_route(&self) -> Option<&Route> {
        self.current_route.as_ref()
    }

    /// Where the router currently dispatching was mounted; `None` at the root.
    pub fn mount_point(&self) -> Option<&str> {
        self.frames.last().and_then(|f| f.mount_point.as_deref())
    }

    /// The normalised path, relative to the mount point.
    pub fn normalised_path(&self) -> &str {
        self.frames
            .last()
            .map_or_else(|| self.request.path(), |f| f.path.as_str())
    }

    /// The raw request path, relative to the mount point.
    pub fn path_from_mount_point(&self) -> &str {
        self.frames
            .last()
            .map_or_else(|| self.request.path(), |f| f.raw_path.as_str())
    }

    /// The media type chosen from the current route's `produces` list.
    pub fn acceptable_content_type(&self) -> Option<&str> {
        self.acceptable_content_type.as_deref()
    }

    // ── Failure state ─────────────────────────────────────────────────────────

    /// `true` once the request has failed; failure handlers are running.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// The status the request failed with.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// The error the request failed with, if it failed with one.
    pub fn failure(&self) -> Option<&anyhow::Error> {
        self.failure.as_ref()
    }

    /// Consume the context, yielding the response.
    pub fn into_response(self) -> Response {
        self.response
    }

    // ── Frames ────────────────────────────────────────────────────────────────

    fn reset_frames(&mut self) {
        let path = self.request.path().to_owned();
        self.frames.clear();
        self.frames.push(Frame {
            router: self.root.clone(),
            routes: self.root.snapshot(),
            cursor: 0,
            mount_point: None,
            path: normalize_path(&path),
            raw_path: path,
        });
    }

    fn restart_at_root(&mut self) {
        self.frames.truncate(1);
        if let Some(root) = self.frames.first_mut() {
            root.routes = root.router.snapshot();
            root.cursor = 0;
        }
    }

    /// Push a frame for `router`, mounted at the prefix the current route
    /// consumed, and continue dispatch inside it.
    pub(crate) fn enter_router(&mut self, router: Router) {
        let Some(parent) = self.frames.last() else {
            return;
        };
        let prefix = self.matched_prefix.as_str();
        let path = rooted(parent.path.strip_prefix(prefix).unwrap_or(&parent.path));
        let raw_path = rooted(
            parent
                .raw_path
                .strip_prefix(prefix)
                .unwrap_or(&parent.raw_path),
        );
        let mount_point = join_mount(parent.mount_point.as_deref(), prefix);
        debug!(mount_point = %mount_point, path = %path, "entering sub-router");

        self.frames.push(Frame {
            routes: router.snapshot(),
            router,
            cursor: 0,
            mount_point: Some(mount_point),
            path,
            raw_path,
        });
        self.next();
    }
}

fn http_status(error: &anyhow::Error) -> Option<u16> {
    error
        .chain()
        .find_map(|e| e.downcast_ref::<HttpError>())
        .map(|e| e.status().as_u16())
}

fn rooted(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

fn join_mount(parent: Option<&str>, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let joined = match parent {
        None => prefix.to_owned(),
        Some(parent) => format!("{}{}", parent.trim_end_matches('/'), prefix),
    };
    if joined.is_empty() {
        "/".to_owned()
    } else {
        joined
    }
}
