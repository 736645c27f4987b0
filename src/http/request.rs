//! HTTP/1.1 request head parsing using the [`httparse`] crate, plus the
//! per-request state the dispatch core attaches while a request is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use super::{Headers, Method};
use crate::config::Config;
use crate::context::Extensions;
use crate::router::Route;

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// Shared flag tripped when the client goes away mid-request.
///
/// The server holds one clone and the request holds another; finalization
/// checks it before committing anything to a connection that no longer exists.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// An HTTP request travelling through the dispatch core.
///
/// The raw parts (method, path, headers, body) come from the wire. The
/// dispatch core then fills in the matched route and its parameters, the
/// parsed [`data`](Self::data), and whatever middleware leaves in
/// [`extra`](Self::extra).
///
/// # Examples
///
/// ```
/// use trellis::http::{Method, Request};
///
/// let raw = b"GET /search?q=rust+lang&page=2 HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.path(), "/search");
/// assert_eq!(request.query_param("q"), Some("rust lang"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    query_params: Vec<(String, String)>,
    body: Bytes,
    route_params: HashMap<String, String>,
    data: Option<Value>,
    extra: Extensions,
    route: Option<Arc<Route>>,
    config: Arc<Config>,
    cancellation: Cancellation,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Builds a request in-process, without going through the wire parser.
    ///
    /// `target` may carry a query string.
    ///
    /// ```
    /// use trellis::http::{Method, Request};
    ///
    /// let req = Request::new(Method::Post, "/users?notify=1")
    ///     .with_header("Content-Type", "application/json")
    ///     .with_body(r#"{"name":"ada"}"#);
    /// assert_eq!(req.content_type(), Some("application/json"));
    /// assert_eq!(req.query_param("notify"), Some("1"));
    /// ```
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self::from_parts(method, path, query, 1, Headers::new())
    }

    fn from_parts(
        method: Method,
        path: String,
        query: Option<String>,
        version: u8,
        headers: Headers,
    ) -> Self {
        let query_params = query.as_deref().map(parse_query_string).unwrap_or_default();
        Self {
            method,
            path,
            version,
            headers,
            query,
            query_params,
            body: Bytes::new(),
            route_params: HashMap::new(),
            data: None,
            extra: Extensions::new(),
            route: None,
            config: Arc::new(Config::default()),
            cancellation: Cancellation::new(),
        }
    }

    /// Parses a raw HTTP/1.1 request head from a byte slice.
    ///
    /// Returns the parsed `Request` (with an empty body) and the byte offset
    /// at which the body begins in `buf`. The caller reads the body, bounded
    /// by `Content-Length`, and attaches it with [`set_body`](Self::set_body).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — more data is needed to complete the head.
    /// - [`RequestError::Parse`] — the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`] — method, path, or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let Ok(method) = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>();

        let raw_target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let (path, query) = split_target(raw_target);
        Ok((
            Self::from_parts(method, path, query, version, header_map),
            body_offset,
        ))
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Arc<Config>) -> Self {
        self.config = config;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Percent-decoded request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// First decoded value of a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All decoded query pairs, in order of appearance.
    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query_params
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 only with `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }

    /// Media type of the body with parameters (charset, boundary) stripped.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get("content-type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
    }

    /// A route parameter captured by the matched pattern.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.route_params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.route_params
    }

    pub(crate) fn set_params(&mut self, params: HashMap<String, String>) {
        self.route_params = params;
    }

    /// Parsed (and, once the validation gate has run, coerced) payload.
    ///
    /// `None` means body parsing failed; the reason is in
    /// [`extra`](Self::extra) as a [`BodyError`](crate::lifecycle::BodyError).
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn set_data(&mut self, data: Option<Value>) {
        self.data = data;
    }

    /// Looks up a top-level field of the payload object.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.as_ref()?.get(name)
    }

    /// Deserializes the payload into a typed DTO.
    pub fn data_as<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        T::deserialize(self.data.as_ref().unwrap_or(&Value::Null))
    }

    pub fn extra(&self) -> &Extensions {
        &self.extra
    }

    pub fn extra_mut(&mut self) -> &mut Extensions {
        &mut self.extra
    }

    /// The matched route. `None` outside of dispatch.
    pub fn route(&self) -> Option<&Arc<Route>> {
        self.route.as_ref()
    }

    pub(crate) fn set_route(&mut self, route: Arc<Route>) {
        self.route = Some(route);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn set_config(&mut self, config: Arc<Config>) {
        self.config = config;
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_canceled()
    }

    /// Clears everything the dispatch core attached, leaving the wire parts.
    pub fn reset(&mut self) {
        self.route_params.clear();
        self.data = None;
        self.extra.clear();
        self.route = None;
        self.cancellation = Cancellation::new();
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    let (raw_path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query.to_owned())),
        None => (target, None),
    };
    let path = urlencoding::decode(raw_path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| raw_path.to_owned());
    (path, query)
}

/// Decodes `application/x-www-form-urlencoded` pairs (`+` is a space).
pub(crate) fn parse_query_string(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
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
        assert_eq!(offset, raw.len());
        assert!(req.body().is_empty());
    }

    #[test]
    fn parse_leaves_body_to_the_caller() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.content_length(), Some(5));
        assert!(req.body().is_empty());
        assert_eq!(&raw[offset..], b"hello");
    }

    #[test]
    fn query_is_percent_decoded() {
        let raw = b"GET /s?q=caf%C3%A9&tag=a&tag=b HTTP/1.1\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.query_param("q"), Some("café"));
        assert_eq!(req.query_pairs().len(), 3);
        assert_eq!(req.query_string(), Some("q=caf%C3%A9&tag=a&tag=b"));
    }

    #[test]
    fn path_is_percent_decoded() {
        let req = Request::new(Method::Get, "/files/my%20doc");
        assert_eq!(req.path(), "/files/my doc");
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn keep_alive_rules() {
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(req.is_keep_alive());
        let (req, _) = Request::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn content_type_drops_parameters() {
        let req = Request::new(Method::Post, "/")
            .with_header("Content-Type", "multipart/form-data; boundary=xyz");
        assert_eq!(req.content_type(), Some("multipart/form-data"));
    }

    #[test]
    fn reset_clears_dispatch_state() {
        let mut req = Request::new(Method::Get, "/");
        req.set_data(Some(serde_json::json!({"a": 1})));
        req.extra_mut().insert(5u8);
        req.set_params(HashMap::from([("id".to_owned(), "1".to_owned())]));
        req.cancellation().cancel();

        req.reset();

        assert!(req.data().is_none());
        assert!(req.extra().is_empty());
        assert!(req.params().is_empty());
        assert!(!req.is_canceled());
    }

    #[test]
    fn data_as_deserializes_a_dto() {
        #[derive(serde::Deserialize)]
        struct Product {
            name: String,
            price: f64,
        }

        let mut req = Request::new(Method::Post, "/");
        req.set_data(Some(serde_json::json!({"name": "lamp", "price": 12.5})));
        let product: Product = req.data_as().unwrap();
        assert_eq!(product.name, "lamp");
        assert_eq!(product.price, 12.5);
    }
}
