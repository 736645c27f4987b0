//! Cross-Origin Resource Sharing.
//!
//! A [`CorsPolicy`] is attached to a router node with
//! [`Scope::cors`](crate::router::Scope::cors) and copied by value into every
//! subrouter created afterwards. When the router that owns the matched route
//! has a policy, the composer adds a [`CorsMiddleware`] as the outermost layer
//! of that router's own middleware, and route registration adds `OPTIONS` to
//! every route's method set so preflights are routable.
//!
//! The middleware:
//!
//! - applies the common headers (`Access-Control-Allow-Origin`,
//!   `Access-Control-Allow-Credentials`, `Access-Control-Expose-Headers`, `Vary`)
//!   to every request;
//! - treats `OPTIONS` + `Access-Control-Request-Method` as a preflight and adds
//!   `Access-Control-Allow-Methods`, `Access-Control-Allow-Headers` and
//!   `Access-Control-Max-Age`;
//! - answers a preflight with `204 No Content` without calling the rest of the
//!   chain, unless [`options_passthrough`](CorsPolicy::options_passthrough) is set.

use std::sync::Arc;
use std::time::Duration;

use crate::http::{Headers, Method, StatusCode};
use crate::middleware::{Handler, Middleware, handler};

/// CORS configuration.
///
/// Defaults allow every origin, the common methods, and the usual request
/// headers, with a 12 hour preflight cache.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use trellis::cors::CorsPolicy;
///
/// let policy = CorsPolicy::new()
///     .allowed_origins(["https://app.example.com"])
///     .allow_credentials(true)
///     .expose_header("X-Total-Count")
///     .max_age(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    exposed_headers: Vec<String>,
    allow_credentials: bool,
    max_age: Duration,
    options_passthrough: bool,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsPolicy {
    pub fn new() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: ["HEAD", "GET", "POST", "PUT", "PATCH", "DELETE"]
                .map(str::to_owned)
                .to_vec(),
            allowed_headers: [
                "Origin",
                "Accept",
                "Content-Type",
                "X-Requested-With",
                "Authorization",
            ]
            .map(str::to_owned)
            .to_vec(),
            exposed_headers: Vec::new(),
            allow_credentials: false,
            max_age: Duration::from_secs(12 * 60 * 60),
            options_passthrough: false,
        }
    }

    /// Replaces the origin allow-list. `"*"` allows every origin.
    #[must_use]
    pub fn allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn allowed_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.allowed_methods = methods.into_iter().map(|m| m.to_string()).collect();
        self
    }

    /// Replaces the request-header allow-list. An empty list reflects whatever
    /// the preflight asks for in `Access-Control-Request-Headers`.
    #[must_use]
    pub fn allowed_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn expose_header(mut self, header: impl Into<String>) -> Self {
        self.exposed_headers.push(header.into());
        self
    }

    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Lets preflight requests continue down the chain after the headers are set.
    #[must_use]
    pub fn options_passthrough(mut self, passthrough: bool) -> Self {
        self.options_passthrough = passthrough;
        self
    }

    pub fn passes_through(&self) -> bool {
        self.options_passthrough
    }

    fn is_wildcard(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    fn allowed_origin<'a>(&self, origin: &'a str) -> Option<&'a str> {
        if self.is_wildcard() {
            Some("*")
        } else if self.allowed_origins.iter().any(|o| o == origin) {
            Some(origin)
        } else {
            None
        }
    }

    /// Headers sent on every response for a request carrying `Origin`.
    pub fn apply_common_headers(&self, request: &Headers, response: &mut Headers) {
        let Some(origin) = request.get("origin") else {
            return;
        };
        if !self.is_wildcard() {
            response.insert("Vary", "Origin");
        }
        let Some(allow) = self.allowed_origin(origin) else {
            return;
        };
        // Browsers reject "*" alongside credentials; echo the origin instead.
        let allow = if allow == "*" && self.allow_credentials {
            origin
        } else {
            allow
        };
        response.set("Access-Control-Allow-Origin", allow);
        if self.allow_credentials {
            response.set("Access-Control-Allow-Credentials", "true");
        }
        if !self.exposed_headers.is_empty() {
            response.set(
                "Access-Control-Expose-Headers",
                self.exposed_headers.join(", "),
            );
        }
    }

    /// Headers added on top of the common ones when answering a preflight.
    pub fn apply_preflight_headers(&self, request: &Headers, response: &mut Headers) {
        response.insert("Vary", "Access-Control-Request-Method");
        response.insert("Vary", "Access-Control-Request-Headers");
        response.set(
            "Access-Control-Allow-Methods",
            self.allowed_methods.join(", "),
        );
        if self.allowed_headers.is_empty() {
            if let Some(requested) = request.get("access-control-request-headers") {
                response.set("Access-Control-Allow-Headers", requested);
            }
        } else {
            response.set(
                "Access-Control-Allow-Headers",
                self.allowed_headers.join(", "),
            );
        }
        response.set(
            "Access-Control-Max-Age",
            self.max_age.as_secs().to_string(),
        );
    }
}

/// Middleware enforcing a [`CorsPolicy`].
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    policy: Arc<CorsPolicy>,
}

impl CorsMiddleware {
    pub fn new(policy: Arc<CorsPolicy>) -> Self {
        Self { policy }
    }
}

impl Middleware for CorsMiddleware {
    fn wrap(&self, next: Handler) -> Handler {
        let policy = Arc::clone(&self.policy);
        handler(move |res, req| {
            let next = Arc::clone(&next);
            let policy = Arc::clone(&policy);
            Box::pin(async move {
                policy.apply_common_headers(req.headers(), res.headers_mut());

                let is_preflight = req.method() == &Method::Options
                    && req.headers().contains("access-control-request-method");
                if is_preflight {
                    policy.apply_preflight_headers(req.headers(), res.headers_mut());
                    if !policy.passes_through() {
                        res.status(StatusCode::NoContent);
                        return;
                    }
                }
                next(res, req).await;
            })
        })
    }
}
