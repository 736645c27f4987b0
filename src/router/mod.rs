//! Hierarchical request routing.
//!
//! A [`Router`] is a tree of nodes stored in an arena and addressed by
//! [`NodeId`]. The root has an empty prefix; every subrouter extends its
//! parent's prefix. Each node owns:
//!
//! - an ordered list of routes (first match wins);
//! - an ordered list of child nodes, searched after the node's own routes;
//! - its own middleware (ancestors' middleware is reached by walking the
//!   parent links at composition time, never copied);
//! - a status-handler map, copied from the parent when the subrouter is
//!   created and independent afterwards;
//! - an optional CORS policy, copied from the parent at creation as well.
//!
//! Named routes live in a single registry on the tree, so names are unique
//! across every node.
//!
//! Registration goes through a [`Scope`], a mutable view of one node:
//!
//! ```rust
//! use trellis::Router;
//! use trellis::http::{Method, StatusCode};
//! use trellis::middleware::handler;
//!
//! let mut router = Router::new();
//! let api = router.root().subrouter("/api").unwrap();
//!
//! router
//!     .scope(api)
//!     .route(&[Method::Get], "/users/{id:[0-9]+}", handler(|res, req| {
//!         Box::pin(async move {
//!             let id = req.param("id").unwrap_or_default().to_owned();
//!             res.string(StatusCode::Ok, &id);
//!         })
//!     }))
//!     .name("user")
//!     .register()
//!     .unwrap();
//!
//! assert_eq!(router.url("user", &[("id", "42")]).unwrap(), "/api/users/42");
//! ```
//!
//! The tree is built once, before serving, and is read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::cors::CorsPolicy;
use crate::http::{Method, Request, Response, StatusCode};
use crate::middleware::{Handler, Middleware, handler, install_trace_hook};
use crate::validation::RuleSet;

mod matcher;
mod pattern;
mod route;

pub use matcher::{MatchError, RouteMatch};
pub use pattern::{DEFAULT_PARAM_PATTERN, Pattern};
pub use route::Route;

/// Errors raised while building the router tree.
///
/// All of them surface at registration time; none can occur while serving.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid regex in route template `{template}`: {source}")]
    InvalidPattern {
        template: String,
        source: regex::Error,
    },

    #[error("unbalanced braces in route template `{template}`")]
    UnbalancedBraces { template: String },

    #[error("invalid parameter name `{name}` in route template `{template}`")]
    InvalidParameterName { template: String, name: String },

    #[error("parameter `{name}` declared twice in route template `{template}`")]
    DuplicateParameter { template: String, name: String },

    #[error("a route named `{0}` is already registered")]
    DuplicateRouteName(String),

    #[error("route `{template}` has an empty method set")]
    NoMethods { template: String },

    #[error("invalid subrouter prefix `{0}`")]
    InvalidPrefix(String),

    #[error("no route named `{0}`")]
    UnknownRoute(String),

    #[error("missing value for parameter `{name}` of `{template}`")]
    MissingParameter { template: String, name: String },
}

/// Index of a node in a [`Router`]'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// One router in the tree.
pub struct Node {
    prefix: String,
    prefix_pattern: Option<Pattern>,
    parent: Option<NodeId>,
    routes: Vec<Arc<Route>>,
    children: Vec<NodeId>,
    middleware: Vec<Arc<dyn Middleware>>,
    status_handlers: HashMap<u16, Handler>,
    cors: Option<Arc<CorsPolicy>>,
}

impl Node {
    /// Full prefix, the concatenation of every ancestor's segment. Empty on the root.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn middleware(&self) -> &[Arc<dyn Middleware>] {
        &self.middleware
    }

    pub fn status_handler(&self, code: u16) -> Option<&Handler> {
        self.status_handlers.get(&code)
    }

    pub fn cors(&self) -> Option<&Arc<CorsPolicy>> {
        self.cors.as_ref()
    }

    pub(crate) fn prefix_matches(&self, path: &str) -> bool {
        self.prefix_pattern.as_ref().is_none_or(|p| p.is_match(path))
    }
}

/// The router tree.
pub struct Router {
    nodes: Vec<Node>,
    named: HashMap<String, Arc<Route>>,
    config: Arc<Config>,
    not_found: Arc<Route>,
    method_not_allowed: Arc<Route>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn status_setter(code: StatusCode) -> Handler {
    handler(move |res, _req| {
        Box::pin(async move {
            res.status(code);
        })
    })
}

impl Router {
    pub const ROOT: NodeId = NodeId(0);

    /// An empty tree with default configuration and the default status
    /// handlers installed on the root.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        if config.app.debug {
            install_trace_hook();
        }

        let mut status_handlers = HashMap::new();
        crate::status::install_defaults(&mut status_handlers);

        let root = Node {
            prefix: String::new(),
            prefix_pattern: None,
            parent: None,
            routes: Vec::new(),
            children: Vec::new(),
            middleware: Vec::new(),
            status_handlers,
            cors: None,
        };

        Self {
            nodes: vec![root],
            named: HashMap::new(),
            config: Arc::new(config),
            not_found: Arc::new(Route::sentinel(status_setter(StatusCode::NotFound))),
            method_not_allowed: Arc::new(Route::sentinel(status_setter(
                StatusCode::MethodNotAllowed,
            ))),
        }
    }

    /// A router that answers every request with `503 Service Unavailable`.
    ///
    /// Swapped in by [`ServerHandle::enter_maintenance`](crate::server::ServerHandle::enter_maintenance).
    pub fn maintenance(config: Arc<Config>) -> Self {
        let mut router = Self::with_config((*config).clone());
        router.root().middleware(|_next: Handler| -> Handler {
            handler(|res, _req| {
                Box::pin(async move {
                    res.headers_mut().set("Retry-After", "120");
                    res.status(StatusCode::ServiceUnavailable);
                })
            })
        });
        router
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Registration view of the root node.
    pub fn root(&mut self) -> Scope<'_> {
        self.scope(Self::ROOT)
    }

    /// Registration view of `id`.
    ///
    /// # Panics
    ///
    /// If `id` was not issued by this router.
    pub fn scope(&mut self, id: NodeId) -> Scope<'_> {
        assert!(id.0 < self.nodes.len(), "node {id:?} does not belong to this router");
        Scope { router: self, id }
    }

    /// # Panics
    ///
    /// If `id` was not issued by this router.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// `id` followed by each of its ancestors, ending with the root.
    pub fn ancestry(&self, id: NodeId) -> impl Iterator<Item = &Node> {
        std::iter::successors(Some(self.node(id)), |node| {
            node.parent.map(|parent| self.node(parent))
        })
    }

    /// Resolves `method` + `path` against the tree.
    pub fn find(&self, method: &Method, path: &str) -> RouteMatch {
        matcher::find(self, method, path)
    }

    pub fn route_named(&self, name: &str) -> Option<&Arc<Route>> {
        self.named.get(name)
    }

    /// Builds the path of a named route.
    ///
    /// # Errors
    ///
    /// - [`RouterError::UnknownRoute`] — no route carries `name`.
    /// - [`RouterError::MissingParameter`] — a template parameter has no value.
    pub fn url(&self, name: &str, params: &[(&str, &str)]) -> Result<String, RouterError> {
        let route = self
            .named
            .get(name)
            .ok_or_else(|| RouterError::UnknownRoute(name.to_owned()))?;
        let pattern = route
            .pattern()
            .ok_or_else(|| RouterError::UnknownRoute(name.to_owned()))?;
        let params: HashMap<&str, &str> = params.iter().copied().collect();
        pattern.build_url(&params)
    }

    /// Runs one request through the full lifecycle and returns the finalized
    /// response.
    pub async fn dispatch(&self, mut request: Request) -> Response {
        let mut response = Response::new();
        crate::lifecycle::run(self, &mut request, &mut response).await;
        response
    }

    pub(crate) fn not_found(&self) -> &Arc<Route> {
        &self.not_found
    }

    pub(crate) fn method_not_allowed(&self) -> &Arc<Route> {
        &self.method_not_allowed
    }
}

/// Mutable registration view of one router node.
pub struct Scope<'r> {
    router: &'r mut Router,
    id: NodeId,
}

impl Scope<'_> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    fn node_mut(&mut self) -> &mut Node {
        &mut self.router.nodes[self.id.0]
    }

    /// Creates a child router under `prefix` (relative to this node).
    ///
    /// The child starts with a copy of this node's status handlers and CORS
    /// policy and no middleware of its own.
    ///
    /// # Errors
    ///
    /// [`RouterError::InvalidPrefix`] for an empty or `/` prefix, or any
    /// pattern error from compiling the combined prefix.
    pub fn subrouter(&mut self, prefix: &str) -> Result<NodeId, RouterError> {
        let segment = pattern::normalize(prefix);
        if segment.is_empty() || segment == "/" {
            return Err(RouterError::InvalidPrefix(prefix.to_owned()));
        }

        let parent = &self.router.nodes[self.id.0];
        let full = format!("{}{segment}", parent.prefix);
        let prefix_pattern = Pattern::compile_prefix(&full)?;

        let child = Node {
            prefix: full,
            prefix_pattern: Some(prefix_pattern),
            parent: Some(self.id),
            routes: Vec::new(),
            children: Vec::new(),
            middleware: Vec::new(),
            status_handlers: parent.status_handlers.clone(),
            cors: parent.cors.clone(),
        };

        let id = NodeId(self.router.nodes.len());
        debug!(prefix = %child.prefix, ?id, "subrouter created");
        self.router.nodes.push(child);
        self.node_mut().children.push(id);
        Ok(id)
    }

    /// Appends middleware to this node. Earlier registrations run first.
    pub fn middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.node_mut().middleware.push(Arc::new(middleware));
        self
    }

    /// Registers `handler` as this node's fallback for `code`.
    ///
    /// Subrouters created later inherit it; existing subrouters and the
    /// parent do not see the change.
    pub fn status_handler(&mut self, code: impl Into<u16>, handler: Handler) -> &mut Self {
        self.node_mut().status_handlers.insert(code.into(), handler);
        self
    }

    /// Registers one handler for several codes.
    pub fn status_handlers(&mut self, codes: &[u16], handler: Handler) -> &mut Self {
        let node = self.node_mut();
        for &code in codes {
            node.status_handlers.insert(code, Arc::clone(&handler));
        }
        self
    }

    pub fn remove_status_handler(&mut self, code: impl Into<u16>) -> &mut Self {
        self.node_mut().status_handlers.remove(&code.into());
        self
    }

    /// Enables CORS on this node. Routes registered afterwards accept `OPTIONS`.
    pub fn cors(&mut self, policy: CorsPolicy) -> &mut Self {
        self.node_mut().cors = Some(Arc::new(policy));
        self
    }

    /// Starts a route registration for `methods` on `uri` (relative to this node).
    pub fn route(&mut self, methods: &[Method], uri: &str, handler: Handler) -> RouteBuilder<'_> {
        RouteBuilder {
            router: &mut *self.router,
            node: self.id,
            methods: methods.to_vec(),
            uri: uri.to_owned(),
            handler,
            middleware: Vec::new(),
            rules: None,
            name: None,
            meta: HashMap::new(),
        }
    }

    /// `GET` and `HEAD`.
    pub fn get(&mut self, uri: &str, handler: Handler) -> Result<Arc<Route>, RouterError> {
        self.route(&[Method::Get, Method::Head], uri, handler).register()
    }

    pub fn post(&mut self, uri: &str, handler: Handler) -> Result<Arc<Route>, RouterError> {
        self.route(&[Method::Post], uri, handler).register()
    }

    pub fn put(&mut self, uri: &str, handler: Handler) -> Result<Arc<Route>, RouterError> {
        self.route(&[Method::Put], uri, handler).register()
    }

    pub fn patch(&mut self, uri: &str, handler: Handler) -> Result<Arc<Route>, RouterError> {
        self.route(&[Method::Patch], uri, handler).register()
    }

    pub fn delete(&mut self, uri: &str, handler: Handler) -> Result<Arc<Route>, RouterError> {
        self.route(&[Method::Delete], uri, handler).register()
    }

    pub fn options(&mut self, uri: &str, handler: Handler) -> Result<Arc<Route>, RouterError> {
        self.route(&[Method::Options], uri, handler).register()
    }
}

/// A pending route registration. Nothing is added until [`register`](Self::register).
#[must_use = "a route is only added by calling `register`"]
pub struct RouteBuilder<'r> {
    router: &'r mut Router,
    node: NodeId,
    methods: Vec<Method>,
    uri: String,
    handler: Handler,
    middleware: Vec<Arc<dyn Middleware>>,
    rules: Option<Arc<dyn RuleSet>>,
    name: Option<String>,
    meta: HashMap<String, Value>,
}

impl RouteBuilder<'_> {
    /// Names the route for [`Router::url`]. Names are unique across the tree.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Route-level middleware, applied inside the router chain.
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Validation rules run against the request payload before the handler.
    pub fn rules(mut self, rules: impl RuleSet + 'static) -> Self {
        self.rules = Some(Arc::new(rules));
        self
    }

    /// Attaches arbitrary metadata, readable through `Request::route()`.
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Compiles the full template and adds the route to its node.
    ///
    /// # Errors
    ///
    /// - [`RouterError::NoMethods`] — the method set is empty.
    /// - [`RouterError::DuplicateRouteName`] — the name is taken.
    /// - any pattern compilation error.
    pub fn register(self) -> Result<Arc<Route>, RouterError> {
        let node = &self.router.nodes[self.node.0];
        let template = format!("{}{}", node.prefix, pattern::normalize(&self.uri));

        let mut methods: Vec<Method> = Vec::with_capacity(self.methods.len() + 1);
        for method in self.methods {
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        if methods.is_empty() {
            return Err(RouterError::NoMethods { template });
        }
        if node.cors.is_some() && !methods.contains(&Method::Options) {
            methods.push(Method::Options);
        }

        if let Some(name) = &self.name {
            if self.router.named.contains_key(name) {
                return Err(RouterError::DuplicateRouteName(name.clone()));
            }
        }

        let pattern = Pattern::compile(&template)?;
        let route = Arc::new(Route::new(
            methods,
            pattern,
            self.handler,
            self.middleware,
            self.rules,
            self.name,
            self.meta,
        ));

        debug!(
            methods = ?route.methods(),
            template = route.template(),
            name = route.name(),
            "route registered"
        );

        if let Some(name) = route.name() {
            self.router.named.insert(name.to_owned(), Arc::clone(&route));
        }
        self.router.nodes[self.node.0].routes.push(Arc::clone(&route));
        Ok(route)
    }
}
