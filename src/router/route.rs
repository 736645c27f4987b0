use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::pattern::Pattern;
use crate::http::Method;
use crate::middleware::{Handler, Middleware};
use crate::validation::RuleSet;

/// A registered route: method set, compiled pattern, and handler.
///
/// Routes are built through [`Scope::route`](super::Scope::route) and are
/// immutable once registered. They are shared as `Arc<Route>` between the
/// owning router node, the named-route registry, and every request that
/// matches them.
pub struct Route {
    methods: Vec<Method>,
    pattern: Option<Pattern>,
    handler: Handler,
    middleware: Vec<Arc<dyn Middleware>>,
    rules: Option<Arc<dyn RuleSet>>,
    name: Option<String>,
    meta: HashMap<String, Value>,
}

impl Route {
    pub(crate) fn new(
        methods: Vec<Method>,
        pattern: Pattern,
        handler: Handler,
        middleware: Vec<Arc<dyn Middleware>>,
        rules: Option<Arc<dyn RuleSet>>,
        name: Option<String>,
        meta: HashMap<String, Value>,
    ) -> Self {
        Self {
            methods,
            pattern: Some(pattern),
            handler,
            middleware,
            rules,
            name,
            meta,
        }
    }

    // Not-found / method-not-allowed stand-ins. They match nothing, have no
    // name, and carry only a handler that sets the status.
    pub(crate) fn sentinel(handler: Handler) -> Self {
        Self {
            methods: Vec::new(),
            pattern: None,
            handler,
            middleware: Vec::new(),
            rules: None,
            name: None,
            meta: HashMap::new(),
        }
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// The compiled pattern, including every ancestor prefix. `None` for the
    /// not-found and method-not-allowed sentinels.
    pub fn pattern(&self) -> Option<&Pattern> {
        self.pattern.as_ref()
    }

    /// Full template, e.g. `/api/users/{id}`.
    pub fn template(&self) -> &str {
        self.pattern.as_ref().map_or("", Pattern::template)
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn middleware(&self) -> &[Arc<dyn Middleware>] {
        &self.middleware
    }

    pub fn rules(&self) -> Option<&Arc<dyn RuleSet>> {
        self.rules.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }

    pub fn is_sentinel(&self) -> bool {
        self.pattern.is_none()
    }

    pub(crate) fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        self.pattern.as_ref()?.matches(path)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("methods", &self.methods)
            .field("template", &self.template())
            .field("name", &self.name)
            .field("middleware", &self.middleware.len())
            .field("rules", &self.rules.is_some())
            .finish()
    }
}
