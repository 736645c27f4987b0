//! Request → route resolution.
//!
//! The search walks the router tree depth-first:
//!
//! 1. a node's own routes are tried in registration order; the first route whose
//!    pattern matches the path *and* whose method set holds the method wins;
//! 2. a route whose pattern matches but whose methods do not is remembered as a
//!    method-not-allowed hit, and the scan continues;
//! 3. children are tried in registration order, but only those whose prefix
//!    matches the start of the path;
//! 4. with no accepting route, the outcome is method-not-allowed if any hit was
//!    seen anywhere in the tree, otherwise not-found.
//!
//! Sentinel outcomes are attributed to the deepest node whose prefix matched, so
//! a 404 under `/api` is finished with `/api`'s status handlers and middleware.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::pattern::normalize_path;
use super::{NodeId, Route, Router};
use crate::http::Method;

/// Why a match has no accepting route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchError {
    None,
    MethodNotAllowed,
    NotFound,
}

/// The outcome of matching one request.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// The accepted route, or the not-found / method-not-allowed sentinel.
    pub route: Arc<Route>,
    pub parameters: HashMap<String, String>,
    pub error: MatchError,
    /// Node that owns `route`, or the deepest prefix-matched node for sentinels.
    pub node: NodeId,
    /// Methods accepted on this path by other routes; filled for method-not-allowed.
    pub allowed: Vec<Method>,
}

impl RouteMatch {
    pub fn is_accepted(&self) -> bool {
        self.error == MatchError::None
    }
}

struct Search<'a> {
    method: &'a Method,
    path: &'a str,
    allowed: Vec<Method>,
    wrong_method: bool,
    deepest: (NodeId, usize),
}

impl Search<'_> {
    fn visit(
        &mut self,
        router: &Router,
        id: NodeId,
        depth: usize,
    ) -> Option<(Arc<Route>, HashMap<String, String>, NodeId)> {
        if depth > self.deepest.1 {
            self.deepest = (id, depth);
        }
        let node = router.node(id);

        for route in node.routes() {
            let Some(params) = route.matches(self.path) else {
                continue;
            };
            if route.allows(self.method) {
                return Some((Arc::clone(route), params, id));
            }
            self.wrong_method = true;
            for method in route.methods() {
                if !self.allowed.contains(method) {
                    self.allowed.push(method.clone());
                }
            }
        }

        for &child in node.children() {
            if !router.node(child).prefix_matches(self.path) {
                continue;
            }
            if let Some(found) = self.visit(router, child, depth + 1) {
                return Some(found);
            }
        }
        None
    }
}

pub(crate) fn find(router: &Router, method: &Method, path: &str) -> RouteMatch {
    let mut search = Search {
        method,
        path: normalize_path(path),
        allowed: Vec::new(),
        wrong_method: false,
        deepest: (Router::ROOT, 0),
    };

    if let Some((route, parameters, node)) = search.visit(router, Router::ROOT, 0) {
        debug!(%method, path, route = route.template(), "route matched");
        return RouteMatch {
            route,
            parameters,
            error: MatchError::None,
            node,
            allowed: Vec::new(),
        };
    }

    let (route, error) = if search.wrong_method {
        (router.method_not_allowed(), MatchError::MethodNotAllowed)
    } else {
        (router.not_found(), MatchError::NotFound)
    };
    debug!(%method, path, outcome = ?error, "no route accepted the request");
    RouteMatch {
        route: Arc::clone(route),
        parameters: HashMap::new(),
        error,
        node: search.deepest.0,
        allowed: search.allowed,
    }
}
