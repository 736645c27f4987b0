//! Handler and middleware contracts, and the chain composer.
//!
//! A [`Handler`] receives the response writer and the request and returns
//! nothing: every effect goes through `&mut Response` / `&mut Request`.
//! A [`Middleware`] is a decorator that takes the next [`Handler`] and returns
//! a handler wrapping it, so composition is plain function application.
//!
//! ## Composition order
//!
//! [`compose`] builds one handler per request, innermost first:
//!
//! 1. the route's handler;
//! 2. the validation gate, if the route declares rules;
//! 3. the route's own middleware;
//! 4. the matched router's middleware, then its CORS layer if it has a policy;
//! 5. every ancestor router's middleware, up to the root.
//!
//! Within one list, the first registered middleware is the outermost, so it
//! runs first. The lifecycle driver then wraps the result in the
//! [`recovery`] guard, which is always the outermost layer.
//!
//! ## Writing middleware
//!
//! ```rust
//! use trellis::middleware::{Handler, handler};
//!
//! fn request_id(next: Handler) -> Handler {
//!     handler(move |res, req| {
//!         let next = next.clone();
//!         Box::pin(async move {
//!             let id = req.headers().get("x-request-id").unwrap_or("none").to_owned();
//!             res.headers_mut().set("X-Request-Id", id);
//!             next(res, req).await;
//!         })
//!     })
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::cors::CorsMiddleware;
use crate::http::{Request, Response};
use crate::router::{RouteMatch, Router};
use crate::validation;

mod access_log;
mod recovery;

pub use access_log::AccessLog;
pub use recovery::{Recovered, recovery};
pub(crate) use recovery::{catch_panic, install_trace_hook};

/// Future returned by every handler, borrowing the response and request.
pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Type-erased, cheaply cloneable request handler.
///
/// Build one with [`handler`]; call it like a function: `next(res, req).await`.
pub type Handler =
    Arc<dyn for<'a> Fn(&'a mut Response, &'a mut Request) -> BoxFuture<'a> + Send + Sync>;

/// Turns a closure into a [`Handler`].
///
/// The closure returns a boxed future; `Box::pin(async move { … })` is the
/// usual body. Anything the future needs from the closure's environment must
/// be cloned in first so the closure stays callable for the next request.
///
/// ```rust
/// use trellis::http::StatusCode;
/// use trellis::middleware::handler;
///
/// let hello = handler(|res, req| {
///     Box::pin(async move {
///         let name = req.param("name").unwrap_or("world").to_owned();
///         res.string(StatusCode::Ok, &format!("hello, {name}"));
///     })
/// });
/// ```
pub fn handler<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Response, &'a mut Request) -> BoxFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A decorator around a [`Handler`].
///
/// Implemented for every `Fn(Handler) -> Handler`, so plain functions and
/// closures are middleware. Implementors may:
///
/// - **pass through** — run logic, then `next(res, req).await`;
/// - **short-circuit** — set a status or write a body and never call `next`;
/// - **decorate** — call `next` and inspect the response afterwards.
///
/// Middleware is shared by every request-handling task, hence `Send + Sync`.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Handler) -> Handler;
}

impl<F> Middleware for F
where
    F: Fn(Handler) -> Handler + Send + Sync,
{
    fn wrap(&self, next: Handler) -> Handler {
        self(next)
    }
}

// Wraps `inner` with `stack` so that `stack[0]` ends up outermost.
fn wrap_all(stack: &[Arc<dyn Middleware>], inner: Handler) -> Handler {
    stack
        .iter()
        .rev()
        .fold(inner, |chain, middleware| middleware.wrap(chain))
}

/// Builds the handler chain for a matched route.
///
/// The recovery guard is not part of the result; the lifecycle driver adds
/// it around whatever this returns.
pub fn compose(router: &Router, matched: &RouteMatch) -> Handler {
    let route = &matched.route;

    let mut chain = Arc::clone(route.handler());
    if let Some(rules) = route.rules() {
        chain = validation::gate(Arc::clone(rules), chain);
    }
    chain = wrap_all(route.middleware(), chain);

    for (depth, node) in router.ancestry(matched.node).enumerate() {
        chain = wrap_all(node.middleware(), chain);
        if depth == 0 {
            if let Some(policy) = node.cors() {
                chain = CorsMiddleware::new(Arc::clone(policy)).wrap(chain);
            }
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::http::{Method, StatusCode};
    use crate::router::Router;

    type Trace = Arc<Mutex<Vec<&'static str>>>;

    fn tracer(trace: &Trace, label: &'static str) -> impl Middleware + 'static {
        let trace = Arc::clone(trace);
        move |next: Handler| -> Handler {
            let trace = Arc::clone(&trace);
            handler(move |res, req| {
                let next = next.clone();
                let trace = Arc::clone(&trace);
                Box::pin(async move {
                    trace.lock().unwrap().push(label);
                    next(res, req).await;
                })
            })
        }
    }

    fn recording_handler(trace: &Trace) -> Handler {
        let trace = Arc::clone(trace);
        handler(move |res, _req| {
            let trace = Arc::clone(&trace);
            Box::pin(async move {
                trace.lock().unwrap().push("handler");
                res.status(StatusCode::Ok);
            })
        })
    }

    #[tokio::test]
    async fn layers_run_root_to_route() {
        let trace: Trace = Arc::default();
        let mut router = Router::new();
        router.root().middleware(tracer(&trace, "root-1"));
        router.root().middleware(tracer(&trace, "root-2"));
        let api = router.root().subrouter("/api").unwrap();
        router.scope(api).middleware(tracer(&trace, "api"));
        router
            .scope(api)
            .route(&[Method::Get], "/items", recording_handler(&trace))
            .middleware(tracer(&trace, "route-1"))
            .middleware(tracer(&trace, "route-2"))
            .register()
            .unwrap();

        let matched = router.find(&Method::Get, "/api/items");
        let chain = compose(&router, &matched);
        let mut res = Response::new();
        let mut req = Request::new(Method::Get, "/api/items");
        chain(&mut res, &mut req).await;

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["root-1", "root-2", "api", "route-1", "route-2", "handler"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let trace: Trace = Arc::default();
        let mut router = Router::new();
        router.root().middleware(|_next: Handler| -> Handler {
            handler(|res, _req| {
                Box::pin(async move {
                    res.status(StatusCode::Unauthorized);
                })
            })
        });
        router.root().get("/secret", recording_handler(&trace)).unwrap();

        let matched = router.find(&Method::Get, "/secret");
        let chain = compose(&router, &matched);
        let mut res = Response::new();
        let mut req = Request::new(Method::Get, "/secret");
        chain(&mut res, &mut req).await;

        assert_eq!(res.status_code(), 401);
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sibling_router_middleware_is_not_applied() {
        let trace: Trace = Arc::default();
        let mut router = Router::new();
        let a = router.root().subrouter("/a").unwrap();
        let b = router.root().subrouter("/b").unwrap();
        router.scope(a).middleware(tracer(&trace, "a"));
        router.scope(b).middleware(tracer(&trace, "b"));
        router.scope(b).get("/x", recording_handler(&trace)).unwrap();

        let matched = router.find(&Method::Get, "/b/x");
        let chain = compose(&router, &matched);
        chain(&mut Response::new(), &mut Request::new(Method::Get, "/b/x")).await;

        assert_eq!(*trace.lock().unwrap(), vec!["b", "handler"]);
    }
}
