//! The request lifecycle driver.
//!
//! Every request moves through the same linear sequence:
//!
//! ```text
//! Created ──► Parsed ──► Validated ──► Handled ──► Finalized
//!                │            │            │
//!                │ 413        │ 400 / 422  │ panic → 500
//!                └────────────┴────────────┴──────────► Finalized
//! ```
//!
//! - **Parsed**: the body is decoded into `Request::data`. A body over the
//!   configured limit is never decoded; it records [`BodyError::TooLarge`],
//!   sets 413 and skips the handler chain. Any other decode failure leaves
//!   `data` empty and records the [`BodyError`] in `extra`, so the handler (or
//!   the validation gate) still decides what to do.
//! - **Validated**: the validation gate, composed inside the route middleware,
//!   short-circuits with 400 or 422.
//! - **Handled**: the composed chain runs under the recovery guard.
//! - **Finalized**: see [`finalize`].

use std::sync::Arc;

use tracing::{debug, warn};

use crate::http::{Request, Response, StatusCode};
use crate::middleware::{self, catch_panic, recovery};
use crate::router::{MatchError, RouteMatch, Router};

mod body;

pub use body::{BodyError, parse as parse_body};

/// Drives one request from matching to a committed response head.
///
/// The response body stays buffered in `res`; writing it to a connection is
/// the caller's job.
pub async fn run(router: &Router, req: &mut Request, res: &mut Response) {
    let mut matched = router.find(req.method(), req.path());
    req.set_params(std::mem::take(&mut matched.parameters));
    req.set_route(Arc::clone(&matched.route));
    req.set_config(Arc::clone(router.config()));

    if matched.error == MatchError::MethodNotAllowed && !matched.allowed.is_empty() {
        let allow: Vec<&str> = matched.allowed.iter().map(|m| m.as_str()).collect();
        res.headers_mut().set("Allow", allow.join(", "));
    }

    let max_bytes = router.config().server.max_payload_size;
    let proceed = match body::parse(req, max_bytes) {
        Ok(data) => {
            req.set_data(Some(data));
            true
        }
        Err(err @ BodyError::TooLarge { .. }) => {
            debug!(path = %req.path(), %err, "payload rejected");
            res.status(StatusCode::PayloadTooLarge);
            req.extra_mut().insert(err);
            false
        }
        Err(err) => {
            debug!(path = %req.path(), %err, "payload could not be decoded");
            req.set_data(None);
            req.extra_mut().insert(err);
            true
        }
    };

    if proceed {
        let chain = recovery(middleware::compose(router, &matched));
        chain(&mut *res, &mut *req).await;
    }

    finalize(router, &matched, req, res).await;
}

/// Brings the response to its committed state.
///
/// In order:
///
/// 1. a hijacked response is left alone;
/// 2. a canceled request is left alone, the client is gone;
/// 3. an untouched response (no status, no body) becomes `204 No Content`;
/// 4. an empty response with a status gets the matched router's status
///    handler for that code, if any;
/// 5. the head is committed if nothing committed it yet.
pub async fn finalize(router: &Router, matched: &RouteMatch, req: &mut Request, res: &mut Response) {
    if res.is_hijacked() {
        debug!(path = %req.path(), "response hijacked, skipping finalization");
        return;
    }
    if req.is_canceled() {
        debug!(path = %req.path(), "request canceled, skipping finalization");
        return;
    }

    let status = res.status_code();
    if res.is_empty() && status == 0 {
        res.status(StatusCode::NoContent);
    } else if res.is_empty() {
        if let Some(fallback) = router.node(matched.node).status_handler(status) {
            let fallback = Arc::clone(fallback);
            debug!(status, path = %req.path(), "running status handler");
            let debug = req.config().app.debug;
            if let Err(recovered) = catch_panic(fallback(&mut *res, &mut *req), debug).await {
                warn!(status, panic = %recovered.message, "status handler panicked");
            }
        }
    }

    if !res.is_header_written() {
        res.write_header(res.status_code());
    }
    debug!(
        method = %req.method(),
        path = %req.path(),
        status = res.status_code(),
        "request finalized"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::*;
    use crate::config::Config;
    use crate::cors::CorsPolicy;
    use crate::http::Method;
    use crate::middleware::{Handler, Middleware, handler};
    use crate::validation::FieldErrors;

    fn body_json(res: &Response) -> Value {
        serde_json::from_slice(res.body()).unwrap()
    }

    fn silent() -> Handler {
        handler(|_res, _req| Box::pin(async {}))
    }

    fn status_only(code: StatusCode) -> Handler {
        handler(move |res, _req| {
            Box::pin(async move {
                res.status(code);
            })
        })
    }

    fn boom() -> Handler {
        handler(|_res, _req| {
            Box::pin(async {
                panic!("boom");
            })
        })
    }

    fn debug_router() -> Router {
        let mut config = Config::default();
        config.app.debug = true;
        Router::with_config(config)
    }

    #[tokio::test]
    async fn untouched_response_is_204() {
        let mut router = Router::new();
        router.root().post("/noop", silent()).unwrap();

        let res = router.dispatch(Request::new(Method::Post, "/noop")).await;
        assert_eq!(res.status_code(), 204);
        assert!(res.is_empty());
        assert!(res.is_header_written());
    }

    #[tokio::test]
    async fn bare_404_gets_json_error_body() {
        let mut router = Router::new();
        router.root().get("/gone", status_only(StatusCode::NotFound)).unwrap();

        let res = router.dispatch(Request::new(Method::Get, "/gone")).await;
        assert_eq!(res.status_code(), 404);
        assert_eq!(body_json(&res), json!({"error": "Not Found"}));
        let content_type = res.committed_headers().unwrap().get("content-type").unwrap();
        assert!(content_type.starts_with("application/json"));
    }

    #[tokio::test]
    async fn unmatched_path_is_404_and_wrong_method_is_405() {
        let mut router = Router::new();
        router.root().post("/items", silent()).unwrap();

        let res = router.dispatch(Request::new(Method::Get, "/nowhere")).await;
        assert_eq!(res.status_code(), 404);

        let res = router.dispatch(Request::new(Method::Get, "/items")).await;
        assert_eq!(res.status_code(), 405);
        assert_eq!(res.headers().get("allow"), Some("POST"));
        assert_eq!(body_json(&res), json!({"error": "Method Not Allowed"}));
    }

    #[tokio::test]
    async fn body_written_by_handler_suppresses_status_handler() {
        let mut router = Router::new();
        router
            .root()
            .get(
                "/teapot",
                handler(|res, _req| {
                    Box::pin(async move {
                        res.string(StatusCode::NotFound, "custom");
                    })
                }),
            )
            .unwrap();

        let res = router.dispatch(Request::new(Method::Get, "/teapot")).await;
        assert_eq!(res.status_code(), 404);
        assert_eq!(res.body(), b"custom");
    }

    #[tokio::test]
    async fn panic_is_500_with_message_in_debug() {
        let mut router = debug_router();
        router.root().get("/explode", boom()).unwrap();

        let res = router.dispatch(Request::new(Method::Get, "/explode")).await;
        assert_eq!(res.status_code(), 500);
        let body = body_json(&res);
        assert_eq!(body["error"], "boom");
        assert!(body["trace"].is_array());
    }

    #[tokio::test]
    async fn panic_is_generic_outside_debug() {
        let mut router = Router::new();
        router.root().get("/explode", boom()).unwrap();

        let res = router.dispatch(Request::new(Method::Get, "/explode")).await;
        assert_eq!(res.status_code(), 500);
        assert_eq!(body_json(&res), json!({"error": "Internal Server Error"}));
        assert!(!String::from_utf8_lossy(res.body()).contains("boom"));
    }

    #[tokio::test]
    async fn panicking_status_handler_still_commits() {
        let mut router = Router::new();
        router.root().status_handler(StatusCode::Conflict, boom());
        router.root().get("/c", status_only(StatusCode::Conflict)).unwrap();

        let res = router.dispatch(Request::new(Method::Get, "/c")).await;
        assert_eq!(res.status_code(), 409);
        assert!(res.is_header_written());
    }

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

    #[tokio::test]
    async fn root_subrouter_route_validation_handler_order() {
        let trace: Trace = Arc::default();
        let mut router = Router::new();
        router.root().middleware(tracer(&trace, "A"));
        let api = router.root().subrouter("/api").unwrap();
        router.scope(api).middleware(tracer(&trace, "B"));

        let rules_trace = Arc::clone(&trace);
        let handler_trace = Arc::clone(&trace);
        router
            .scope(api)
            .route(
                &[Method::Post],
                "/things",
                handler(move |res, _req| {
                    let trace = Arc::clone(&handler_trace);
                    Box::pin(async move {
                        trace.lock().unwrap().push("handler");
                        res.status(StatusCode::Created);
                    })
                }),
            )
            .middleware(tracer(&trace, "C"))
            .rules(move |data: &Value| -> Result<Value, FieldErrors> {
                rules_trace.lock().unwrap().push("V");
                Ok(data.clone())
            })
            .register()
            .unwrap();

        let req = Request::new(Method::Post, "/api/things")
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"x":1}"#);
        let res = router.dispatch(req).await;

        assert_eq!(res.status_code(), 201);
        assert_eq!(*trace.lock().unwrap(), ["A", "B", "C", "V", "handler"]);
    }

    fn required_name(data: &Value) -> Result<Value, FieldErrors> {
        let mut errors = FieldErrors::new();
        if data.get("name").and_then(Value::as_str).is_none() {
            errors.add("name", "The name is required.");
        }
        if errors.is_empty() { Ok(data.clone()) } else { Err(errors) }
    }

    fn counted(hits: &Arc<AtomicUsize>) -> Handler {
        let hits = Arc::clone(hits);
        handler(move |res, _req| {
            let hits = Arc::clone(&hits);
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                res.status(StatusCode::Ok);
            })
        })
    }

    fn validated_router(hits: &Arc<AtomicUsize>) -> Router {
        let mut router = Router::new();
        router
            .root()
            .route(&[Method::Post], "/people", counted(hits))
            .rules(required_name)
            .register()
            .unwrap();
        router
    }

    #[tokio::test]
    async fn rule_violation_is_422_with_field_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = validated_router(&hits);
        let req = Request::new(Method::Post, "/people")
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"age":3}"#);
        let res = router.dispatch(req).await;

        assert_eq!(res.status_code(), 422);
        assert_eq!(
            body_json(&res),
            json!({"validationError": {"name": ["The name is required."]}})
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_body_is_400_with_parse_error() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = validated_router(&hits);
        let req = Request::new(Method::Post, "/people")
            .with_header("Content-Type", "application/json")
            .with_body("{not json");
        let res = router.dispatch(req).await;

        assert_eq!(res.status_code(), 400);
        let body = body_json(&res);
        assert!(body["error"].as_str().unwrap().starts_with("malformed JSON body"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_413_and_skips_the_chain() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut config = Config::default();
        config.server.max_payload_size = 4;
        let mut router = Router::with_config(config);
        router.root().post("/upload", counted(&hits)).unwrap();

        let req = Request::new(Method::Post, "/upload")
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"big":true}"#);
        let res = router.dispatch(req).await;

        assert_eq!(res.status_code(), 413);
        assert_eq!(body_json(&res), json!({"error": "Payload Too Large"}));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn preflight_is_answered_without_the_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        router.root().cors(CorsPolicy::new());
        router.root().get("/items", counted(&hits)).unwrap();

        let req = Request::new(Method::Options, "/items")
            .with_header("Origin", "https://app.test")
            .with_header("Access-Control-Request-Method", "GET");
        let res = router.dispatch(req).await;

        assert_eq!(res.status_code(), 204);
        assert!(res.is_empty());
        let headers = res.committed_headers().unwrap();
        assert_eq!(headers.get("access-control-allow-origin"), Some("*"));
        assert!(headers.contains("access-control-allow-methods"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cors_headers_on_simple_requests() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        router.root().cors(CorsPolicy::new().allowed_origins(["https://app.test"]));
        router.root().get("/items", counted(&hits)).unwrap();

        let req = Request::new(Method::Get, "/items").with_header("Origin", "https://app.test");
        let res = router.dispatch(req).await;

        assert_eq!(res.status_code(), 200);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            res.headers().get("access-control-allow-origin"),
            Some("https://app.test")
        );
    }

    // Records each layer's label and whether CORS headers were already set
    // when it ran.
    type Seen = Arc<Mutex<Vec<(&'static str, bool)>>>;

    fn observer(seen: &Seen, label: &'static str) -> impl Middleware + 'static {
        let seen = Arc::clone(seen);
        move |next: Handler| -> Handler {
            let seen = Arc::clone(&seen);
            handler(move |res, req| {
                let next = next.clone();
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    let cors = res.headers().contains("access-control-allow-origin");
                    seen.lock().unwrap().push((label, cors));
                    next(res, req).await;
                })
            })
        }
    }

    fn cors_subrouter(seen: &Seen, hits: &Arc<AtomicUsize>) -> Router {
        let mut router = Router::new();
        router.root().middleware(observer(seen, "A"));
        let api = router.root().subrouter("/api").unwrap();
        router.scope(api).cors(CorsPolicy::new());
        router.scope(api).middleware(observer(seen, "B"));
        router.scope(api).get("/items", counted(hits)).unwrap();
        router
    }

    #[tokio::test]
    async fn subrouter_preflight_runs_ancestors_but_not_own_middleware() {
        let seen: Seen = Arc::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let router = cors_subrouter(&seen, &hits);

        let req = Request::new(Method::Options, "/api/items")
            .with_header("Origin", "https://app.test")
            .with_header("Access-Control-Request-Method", "GET");
        let res = router.dispatch(req).await;

        assert_eq!(res.status_code(), 204);
        assert_eq!(*seen.lock().unwrap(), [("A", false)]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        let headers = res.committed_headers().unwrap();
        assert!(headers.contains("access-control-allow-methods"));
    }

    #[tokio::test]
    async fn subrouter_cors_sits_between_ancestor_and_own_middleware() {
        let seen: Seen = Arc::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let router = cors_subrouter(&seen, &hits);

        let req = Request::new(Method::Get, "/api/items").with_header("Origin", "https://app.test");
        let res = router.dispatch(req).await;

        assert_eq!(res.status_code(), 200);
        assert_eq!(*seen.lock().unwrap(), [("A", false), ("B", true)]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(res.headers().get("access-control-allow-origin"), Some("*"));
    }

    #[tokio::test]
    async fn subrouter_status_handler_applies_under_its_prefix() {
        let mut router = Router::new();
        let api = router.root().subrouter("/api").unwrap();
        router.scope(api).status_handler(
            StatusCode::NotFound,
            handler(|res, _req| {
                Box::pin(async move {
                    res.json(StatusCode::NotFound, &json!({"api": "no such endpoint"}));
                })
            }),
        );

        let res = router.dispatch(Request::new(Method::Get, "/api/missing")).await;
        assert_eq!(body_json(&res), json!({"api": "no such endpoint"}));

        let res = router.dispatch(Request::new(Method::Get, "/missing")).await;
        assert_eq!(body_json(&res), json!({"error": "Not Found"}));
    }

    #[tokio::test]
    async fn route_params_and_data_reach_the_handler() {
        let mut router = Router::new();
        router
            .root()
            .post(
                "/users/{id:[0-9]+}",
                handler(|res, req| {
                    Box::pin(async move {
                        let body = json!({
                            "id": req.param("id"),
                            "name": req.field("name"),
                            "page": req.field("page"),
                            "route": req.route().map(|r| r.template().to_owned()),
                        });
                        res.json(StatusCode::Ok, &body);
                    })
                }),
            )
            .unwrap();

        let req = Request::new(Method::Post, "/users/7?page=3")
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"name":"ada"}"#);
        let res = router.dispatch(req).await;

        assert_eq!(
            body_json(&res),
            json!({"id": "7", "name": "ada", "page": "3", "route": "/users/{id:[0-9]+}"})
        );
    }

    #[tokio::test]
    async fn canceled_request_is_not_finalized() {
        let mut router = Router::new();
        router
            .root()
            .get(
                "/slow",
                handler(|_res, req| {
                    Box::pin(async move {
                        req.cancellation().cancel();
                    })
                }),
            )
            .unwrap();

        let mut req = Request::new(Method::Get, "/slow");
        let mut res = Response::new();
        run(&router, &mut req, &mut res).await;

        assert_eq!(res.status_code(), 0);
        assert!(!res.is_header_written());
    }

    #[tokio::test]
    async fn hijacked_response_is_left_alone() {
        let mut router = Router::new();
        router
            .root()
            .get(
                "/ws",
                handler(|res, _req| {
                    Box::pin(async move {
                        res.hijack(|_stream, _rest| async {});
                    })
                }),
            )
            .unwrap();

        let res = router.dispatch(Request::new(Method::Get, "/ws")).await;
        assert!(res.is_hijacked());
        assert!(!res.is_header_written());
        assert_eq!(res.status_code(), 0);
    }

    #[tokio::test]
    async fn recovered_panic_is_kept_in_extra() {
        let mut router = Router::new();
        router.root().get("/explode", boom()).unwrap();

        let mut req = Request::new(Method::Get, "/explode");
        let mut res = Response::new();
        run(&router, &mut req, &mut res).await;

        let recovered = req.extra().get::<middleware::Recovered>().unwrap();
        assert_eq!(recovered.message, "boom");
    }
}
