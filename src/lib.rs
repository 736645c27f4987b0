//! # trellis
//!
//! A hierarchical HTTP request dispatch core on top of a small async
//! HTTP/1.1 server.
//!
//! Requests are matched against a tree of routers, wrapped in the middleware
//! of every router on the way down, run under a panic-recovery guard, and
//! finalized with a well-defined response: untouched responses become `204`,
//! empty error responses are filled in by status handlers, and the head is
//! committed exactly once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trellis::{Router, Server};
//! use trellis::cors::CorsPolicy;
//! use trellis::http::StatusCode;
//! use trellis::middleware::{AccessLog, handler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.root().middleware(AccessLog);
//!
//!     let api = router.root().subrouter("/api")?;
//!     router.scope(api).cors(CorsPolicy::new());
//!     router.scope(api).get("/users/{id:[0-9]+}", handler(|res, req| {
//!         Box::pin(async move {
//!             let id = req.param("id").unwrap_or_default().to_owned();
//!             res.json(StatusCode::Ok, &serde_json::json!({ "id": id }));
//!         })
//!     }))?;
//!
//!     Server::bind(router).await?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod cors;
pub mod http;
pub mod lifecycle;
pub mod middleware;
pub mod router;
pub mod server;
pub mod status;
pub mod validation;

pub use config::Config;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::{Handler, Middleware, handler};
pub use router::{Router, RouterError};
pub use server::{Server, ServerError, ServerHandle};
