use std::sync::Arc;

use tokio::time::Instant;

use super::{Handler, Middleware, handler};

/// Logs each request's method, path, status, and duration.
///
/// Emits one `tracing::info!` line after the downstream chain returns:
///
/// ```text
/// GET /users/42 - 200 (1.2ms)
/// ```
///
/// The status is the one the chain left behind. A `0` means the handler set
/// none and finalization will pick it (204 or a status-handler fallback).
///
/// ```rust
/// use trellis::Router;
/// use trellis::middleware::AccessLog;
///
/// let mut router = Router::new();
/// router.root().middleware(AccessLog);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLog;

impl Middleware for AccessLog {
    fn wrap(&self, next: Handler) -> Handler {
        handler(move |res, req| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let start = Instant::now();
                next(&mut *res, &mut *req).await;
                tracing::info!(
                    "{} {} - {} ({:?})",
                    req.method(),
                    req.path(),
                    res.status_code(),
                    start.elapsed()
                );
            })
        })
    }
}
