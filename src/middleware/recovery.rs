//! Panic recovery boundary.
//!
//! The lifecycle driver wraps every composed chain with [`recovery`], making it
//! the outermost layer. A panic anywhere below it is caught, logged, recorded
//! as [`Recovered`] in the request's extra bag, and turned into a 500 for the
//! status handler to render. Nothing unwinds past this point, so a panicking
//! handler never takes down the connection task.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use futures::FutureExt;
use tracing::error;

use super::{Handler, handler};
use crate::http::StatusCode;

/// A panic caught by the recovery guard.
#[derive(Debug, Clone)]
pub struct Recovered {
    /// The panic payload rendered as text.
    pub message: String,
    /// Backtrace of the panicking thread, captured only in debug mode.
    pub trace: Option<String>,
}

thread_local! {
    static LAST_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static TRACE_HOOK: Once = Once::new();

/// Installs a panic hook that records the backtrace of the panicking thread
/// so the guard can attach it to [`Recovered`]. Installed once per process
/// when a router is built in debug mode; the previous hook still runs.
pub(crate) fn install_trace_hook() {
    TRACE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_trace() -> Option<String> {
    LAST_TRACE.with(|slot| slot.borrow_mut().take())
}

fn payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Runs `fut`, converting a panic into a [`Recovered`] value.
pub(crate) async fn catch_panic<F>(fut: F, debug: bool) -> Result<(), Recovered>
where
    F: std::future::Future<Output = ()>,
{
    // Discard a trace left behind by a panic caught elsewhere on this thread.
    let _ = take_trace();
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => Ok(()),
        Err(payload) => {
            let trace = take_trace();
            Err(Recovered {
                message: payload_message(payload.as_ref()),
                trace: if debug { trace } else { None },
            })
        }
    }
}

/// The recovery guard.
///
/// Sets status 500 (if nothing else claimed the status first) and stores the
/// [`Recovered`] panic in `req.extra()`.
pub fn recovery(next: Handler) -> Handler {
    handler(move |res, req| {
        let next = next.clone();
        Box::pin(async move {
            let debug = req.config().app.debug;
            let outcome = catch_panic(next(&mut *res, &mut *req), debug).await;
            if let Err(recovered) = outcome {
                error!(
                    method = %req.method(),
                    path = %req.path(),
                    panic = %recovered.message,
                    "handler panicked"
                );
                res.status(StatusCode::InternalServerError);
                req.extra_mut().insert(recovered);
            }
        })
    })
}
