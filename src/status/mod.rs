//! Default status handlers.
//!
//! A status handler runs at finalization when a response has a status but no
//! body. Every new [`Router`](crate::Router) installs these on its root; they
//! are copied into subrouters like any other status handler and can be
//! replaced per node with [`Scope::status_handler`](crate::router::Scope::status_handler).
//!
//! | Codes        | Handler                       | Body                                               |
//! |--------------|-------------------------------|----------------------------------------------------|
//! | 4xx, 5xx     | [`error_status_handler`]      | `{"error": "<reason phrase>"}`                     |
//! | 400, 422     | [`validation_status_handler`] | `{"validationError": {...}}` or `{"error": "..."}` |
//! | 500          | [`panic_status_handler`]      | `{"error": "..."}`, plus `"trace"` in debug mode   |

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::http::StatusCode;
use crate::lifecycle::BodyError;
use crate::middleware::{Handler, Recovered, handler};
use crate::validation::ValidationErrors;

/// Writes `{"error": "<reason phrase>"}` with the response's status.
pub fn error_status_handler() -> Handler {
    handler(|res, _req| {
        Box::pin(async move {
            let code = res.status_code();
            res.json(code, &json!({ "error": StatusCode::reason(code) }));
        })
    })
}

/// Reports why the payload was rejected.
///
/// Field errors from a failed rule set become `{"validationError": {field: [messages]}}`;
/// a body that could not be parsed becomes `{"error": "<parse error>"}`. With
/// neither recorded it falls back to the reason phrase.
pub fn validation_status_handler() -> Handler {
    handler(|res, req| {
        Box::pin(async move {
            let code = res.status_code();
            let body = if let Some(ValidationErrors(errors)) = req.extra().get::<ValidationErrors>() {
                json!({ "validationError": errors })
            } else if let Some(err) = req.extra().get::<BodyError>() {
                json!({ "error": err.to_string() })
            } else {
                json!({ "error": StatusCode::reason(code) })
            };
            res.json(code, &body);
        })
    })
}

/// Reports a recovered panic.
///
/// Outside debug mode the body is only the reason phrase; the panic message
/// stays in the server log.
pub fn panic_status_handler() -> Handler {
    handler(|res, req| {
        Box::pin(async move {
            let code = res.status_code();
            let recovered = req.extra().get::<Recovered>();
            let body = match recovered {
                Some(recovered) if req.config().app.debug => {
                    let mut body = json!({ "error": recovered.message });
                    if let Some(trace) = &recovered.trace {
                        body["trace"] = Value::from(
                            trace.lines().map(str::trim).collect::<Vec<_>>(),
                        );
                    }
                    body
                }
                _ => json!({ "error": StatusCode::reason(code) }),
            };
            res.json(code, &body);
        })
    })
}

pub(crate) fn install_defaults(handlers: &mut HashMap<u16, Handler>) {
    let generic = error_status_handler();
    for status in StatusCode::ALL {
        let code = status.as_u16();
        if StatusCode::is_error(code) {
            handlers.insert(code, Arc::clone(&generic));
        }
    }

    let validation = validation_status_handler();
    handlers.insert(StatusCode::BadRequest.as_u16(), Arc::clone(&validation));
    handlers.insert(StatusCode::UnprocessableEntity.as_u16(), validation);
    handlers.insert(StatusCode::InternalServerError.as_u16(), panic_status_handler());
}
