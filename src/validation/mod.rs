//! Validation collaborator boundary.
//!
//! The rule engine itself lives outside the dispatch core. A route declares an
//! opaque [`RuleSet`]; the gate built by the composer hands it the parsed
//! payload and acts on the outcome:
//!
//! - payload absent (the body failed to parse) → `400`, handler not called;
//! - rules fail → [`ValidationErrors`] stored in `extra`, `422`, handler not called;
//! - rules pass → the coerced payload replaces `req.data()` and the chain continues.
//!
//! Any `Fn(&Value) -> Result<Value, FieldErrors>` is a rule set:
//!
//! ```rust
//! use serde_json::{Value, json};
//! use trellis::validation::FieldErrors;
//!
//! let rules = |data: &Value| -> Result<Value, FieldErrors> {
//!     let mut errors = FieldErrors::new();
//!     if data.get("name").and_then(Value::as_str).is_none() {
//!         errors.add("name", "The name is required.");
//!     }
//!     if errors.is_empty() { Ok(data.clone()) } else { Err(errors) }
//! };
//! # let _ = rules(&json!({}));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::http::StatusCode;
use crate::middleware::{Handler, handler};

/// Field name → messages, in stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Failed validation, left in `Request::extra` for the status handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationErrors(pub FieldErrors);

/// A route's validation rules.
///
/// `validate` returns the coerced payload (e.g. numeric strings turned into
/// numbers) or the field errors. An `Err` is always a failure, even if it
/// carries no field.
pub trait RuleSet: Send + Sync {
    fn validate(&self, data: &Value) -> Result<Value, FieldErrors>;
}

impl<F> RuleSet for F
where
    F: Fn(&Value) -> Result<Value, FieldErrors> + Send + Sync,
{
    fn validate(&self, data: &Value) -> Result<Value, FieldErrors> {
        self(data)
    }
}

/// Wraps `next` with the validation gate for `rules`.
pub fn gate(rules: Arc<dyn RuleSet>, next: Handler) -> Handler {
    handler(move |res, req| {
        let next = Arc::clone(&next);
        let rules = Arc::clone(&rules);
        Box::pin(async move {
            let Some(data) = req.data() else {
                debug!(path = %req.path(), "payload unavailable, rejecting before validation");
                res.status(StatusCode::BadRequest);
                return;
            };

            match rules.validate(data) {
                Ok(coerced) => {
                    req.set_data(Some(coerced));
                    next(res, req).await;
                }
                Err(errors) => {
                    debug!(path = %req.path(), fields = errors.len(), "validation failed");
                    req.extra_mut().insert(ValidationErrors(errors));
                    res.status(StatusCode::UnprocessableEntity);
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, Request, Response};
    use serde_json::json;

    // Requires `price`, coercing numeric strings to floats.
    fn price_rules(data: &Value) -> Result<Value, FieldErrors> {
        let mut errors = FieldErrors::new();
        let mut out = data.clone();
        match data.get("price") {
            Some(Value::Number(_)) => {}
            Some(Value::String(s)) => match s.parse::<f64>() {
                Ok(n) => out["price"] = json!(n),
                Err(_) => errors.add("price", "The price must be numeric."),
            },
            _ => errors.add("price", "The price is required."),
        }
        if errors.is_empty() { Ok(out) } else { Err(errors) }
    }

    fn echo_price() -> Handler {
        handler(|res, req| {
            Box::pin(async move {
                let price = req.field("price").cloned().unwrap_or(Value::Null);
                res.json(StatusCode::Ok, &json!({ "price": price }));
            })
        })
    }

    #[tokio::test]
    async fn coerced_data_reaches_the_handler() {
        let chain = gate(Arc::new(price_rules), echo_price());
        let mut res = Response::new();
        let mut req = Request::new(Method::Post, "/");
        req.set_data(Some(json!({"price": "12.5"})));
        chain(&mut res, &mut req).await;

        assert_eq!(res.status_code(), 200);
        assert_eq!(res.body(), br#"{"price":12.5}"#);
    }

    #[tokio::test]
    async fn rule_violation_is_422_and_skips_handler() {
        let chain = gate(Arc::new(price_rules), echo_price());
        let mut res = Response::new();
        let mut req = Request::new(Method::Post, "/");
        req.set_data(Some(json!({"price": "cheap"})));
        chain(&mut res, &mut req).await;

        assert_eq!(res.status_code(), 422);
        assert!(res.is_empty());
        let errors = req.extra().get::<ValidationErrors>().unwrap();
        assert_eq!(errors.0.get("price").unwrap(), ["The price must be numeric."]);
    }

    #[tokio::test]
    async fn missing_payload_is_400() {
        let chain = gate(Arc::new(price_rules), echo_price());
        let mut res = Response::new();
        let mut req = Request::new(Method::Post, "/");
        chain(&mut res, &mut req).await;

        assert_eq!(res.status_code(), 400);
        assert!(!req.extra().contains::<ValidationErrors>());
    }

    #[test]
    fn field_errors_serialize_as_a_plain_map() {
        let mut errors = FieldErrors::new();
        errors.add("b", "second");
        errors.add("a", "first");
        errors.add("a", "again");
        assert_eq!(
            serde_json::to_value(&errors).unwrap(),
            json!({"a": ["first", "again"], "b": ["second"]})
        );
    }
}
