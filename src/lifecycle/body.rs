//! Request payload decoding.
//!
//! Produces the value stored in `Request::data`: the query string merged with
//! the decoded body, body keys winning. Supported bodies:
//!
//! - `application/json` (and `*/*+json`): must be a JSON object;
//! - `application/x-www-form-urlencoded`: flattened to string fields;
//! - `multipart/form-data`: text parts as string fields, file parts as
//!   `{"filename", "contentType", "size"}` objects.
//!
//! Repeated form or query keys collect into arrays. Any other content type
//! leaves the body undecoded; the raw bytes stay available on the request.

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::http::Request;
use crate::http::request::parse_query_string;

const MAX_PART_HEADERS: usize = 16;

/// Why a request body could not become request data.
///
/// Stored in `Request::extra` for the status handlers; never returned from
/// dispatch.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds the limit of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON body must be an object")]
    NotAnObject,

    #[error("malformed form body: {0}")]
    Form(String),

    #[error("malformed multipart body: {0}")]
    Multipart(String),
}

/// Decodes `req`'s query string and body into one JSON object.
///
/// The size check runs first, on both the declared `Content-Length` and the
/// bytes actually received, so an oversized body is never decoded.
pub fn parse(req: &Request, max_bytes: usize) -> Result<Value, BodyError> {
    let declared = req.content_length().unwrap_or(0);
    if declared > max_bytes || req.body().len() > max_bytes {
        return Err(BodyError::TooLarge { max_bytes });
    }

    let mut data = Map::new();
    for (key, value) in req.query_pairs() {
        push_field(&mut data, key.clone(), Value::String(value.clone()));
    }

    let body = req.body();
    if body.is_empty() {
        return Ok(Value::Object(data));
    }

    match req.content_type() {
        Some(ct) if is_json(ct) => match serde_json::from_slice(body)? {
            Value::Object(fields) => data.extend(fields),
            _ => return Err(BodyError::NotAnObject),
        },
        Some("application/x-www-form-urlencoded") => {
            let text = std::str::from_utf8(body).map_err(|e| BodyError::Form(e.to_string()))?;
            let mut fields = Map::new();
            for (key, value) in parse_query_string(text) {
                push_field(&mut fields, key, Value::String(value));
            }
            data.extend(fields);
        }
        Some("multipart/form-data") => {
            let header = req.headers().get("content-type").unwrap_or_default();
            data.extend(multipart(header, body)?);
        }
        _ => {}
    }

    Ok(Value::Object(data))
}

fn is_json(content_type: &str) -> bool {
    content_type == "application/json" || content_type.ends_with("+json")
}

// Inserts `value`, turning a repeated key into an array of every value seen.
fn push_field(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(key, value);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn multipart(content_type: &str, body: &[u8]) -> Result<Map<String, Value>, BodyError> {
    let boundary = content_type
        .split(';')
        .find_map(|p| p.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .filter(|b| !b.is_empty())
        .ok_or_else(|| BodyError::Multipart("missing boundary".to_owned()))?;
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut fields = Map::new();
    let Some(first) = find(body, delimiter) else {
        return Err(BodyError::Multipart("no parts found".to_owned()));
    };
    let mut rest = &body[first + delimiter.len()..];

    loop {
        if rest.starts_with(b"--") {
            break;
        }
        let Some(end) = find(rest, delimiter) else {
            return Err(BodyError::Multipart("unterminated part".to_owned()));
        };
        let part = &rest[..end];
        let part = part.strip_prefix(b"\r\n").unwrap_or(part);
        let part = part.strip_suffix(b"\r\n").unwrap_or(part);
        read_part(part, &mut fields)?;
        rest = &rest[end + delimiter.len()..];
    }

    Ok(fields)
}

fn read_part(part: &[u8], fields: &mut Map<String, Value>) -> Result<(), BodyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
    let (offset, headers) = match httparse::parse_headers(part, &mut headers) {
        Ok(httparse::Status::Complete(parsed)) => parsed,
        Ok(httparse::Status::Partial) => {
            return Err(BodyError::Multipart("truncated part headers".to_owned()));
        }
        Err(e) => return Err(BodyError::Multipart(e.to_string())),
    };
    let content = &part[offset..];

    let header = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
    };

    let Some(disposition) = header("content-disposition") else {
        return Ok(());
    };
    let param = |key: &str| {
        disposition
            .split(';')
            .find_map(|p| p.trim().strip_prefix(key)?.strip_prefix('='))
            .map(|v| v.trim_matches('"').to_owned())
    };
    let Some(name) = param("name") else {
        return Ok(());
    };

    let value = match param("filename") {
        Some(filename) => json!({
            "filename": filename,
            "contentType": header("content-type").unwrap_or("application/octet-stream"),
            "size": content.len(),
        }),
        None => match std::str::from_utf8(content) {
            Ok(text) => Value::String(text.to_owned()),
            Err(_) => {
                return Err(BodyError::Multipart(format!("field `{name}` is not valid UTF-8")));
            }
        },
    };
    push_field(fields, name, value);
    Ok(())
}
