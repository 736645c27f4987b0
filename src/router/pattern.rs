//! URI template compiler.
//!
//! A template is a sequence of literal text and parameter segments:
//!
//! | Template                     | Matches               | Captured params     |
//! |------------------------------|-----------------------|---------------------|
//! | `/users`                     | `/users`              | *(none)*            |
//! | `/users/{id}`                | `/users/42`           | `id → "42"`         |
//! | `/products/{id:[0-9]+}`      | `/products/7`         | `id → "7"`          |
//! | `/files/{path:.+}`           | `/files/a/b.txt`      | `path → "a/b.txt"`  |
//!
//! `{name}` matches any run of characters up to the next `/` (`[^/]+`).
//! `{name:regex}` matches exactly the given fragment; braces inside the
//! fragment are allowed as long as they balance (`{code:[A-Z]{3}}`).
//!
//! The whole template compiles to a single anchored [`Regex`] with one named
//! group per parameter. Every failure surfaces when the route is registered,
//! never when a request arrives.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use super::RouterError;

/// Fragment used for parameters declared without an explicit regex.
pub const DEFAULT_PARAM_PATTERN: &str = "[^/]+";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param { name: String, pattern: String },
}

/// A compiled URI template.
///
/// # Examples
///
/// ```
/// use trellis::router::Pattern;
///
/// let pattern = Pattern::compile("/products/{id:[0-9]+}").unwrap();
/// assert_eq!(pattern.params(), ["id"]);
///
/// let params = pattern.matches("/products/42").unwrap();
/// assert_eq!(params["id"], "42");
/// assert!(pattern.matches("/products/abc").is_none());
/// ```
#[derive(Clone)]
pub struct Pattern {
    template: String,
    segments: Vec<Segment>,
    params: Vec<String>,
    regex: Regex,
}

impl Pattern {
    /// Compiles a full route template into an anchored matcher (`^…$`).
    ///
    /// A trailing `/` is stripped (except on the root) so `/users/` and
    /// `/users` compile identically; request paths are normalized the same way.
    ///
    /// # Errors
    ///
    /// - [`RouterError::UnbalancedBraces`] — a `{` without its `}` or vice versa.
    /// - [`RouterError::InvalidParameterName`] — a name that is empty or not an identifier.
    /// - [`RouterError::DuplicateParameter`] — the same name used twice.
    /// - [`RouterError::InvalidPattern`] — a regex fragment that does not compile.
    pub fn compile(template: &str) -> Result<Self, RouterError> {
        let template = normalize(template);
        if template.is_empty() {
            return Self::build("/".to_owned(), true);
        }
        Self::build(template, true)
    }

    /// Compiles a subrouter prefix. The result matches any path that starts
    /// with the prefix at a segment boundary.
    pub(crate) fn compile_prefix(prefix: &str) -> Result<Self, RouterError> {
        Self::build(normalize(prefix), false)
    }

    fn build(template: String, anchored_end: bool) -> Result<Self, RouterError> {
        let segments = parse(&template)?;

        let mut params: Vec<String> = Vec::new();
        let mut source = String::with_capacity(template.len() + 16);
        source.push('^');
        for segment in &segments {
            match segment {
                Segment::Literal(text) => source.push_str(&regex::escape(text)),
                Segment::Param { name, pattern } => {
                    if params.iter().any(|p| p == name) {
                        return Err(RouterError::DuplicateParameter {
                            template: template.clone(),
                            name: name.clone(),
                        });
                    }
                    params.push(name.clone());
                    source.push_str(&format!("(?P<{name}>{pattern})"));
                }
            }
        }
        source.push_str(if anchored_end { "$" } else { "(?:/|$)" });

        let regex = Regex::new(&source).map_err(|source| RouterError::InvalidPattern {
            template: template.clone(),
            source,
        })?;

        Ok(Self {
            template,
            segments,
            params,
            regex,
        })
    }

    /// The normalized template this pattern was compiled from.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Parameter names, in order of appearance.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Matches a normalized request path, extracting parameters on success.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let captures = self.regex.captures(normalize_path(path))?;
        Some(
            self.params
                .iter()
                .filter_map(|name| {
                    captures
                        .name(name)
                        .map(|m| (name.clone(), m.as_str().to_owned()))
                })
                .collect(),
        )
    }

    pub(crate) fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(normalize_path(path))
    }

    /// Rebuilds a concrete path by substituting `params` into the template.
    ///
    /// # Errors
    ///
    /// [`RouterError::MissingParameter`] when a parameter has no value.
    pub fn build_url(&self, params: &HashMap<&str, &str>) -> Result<String, RouterError> {
        let mut url = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => url.push_str(text),
                Segment::Param { name, .. } => {
                    let value = params.get(name.as_str()).ok_or_else(|| {
                        RouterError::MissingParameter {
                            template: self.template.clone(),
                            name: name.clone(),
                        }
                    })?;
                    url.push_str(value);
                }
            }
        }
        if url.is_empty() {
            url.push('/');
        }
        Ok(url)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("template", &self.template)
            .field("params", &self.params)
            .finish()
    }
}

// Ensures a leading slash and strips a trailing one. The empty string (root
// prefix) stays empty.
pub(crate) fn normalize(template: &str) -> String {
    if template.is_empty() {
        return String::new();
    }
    let mut out = if template.starts_with('/') {
        template.to_owned()
    } else {
        format!("/{template}")
    };
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

pub(crate) fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

// Splits a template into literal and parameter segments, tracking brace depth
// so regex quantifiers such as `{3}` stay inside their parameter.
fn parse(template: &str) -> Result<Vec<Segment>, RouterError> {
    let unbalanced = || RouterError::UnbalancedBraces {
        template: template.to_owned(),
    };

    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices();

    while let Some((start, c)) = chars.next() {
        match c {
            '{' => {
                let mut depth = 1usize;
                let mut end = None;
                for (i, c) in chars.by_ref() {
                    match c {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                end = Some(i);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                let end = end.ok_or_else(unbalanced)?;
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(parse_param(template, &template[start + 1..end])?);
            }
            '}' => return Err(unbalanced()),
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn parse_param(template: &str, body: &str) -> Result<Segment, RouterError> {
    let (name, pattern) = match body.split_once(':') {
        Some((name, pattern)) => (name.trim(), pattern.trim()),
        None => (body.trim(), DEFAULT_PARAM_PATTERN),
    };

    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(RouterError::InvalidParameterName {
            template: template.to_owned(),
            name: name.to_owned(),
        });
    }

    let pattern = if pattern.is_empty() {
        DEFAULT_PARAM_PATTERN
    } else {
        pattern
    };
    Ok(Segment::Param {
        name: name.to_owned(),
        pattern: pattern.to_owned(),
    })
}
