//! Path template parsing.
//!
//! # Responsibilities
//! - Compile `/users/{id}/posts/{post:int}` style templates into a regex
//! - Record where each named segment sits in the `/`-split path
//! - Pull parameter values back out of a concrete request path
//!
//! # Design Decisions
//! - Parameter segments match exactly one path segment (`[^/]+`)
//! - Trailing slashes are significant: `/a/{b}` never matches `/a/x/`
//! - The optional `:type` suffix is recorded but not enforced
//! - Values are read by segment index, not by regex capture groups

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

/// Errors produced while parsing a route template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// A segment opens `{` without closing `}` or the other way round.
    #[error("unbalanced braces in segment {index} (`{segment}`) of template `{template}`")]
    UnbalancedBraces {
        template: String,
        index: usize,
        segment: String,
    },

    /// `{}` or `{:type}`.
    #[error("empty parameter name in segment {index} of template `{template}`")]
    EmptyName { template: String, index: usize },

    /// Parameter names may not contain braces.
    #[error("invalid parameter name `{name}` in segment {index} of template `{template}`")]
    InvalidName {
        template: String,
        index: usize,
        name: String,
    },

    /// The same name appears twice in one template.
    #[error("duplicate parameter name `{name}` in template `{template}`")]
    DuplicateName { template: String, name: String },

    /// The generated regex failed to compile.
    #[error("template `{template}` produced an invalid pattern: {reason}")]
    InvalidPattern { template: String, reason: String },
}

/// Position and declared type of one named segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSlot {
    /// Zero-based index among the `/`-split parts of the path.
    pub index: usize,
    /// Text after the `:` in `{name:type}`, if any.
    pub type_hint: Option<String>,
}

/// A value extracted from a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathParamValue {
    pub value: String,
    pub type_hint: Option<String>,
}

/// Ordered parameter table, in declaration order.
pub type ParamTable = Vec<(String, ParamSlot)>;

/// A compiled path template.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    source: String,
    params: ParamTable,
    regex: Regex,
}

impl PathTemplate {
    /// The template text as registered.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Named segments in declaration order.
    pub fn params(&self) -> &ParamTable {
        &self.params
    }

    /// The generated matching regex.
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Returns true if `path` has the shape of this template.
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Extract this template's parameters from a concrete path.
    pub fn extract(&self, path: &str) -> HashMap<String, PathParamValue> {
        parse_request_path(path, Some(&self.params))
    }
}

/// Parse a route template.
///
/// Returns `Ok(None)` when the template contains no `{`, meaning it is a
/// plain exact or regex route and the caller decides which.
pub fn parse_template(template: &str) -> Result<Option<PathTemplate>, FormatError> {
    if !template.contains('{') {
        return Ok(None);
    }

    let normalized = if template.starts_with('/') {
        template.to_string()
    } else {
        format!("/{template}")
    };

    let mut params: ParamTable = Vec::new();
    let mut body = String::new();

    // Part 0 is the empty string before the leading slash.
    for (index, segment) in normalized.split('/').enumerate().skip(1) {
        let opens = segment.starts_with('{');
        let closes = segment.ends_with('}');

        if opens != closes || (opens && segment.len() < 2) {
            return Err(FormatError::UnbalancedBraces {
                template: template.to_string(),
                index,
                segment: segment.to_string(),
            });
        }

        if !opens {
            body.push_str(&regex::escape(segment));
            body.push('/');
            continue;
        }

        let inner = &segment[1..segment.len() - 1];
        let (name, type_hint) = match inner.split_once(':') {
            Some((name, ty)) => (name, Some(ty.to_string())),
            None => (inner, None),
        };

        if name.is_empty() {
            return Err(FormatError::EmptyName {
                template: template.to_string(),
                index,
            });
        }
        if name.contains(['{', '}']) {
            return Err(FormatError::InvalidName {
                template: template.to_string(),
                index,
                name: name.to_string(),
            });
        }
        if params.iter().any(|(existing, _)| existing == name) {
            return Err(FormatError::DuplicateName {
                template: template.to_string(),
                name: name.to_string(),
            });
        }

        params.push((name.to_string(), ParamSlot { index, type_hint }));
        body.push_str("[^/]+/");
    }

    if body.ends_with('/') {
        body.pop();
    }
    let pattern = format!("^/{body}$");

    let regex = Regex::new(&pattern).map_err(|e| FormatError::InvalidPattern {
        template: template.to_string(),
        reason: e.to_string(),
    })?;

    Ok(Some(PathTemplate {
        source: template.to_string(),
        params,
        regex,
    }))
}

/// Read the values recorded in `params` out of a concrete request path.
///
/// Returns an empty map when the table is absent or empty. Indices past the
/// end of the path are skipped.
pub fn parse_request_path(
    path: &str,
    params: Option<&ParamTable>,
) -> HashMap<String, PathParamValue> {
    let Some(params) = params.filter(|p| !p.is_empty()) else {
        return HashMap::new();
    };

    let parts: Vec<&str> = path.split('/').collect();
    params
        .iter()
        .filter_map(|(name, slot)| {
            parts.get(slot.index).map(|value| {
                (
                    name.clone(),
                    PathParamValue {
                        value: (*value).to_string(),
                        type_hint: slot.type_hint.clone(),
                    },
                )
            })
        })
        .collect()
}
