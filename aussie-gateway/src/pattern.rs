//! Path pattern matching and rewriting
//!
//! Patterns are matched on `/`-separated segments, case-sensitively.
//! Supported segment forms:
//!
//! - literal text (`users`)
//! - `*` -- exactly one segment
//! - `**` -- zero or more segments
//! - `{name}` -- exactly one segment, captured as a path variable
//!
//! Rewrite templates replace each `{name}` with the captured value and
//! leave every other segment untouched.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// One parsed pattern segment
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
    DeepWildcard,
    Variable(String),
}

/// A compiled path pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

/// Variables captured by a successful pattern match
pub type PathVariables = HashMap<String, String>;

impl PathPattern {
    /// Parse a pattern string
    ///
    /// The pattern must be non-blank. A leading `/` is implied when
    /// missing so `/api/x` and `api/x` compile identically.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Blank);
        }

        let normalized = trimmed.strip_prefix('/').unwrap_or(trimmed);
        let mut segments = Vec::new();
        let mut seen_vars: Vec<&str> = Vec::new();

        // The root pattern "/" compiles to zero segments
        for part in normalized.split('/').filter(|p| !p.is_empty()) {
            let segment = match part {
                "*" => Segment::Wildcard,
                "**" => Segment::DeepWildcard,
                _ if part.starts_with('{') && part.ends_with('}') => {
                    let name = &part[1..part.len() - 1];
                    if name.is_empty() {
                        return Err(PatternError::EmptyVariable(pattern.to_string()));
                    }
                    if seen_vars.contains(&name) {
                        return Err(PatternError::DuplicateVariable {
                            pattern: pattern.to_string(),
                            name: name.to_string(),
                        });
                    }
                    seen_vars.push(name);
                    Segment::Variable(name.to_string())
                }
                _ if part.contains(['{', '}', '*']) => {
                    return Err(PatternError::MalformedSegment {
                        pattern: pattern.to_string(),
                        segment: part.to_string(),
                    });
                }
                _ => Segment::Literal(part.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    /// The original pattern text
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of all `{name}` variables in declaration order
    pub fn variable_names(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Variable(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The longest run of leading literal segments, as a `/`-joined path
    ///
    /// Used to decide whether a service "claims" a path when none of its
    /// endpoint patterns match outright.
    pub fn literal_prefix(&self) -> String {
        let mut prefix = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => {
                    prefix.push('/');
                    prefix.push_str(text);
                }
                _ => break,
            }
        }
        if prefix.is_empty() {
            prefix.push('/');
        }
        prefix
    }

    /// Match a request path, returning captured variables on success
    pub fn matches(&self, path: &str) -> Option<PathVariables> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let mut vars = PathVariables::new();
        if match_segments(&self.segments, &parts, &mut vars) {
            Some(vars)
        } else {
            None
        }
    }
}

/// Backtracking segment matcher; `**` tries the shortest expansion first
fn match_segments(pattern: &[Segment], path: &[&str], vars: &mut PathVariables) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(Segment::Literal(text)) => match path.first() {
            Some(part) if part == text => match_segments(&pattern[1..], &path[1..], vars),
            _ => false,
        },
        Some(Segment::Wildcard) => {
            !path.is_empty() && match_segments(&pattern[1..], &path[1..], vars)
        }
        Some(Segment::Variable(name)) => match path.first() {
            Some(part) => {
                vars.insert(name.clone(), (*part).to_string());
                if match_segments(&pattern[1..], &path[1..], vars) {
                    true
                } else {
                    vars.remove(name);
                    false
                }
            }
            None => false,
        },
        Some(Segment::DeepWildcard) => {
            for skip in 0..=path.len() {
                if match_segments(&pattern[1..], &path[skip..], vars) {
                    return true;
                }
            }
            false
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for PathPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PathPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for PathPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A rewrite template applied to captured path variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteTemplate {
    raw: String,
    variables: Vec<String>,
}

impl RewriteTemplate {
    /// Parse a rewrite template
    ///
    /// Each `{name}` may appear at most once.
    pub fn parse(template: &str) -> Result<Self, PatternError> {
        let trimmed = template.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Blank);
        }

        let mut variables = Vec::new();
        for part in trimmed.split('/') {
            if part.starts_with('{') && part.ends_with('}') && part.len() > 2 {
                let name = part[1..part.len() - 1].to_string();
                if variables.contains(&name) {
                    return Err(PatternError::DuplicateVariable {
                        pattern: template.to_string(),
                        name,
                    });
                }
                variables.push(name);
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            variables,
        })
    }

    /// The original template text
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of all `{name}` placeholders
    pub fn variable_names(&self) -> &[String] {
        &self.variables
    }

    /// Apply the template, substituting captured variables
    ///
    /// Every placeholder must have a captured value; registration-time
    /// validation guarantees this for templates paired with a pattern.
    pub fn apply(&self, variables: &PathVariables) -> Result<String, PatternError> {
        let mut out = String::new();
        let body = self.raw.strip_prefix('/').unwrap_or(&self.raw);
        for part in body.split('/').filter(|p| !p.is_empty()) {
            out.push('/');
            if part.starts_with('{') && part.ends_with('}') && part.len() > 2 {
                let name = &part[1..part.len() - 1];
                match variables.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(PatternError::UnboundVariable {
                            pattern: self.raw.clone(),
                            name: name.to_string(),
                        })
                    }
                }
            } else {
                out.push_str(part);
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        Ok(out)
    }
}

impl Serialize for RewriteTemplate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for RewriteTemplate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A set of HTTP methods, compared case-insensitively
///
/// The single entry `*` matches any method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodSet(Vec<String>);

impl MethodSet {
    /// Build from method names; values are upper-cased on construction
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            methods
                .into_iter()
                .map(|m| m.as_ref().trim().to_ascii_uppercase())
                .collect(),
        )
    }

    /// The wildcard set matching every method
    pub fn any() -> Self {
        Self(vec!["*".to_string()])
    }

    /// Whether the set matches the given method
    pub fn matches(&self, method: &str) -> bool {
        self.0
            .iter()
            .any(|m| m == "*" || m.eq_ignore_ascii_case(method))
    }

    /// Whether the set is empty (matches nothing)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The declared method names
    pub fn names(&self) -> &[String] {
        &self.0
    }
}

/// Pattern parsing and rewrite errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("pattern must not be blank")]
    Blank,

    #[error("pattern '{pattern}' contains a malformed segment '{segment}'")]
    MalformedSegment { pattern: String, segment: String },

    #[error("pattern '{0}' contains an empty variable name")]
    EmptyVariable(String),

    #[error("variable '{{{name}}}' appears more than once in '{pattern}'")]
    DuplicateVariable { pattern: String, name: String },

    #[error("rewrite template '{pattern}' references unbound variable '{{{name}}}'")]
    UnboundVariable { pattern: String, name: String },
}
