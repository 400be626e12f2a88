//! Typed claim path expressions
//!
//! A [`ClaimPath`] addresses a value inside a JSON claim set:
//!
//! - `roles` - top-level member
//! - `realm_access.roles` - nested object member
//! - `groups[0]` - array element
//! - `["https://app.example.com/roles"]` - member whose name contains dots
//!
//! Paths are parsed once, when configuration is loaded, and evaluated without
//! recursion limits being reachable at runtime: a parsed path never has more
//! than [`MAX_PATH_DEPTH`] steps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Maximum number of steps in a claim path
pub const MAX_PATH_DEPTH: usize = 16;

/// A single navigation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Object member lookup
    Key(String),
    /// Array element lookup
    Index(usize),
}

/// Parsed claim path
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClaimPath {
    source: String,
    segments: Vec<PathSegment>,
}

/// Claim path parse error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimPathError {
    #[error("claim path is empty")]
    Empty,
    #[error("claim path exceeds {MAX_PATH_DEPTH} segments")]
    TooDeep,
    #[error("unexpected character '{ch}' at offset {offset}")]
    Unexpected { ch: char, offset: usize },
    #[error("unterminated bracket expression")]
    Unterminated,
    #[error("empty member name at offset {0}")]
    EmptyKey(usize),
}

impl ClaimPath {
    /// Parse a claim path expression
    ///
    /// # Errors
    ///
    /// Returns [`ClaimPathError`] for empty, over-deep, or syntactically
    /// invalid expressions.
    pub fn parse(expr: &str) -> Result<Self, ClaimPathError> {
        let segments = parse_segments(expr)?;
        Ok(Self {
            source: expr.to_string(),
            segments,
        })
    }

    /// Single top-level member lookup
    pub fn key(name: &str) -> Self {
        Self {
            source: name.to_string(),
            segments: vec![PathSegment::Key(name.to_string())],
        }
    }

    /// Path as originally written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Parsed navigation steps
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Resolve this path against a claim set
    ///
    /// Returns `None` when any step is missing. A JSON `null` that is present
    /// resolves to `Some(&Value::Null)`.
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |current, segment| match segment {
                PathSegment::Key(key) => current.as_object()?.get(key),
                PathSegment::Index(index) => current.as_array()?.get(*index),
            })
    }

    /// Resolve and flatten to a list of strings
    ///
    /// Accepts a single string, an array of strings (non-string elements are
    /// skipped), or, when `split_whitespace` is set, a space-delimited string
    /// such as the OAuth `scope` claim.
    pub fn resolve_strings(&self, root: &Value, split_whitespace: bool) -> Vec<String> {
        match self.resolve(root) {
            Some(Value::String(s)) if split_whitespace => {
                s.split_whitespace().map(str::to_string).collect()
            }
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Debug for ClaimPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimPath({:?})", self.source)
    }
}

impl fmt::Display for ClaimPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for ClaimPath {
    type Error = ClaimPathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let segments = parse_segments(&value)?;
        Ok(Self {
            source: value,
            segments,
        })
    }
}

impl From<ClaimPath> for String {
    fn from(path: ClaimPath) -> Self {
        path.source
    }
}

impl std::str::FromStr for ClaimPath {
    type Err = ClaimPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_segments(expr: &str) -> Result<Vec<PathSegment>, ClaimPathError> {
    if expr.is_empty() {
        return Err(ClaimPathError::Empty);
    }

    let chars: Vec<(usize, char)> = expr.char_indices().collect();
    let mut segments = Vec::new();
    let mut pos = 0;
    // A '.' is only legal right after a completed segment
    let mut expect_key = true;

    while pos < chars.len() {
        let (offset, ch) = chars[pos];
        match ch {
            '[' => {
                let (segment, next) = parse_bracket(&chars, pos)?;
                segments.push(segment);
                pos = next;
                expect_key = false;
            }
            '.' if !expect_key => {
                pos += 1;
                expect_key = true;
                if pos == chars.len() {
                    return Err(ClaimPathError::EmptyKey(offset + 1));
                }
                if chars[pos].1 == '.' {
                    return Err(ClaimPathError::EmptyKey(chars[pos].0));
                }
            }
            '.' | ']' | '"' => return Err(ClaimPathError::Unexpected { ch, offset }),
            _ => {
                if !expect_key {
                    return Err(ClaimPathError::Unexpected { ch, offset });
                }
                let start = pos;
                while pos < chars.len() && !matches!(chars[pos].1, '.' | '[' | ']' | '"') {
                    pos += 1;
                }
                let key: String = chars[start..pos].iter().map(|(_, c)| *c).collect();
                segments.push(PathSegment::Key(key));
                expect_key = false;
            }
        }

        if segments.len() > MAX_PATH_DEPTH {
            return Err(ClaimPathError::TooDeep);
        }
    }

    Ok(segments)
}

/// Parse `[<digits>]` or `["<name>"]` starting at `chars[pos] == '['`
fn parse_bracket(
    chars: &[(usize, char)],
    pos: usize,
) -> Result<(PathSegment, usize), ClaimPathError> {
    let mut cursor = pos + 1;
    let first = chars.get(cursor).ok_or(ClaimPathError::Unterminated)?;

    if first.1 == '"' {
        cursor += 1;
        let start = cursor;
        while cursor < chars.len() && chars[cursor].1 != '"' {
            cursor += 1;
        }
        if cursor >= chars.len() {
            return Err(ClaimPathError::Unterminated);
        }
        let key: String = chars[start..cursor].iter().map(|(_, c)| *c).collect();
        if key.is_empty() {
            return Err(ClaimPathError::EmptyKey(chars[start - 1].0));
        }
        cursor += 1;
        match chars.get(cursor) {
            Some((_, ']')) => Ok((PathSegment::Key(key), cursor + 1)),
            Some(&(offset, ch)) => Err(ClaimPathError::Unexpected { ch, offset }),
            None => Err(ClaimPathError::Unterminated),
        }
    } else {
        let start = cursor;
        while cursor < chars.len() && chars[cursor].1.is_ascii_digit() {
            cursor += 1;
        }
        match chars.get(cursor) {
            Some((_, ']')) if cursor > start => {
                let digits: String = chars[start..cursor].iter().map(|(_, c)| *c).collect();
                let index = digits.parse::<usize>().map_err(|_| ClaimPathError::Unexpected {
                    ch: chars[start].1,
                    offset: chars[start].0,
                })?;
                Ok((PathSegment::Index(index), cursor + 1))
            }
            Some(&(offset, ch)) => Err(ClaimPathError::Unexpected { ch, offset }),
            None => Err(ClaimPathError::Unterminated),
        }
    }
}
