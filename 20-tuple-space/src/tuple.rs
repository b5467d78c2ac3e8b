//! Tuples and search patterns.
//!
//! Tuples are opaque strings such as `<a,1>`. The store never looks inside
//! them; all matching is a regular expression applied to the whole string.

use std::fmt;

use regex::Regex;
use thiserror::Error;

const BEGIN_TUPLE: char = '<';
const END_TUPLE: char = '>';

/// Rejected caller input.
#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("malformed tuple {0:?}: expected <field[,field...]> without whitespace")]
    MalformedTuple(String),
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Checks that `tuple` has the `<f1,f2,...>` shape.
pub fn validate_tuple(tuple: &str) -> Result<(), ArgumentError> {
    let well_formed = tuple.len() >= 2
        && tuple.starts_with(BEGIN_TUPLE)
        && tuple.ends_with(END_TUPLE)
        && !tuple.chars().any(char::is_whitespace);
    if well_formed {
        Ok(())
    } else {
        Err(ArgumentError::MalformedTuple(tuple.to_string()))
    }
}

/// A compiled search pattern.
///
/// The source is anchored on both ends, so `<a,.*>` matches `<a,1>` but not
/// `x<a,1>`.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self, ArgumentError> {
        let regex = Regex::new(&format!("^(?:{source})$")).map_err(|source_err| {
            ArgumentError::InvalidPattern {
                pattern: source.to_string(),
                source: source_err,
            }
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    /// Pattern that matches exactly `tuple`, metacharacters included.
    pub fn exact(tuple: &str) -> Result<Self, ArgumentError> {
        Self::new(&regex::escape(tuple))
    }

    pub fn matches(&self, tuple: &str) -> bool {
        self.regex.is_match(tuple)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
