//! Environment secrets payload and its `KEY=value` text form.
//!
//! Secrets are stored only in RAM and are zeroized on drop. Errors name the
//! offending line number, never its content.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

const COMMENT_MARKER: char = '#';
const SEPARATOR: char = '=';

/// Content parsing and validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("Malformed content on line {line}: {reason}")]
    Malformed { line: usize, reason: &'static str },

    #[error("Invalid variable {name}: {reason}")]
    InvalidVariable { name: String, reason: &'static str },

    #[error("Content is not valid UTF-8")]
    NotUtf8,

    #[error("Secret payload is empty")]
    Empty,
}

/// Named secret values, ordered by name.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretPayload {
    vars: BTreeMap<String, String>,
}

impl SecretPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a variable, returning the previous value (if any).
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.vars.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Check that every variable survives a render/parse cycle unchanged.
    pub fn validate(&self) -> Result<(), ContentError> {
        if self.vars.is_empty() {
            return Err(ContentError::Empty);
        }
        for (name, value) in &self.vars {
            let invalid = |reason| ContentError::InvalidVariable {
                name: name.clone(),
                reason,
            };
            if name.is_empty() {
                return Err(invalid("empty name"));
            }
            if name.starts_with(COMMENT_MARKER) {
                return Err(invalid("name starts with a comment marker"));
            }
            if value.is_empty() {
                return Err(invalid("empty value"));
            }
            for field in [name, value] {
                if field.contains(SEPARATOR) || field.contains(['\n', '\r']) {
                    return Err(invalid("contains '=' or a line break"));
                }
                if field.trim() != field {
                    return Err(invalid("leading or trailing whitespace"));
                }
            }
        }
        Ok(())
    }

    /// Render as newline-delimited `KEY=value` lines.
    pub fn render(&self) -> Zeroizing<String> {
        let mut out = Zeroizing::new(String::new());
        for (i, (name, value)) in self.vars.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(name);
            out.push(SEPARATOR);
            out.push_str(value);
        }
        out
    }

    /// Parse newline-delimited `KEY=value` records.
    ///
    /// Blank lines and lines starting with `#` are skipped. A line without
    /// exactly one `=`, or with an empty key or value, is an error. A
    /// repeated key keeps its last value.
    pub fn parse(content: &str) -> Result<Self, ContentError> {
        let mut payload = Self::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(COMMENT_MARKER) {
                continue;
            }
            let malformed = |reason| ContentError::Malformed {
                line: idx + 1,
                reason,
            };
            if line.matches(SEPARATOR).count() != 1 {
                return Err(malformed("expected exactly one '='"));
            }
            let (name, value) = line
                .split_once(SEPARATOR)
                .ok_or_else(|| malformed("expected exactly one '='"))?;
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() {
                return Err(malformed("empty key"));
            }
            if value.is_empty() {
                return Err(malformed("empty value"));
            }
            if let Some(mut old) = payload.insert(name, value) {
                old.zeroize();
            }
        }
        Ok(payload)
    }

    /// Parse raw decrypted bytes.
    pub fn parse_bytes(content: &[u8]) -> Result<Self, ContentError> {
        let text = std::str::from_utf8(content).map_err(|_| ContentError::NotUtf8)?;
        Self::parse(text)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SecretPayload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut payload = Self::new();
        for (k, v) in iter {
            payload.insert(k, v);
        }
        payload
    }
}

impl Drop for SecretPayload {
    fn drop(&mut self) {
        // Names are not sensitive; values are.
        for value in self.vars.values_mut() {
            value.zeroize();
        }
        self.vars.clear();
    }
}

impl fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretPayload")
            .field("names", &self.vars.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
