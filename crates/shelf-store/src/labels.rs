//! Ordered key/value labels and their on-disk line encoding.
//!
//! A labeled object starts with one `key value\n` line per label, followed
//! by a single NUL byte and then the body:
//!
//! ```text
//! type consensus\n
//! flavor ns\n
//! \0<body bytes...>
//! ```

use crate::{Result, StoreError};

/// Separates the label block from the body.
pub const LABEL_TERMINATOR: u8 = 0;

/// A single `(key, value)` label.
pub type Label = (String, String);

/// Ordered list of labels attached to an object.
///
/// Keys are meant to be unique. When they are not, [`Labels::get`] returns
/// the value of the first pair with the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
    pairs: Vec<Label>,
}

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Value of the first label named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// True if the first label named `key` has exactly `value`.
    pub fn matches(&self, key: &str, value: &str) -> bool {
        self.get(key) == Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Check every pair against the line encoding rules.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in &self.pairs {
            if key.is_empty() {
                return Err(invalid(key, "key is empty"));
            }
            if key.bytes().any(|b| b.is_ascii_whitespace() || b == LABEL_TERMINATOR) {
                return Err(invalid(key, "key contains whitespace or NUL"));
            }
            if value.bytes().any(|b| b == b'\n' || b == LABEL_TERMINATOR) {
                return Err(invalid(key, "value contains newline or NUL"));
            }
        }
        Ok(())
    }

    /// Encode the label block, including the trailing NUL.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let mut out = Vec::new();
        for (key, value) in &self.pairs {
            out.extend_from_slice(key.as_bytes());
            out.push(b' ');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.push(LABEL_TERMINATOR);
        Ok(out)
    }

    /// Decode the label block at the start of `data`.
    ///
    /// Returns the labels and the offset of the first body byte. `name` is
    /// only used for error reporting.
    pub fn decode(name: &str, data: &[u8]) -> Result<(Labels, usize)> {
        let end = body_offset(name, data)? - 1;
        let text = std::str::from_utf8(&data[..end]).map_err(|_| StoreError::Corrupt {
            name: name.to_string(),
            reason: "labels are not valid UTF-8".to_string(),
        })?;

        let mut labels = Labels::new();
        for line in text.split_terminator('\n') {
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            if key.is_empty() {
                return Err(StoreError::Corrupt {
                    name: name.to_string(),
                    reason: "label line with empty key".to_string(),
                });
            }
            labels.push(key, value);
        }
        Ok((labels, end + 1))
    }
}

/// Offset of the first body byte, without decoding the labels.
pub fn body_offset(name: &str, data: &[u8]) -> Result<usize> {
    data.iter()
        .position(|&b| b == LABEL_TERMINATOR)
        .map(|pos| pos + 1)
        .ok_or_else(|| StoreError::Corrupt {
            name: name.to_string(),
            reason: "missing label terminator".to_string(),
        })
}

fn invalid(key: &str, reason: &str) -> StoreError {
    StoreError::InvalidLabel {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
