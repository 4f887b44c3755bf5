//! Content hash identifier.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 digest of an uploaded image's decoded bytes.
///
/// Only constructed through [`ContentHash::parse`] or the hasher, so every
/// value is exactly 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Validate an externally supplied hash string.
    pub fn parse(value: &str) -> Result<Self> {
        let well_formed = value.len() == HASH_HEX_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(AppError::invalid_input(format!(
                "content hash must be {HASH_HEX_LEN} lowercase hex characters"
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_lowercase_hex() {
        let hex = "a".repeat(64);
        assert_eq!(ContentHash::parse(&hex).unwrap().as_str(), hex);
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(ContentHash::parse("").is_err());
        assert!(ContentHash::parse(&"a".repeat(63)).is_err());
        assert!(ContentHash::parse(&"A".repeat(64)).is_err());
        assert!(ContentHash::parse(&"g".repeat(64)).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let bad: std::result::Result<ContentHash, _> = serde_json::from_str("\"xyz\"");
        assert!(bad.is_err());
    }
}
