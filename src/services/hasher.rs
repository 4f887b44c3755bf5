// src/services/hasher.rs

//! Content addressing of uploaded images.
//!
//! The digest is taken over the decoded image bytes, so the same picture
//! hashes identically whether it arrives raw, as base64, or as a data URL.

use std::borrow::Cow;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::models::ContentHash;

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// An uploaded image as received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    /// Raw file bytes
    Bytes(Vec<u8>),
    /// Base64 text, optionally wrapped in a `data:` URL
    Encoded(String),
}

impl ImageInput {
    /// Decode to raw bytes, stripping any data-URL prefix and whitespace.
    pub fn decode(&self) -> Result<Cow<'_, [u8]>> {
        let bytes = match self {
            ImageInput::Bytes(bytes) => Cow::Borrowed(bytes.as_slice()),
            ImageInput::Encoded(text) => {
                let payload = strip_data_url(text)?;
                let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
                if compact.is_empty() {
                    return Err(AppError::invalid_input("image payload is empty"));
                }
                let decoded = LENIENT_BASE64
                    .decode(compact.as_bytes())
                    .map_err(|e| AppError::invalid_input(format!("image is not valid base64: {e}")))?;
                Cow::Owned(decoded)
            }
        };

        if bytes.is_empty() {
            return Err(AppError::invalid_input("image payload is empty"));
        }
        Ok(bytes)
    }
}

/// Strip a `data:<mime>;base64,` prefix if present.
fn strip_data_url(text: &str) -> Result<&str> {
    let trimmed = text.trim_start();
    if !trimmed.starts_with("data:") {
        return Ok(trimmed);
    }
    match trimmed.split_once(',') {
        Some((_, payload)) => Ok(payload),
        None => Err(AppError::invalid_input("data URL has no payload")),
    }
}

/// Deterministic SHA-256 content hasher.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher;

impl ContentHasher {
    pub fn new() -> Self {
        Self
    }

    /// Hash an uploaded image.
    ///
    /// Returns `InvalidInput` for empty or undecodable payloads rather than a
    /// placeholder digest, so callers can tell "no hash" from "odd hash".
    pub fn hash(&self, input: &ImageInput) -> Result<ContentHash> {
        let bytes = input.decode()?;
        Ok(Self::hash_bytes(&bytes))
    }

    fn hash_bytes(bytes: &[u8]) -> ContentHash {
        let digest = Sha256::digest(bytes);
        ContentHash::from_digest(&digest)
    }
}

/// Convenience function to hash an image.
pub fn hash_image(input: &ImageInput) -> Result<ContentHash> {
    ContentHasher::new().hash(input)
}
