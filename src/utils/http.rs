// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use url::Url;

use crate::error::{AppError, Result};

/// User agent sent with every sync request.
pub const USER_AGENT: &str = concat!("bmsync/", env!("CARGO_PKG_VERSION"));

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?;
    Ok(client)
}

/// Parse a base URL, making sure joins append to its path.
pub fn parse_base(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| AppError::config(format!("invalid base URL '{base_url}': {e}")))?;
    if url.cannot_be_a_base() {
        return Err(AppError::config(format!("'{base_url}' cannot be a base URL")));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Resolve path segments against a base URL, percent-encoding each one.
pub fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| AppError::config(format!("'{base}' cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_to_base_path() {
        let base = parse_base("https://api.example.com/v1").unwrap();
        let url = endpoint(&base, &["sync", "history", "metadata"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/sync/history/metadata");

        let root = parse_base("http://localhost:8080").unwrap();
        assert_eq!(
            endpoint(&root, &["sync", "systems"]).unwrap().as_str(),
            "http://localhost:8080/sync/systems"
        );
    }

    #[test]
    fn test_parse_base_rejects_garbage() {
        assert!(parse_base("not a url").is_err());
        assert!(parse_base("mailto:someone@example.com").is_err());
    }
}
