//! How the client reaches the sync endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::Collection;
use crate::services::{PullResponse, PushResponse, SyncCoordinator, SyncMetadata};

/// Client view of the three sync operations.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn metadata(&self, collection: Collection) -> Result<SyncMetadata>;

    /// `since` is sent verbatim as the watermark.
    async fn pull(&self, collection: Collection, since: &str) -> Result<PullResponse>;

    async fn push(&self, collection: Collection, items: Vec<Value>) -> Result<PushResponse>;
}

/// Talks to a coordinator in the same process.
#[derive(Clone)]
pub struct LocalTransport {
    coordinator: Arc<SyncCoordinator>,
}

impl LocalTransport {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn metadata(&self, collection: Collection) -> Result<SyncMetadata> {
        self.coordinator.get_metadata(collection).await
    }

    async fn pull(&self, collection: Collection, since: &str) -> Result<PullResponse> {
        self.coordinator.pull_incremental(collection, Some(since)).await
    }

    async fn push(&self, collection: Collection, items: Vec<Value>) -> Result<PushResponse> {
        self.coordinator.push(collection, items).await
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::{Response, StatusCode};
    use serde::de::DeserializeOwned;
    use serde_json::Value;
    use url::Url;

    use super::SyncTransport;
    use crate::error::{AppError, Result};
    use crate::models::Collection;
    use crate::services::{PullResponse, PushRequest, PushResponse, SyncMetadata};
    use crate::utils::http::{create_async_client, endpoint, parse_base};

    /// Speaks the sync endpoints over HTTP.
    ///
    /// - `GET  {base}/sync/{collection}/metadata`
    /// - `GET  {base}/sync/{collection}?since=...`
    /// - `POST {base}/sync/{collection}`
    #[derive(Clone)]
    pub struct HttpTransport {
        client: reqwest::Client,
        base: Url,
    }

    impl HttpTransport {
        pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
            Ok(Self {
                client: create_async_client(timeout)?,
                base: parse_base(base_url)?,
            })
        }

        fn url(&self, collection: Collection, tail: Option<&str>) -> Result<Url> {
            let mut segments = vec!["sync", collection.as_str()];
            segments.extend(tail);
            endpoint(&self.base, &segments)
        }

        /// Map HTTP failures onto the error taxonomy, then decode the body.
        async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
            let status = response.status();
            if status.is_success() {
                return Ok(response.json().await?);
            }

            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            let message = format!("{status} from {url}: {body}");
            Err(match status {
                StatusCode::CONFLICT => AppError::conflict(url, body),
                s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                    AppError::transient(message)
                }
                _ => AppError::invalid_input(message),
            })
        }
    }

    #[async_trait]
    impl SyncTransport for HttpTransport {
        async fn metadata(&self, collection: Collection) -> Result<SyncMetadata> {
            let url = self.url(collection, Some("metadata"))?;
            let response = self.client.get(url).send().await?;
            Self::decode(response).await
        }

        async fn pull(&self, collection: Collection, since: &str) -> Result<PullResponse> {
            let url = self.url(collection, None)?;
            let response = self
                .client
                .get(url)
                .query(&[("since", since)])
                .send()
                .await?;
            Self::decode(response).await
        }

        async fn push(&self, collection: Collection, items: Vec<Value>) -> Result<PushResponse> {
            let url = self.url(collection, None)?;
            let body = PushRequest { collection, items };
            let response = self.client.post(url).json(&body).send().await?;
            Self::decode(response).await
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::storage::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_transport_forwards() {
        let coordinator = Arc::new(SyncCoordinator::new(Arc::new(MemoryStore::new()), 10));
        let transport = LocalTransport::new(coordinator);

        let pushed = transport
            .push(
                Collection::Systems,
                vec![json!({"id": "s1", "updatedAt": "2024-01-01T00:00:00Z"})],
            )
            .await
            .unwrap();
        assert_eq!(pushed.inserted, 1);

        let meta = transport.metadata(Collection::Systems).await.unwrap();
        assert_eq!(meta.record_count, 1);

        let pulled = transport
            .pull(Collection::Systems, "1970-01-01T00:00:00.000Z")
            .await
            .unwrap();
        assert_eq!(pulled.items.len(), 1);

        let err = transport.pull(Collection::Systems, "").await.unwrap_err();
        assert!(matches!(err, AppError::SyncWatermarkMissing { .. }));
    }
}
