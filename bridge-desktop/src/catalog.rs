//! Media catalog backed by the Emby HTTP API

use async_trait::async_trait;
use bridge_traits::{
    catalog::{CatalogEpisode, MediaCatalog},
    error::{BridgeError, Result},
};
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ItemsResponse {
    #[serde(default)]
    items: Vec<EmbyItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EmbyItem {
    id: String,
    path: Option<String>,
}

/// [`MediaCatalog`] over the Emby REST API
///
/// Requests are retried up to three times with exponential backoff
/// (1s, 2s) on transport errors, 5xx and 429 responses.
pub struct EmbyCatalog {
    client: Client,
    base_url: String,
    api_key: String,
    max_attempts: u32,
    base_delay: Duration,
}

impl EmbyCatalog {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .user_agent("smart-cache/0.1.0")
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
        })
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_delay = base_delay;
        self
    }

    async fn get_items(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Vec<EmbyItem>> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            debug!(attempt = attempt + 1, url = %url, "Querying media server");

            let response = self
                .client
                .get(&url)
                .header("X-Emby-Token", &self.api_key)
                .query(query)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    let body: ItemsResponse = response
                        .json()
                        .await
                        .map_err(|e| BridgeError::OperationFailed(format!("invalid response: {}", e)))?;
                    return Ok(body.items);
                }
                Ok(response) => {
                    let status = response.status();
                    if !(status.is_server_error() || status.as_u16() == 429) {
                        return Err(BridgeError::OperationFailed(format!(
                            "media server returned {}",
                            status
                        )));
                    }
                    warn!(status = status.as_u16(), attempt = attempt + 1, "Media server request failed");
                    last_error = Some(BridgeError::OperationFailed(format!("HTTP {} error", status)));
                }
                Err(e) => {
                    warn!(error = %e, attempt = attempt + 1, "Media server request failed");
                    last_error = Some(if e.is_timeout() {
                        BridgeError::Timeout(url.clone())
                    } else {
                        BridgeError::OperationFailed(e.to_string())
                    });
                }
            }

            if attempt + 1 < self.max_attempts {
                sleep(self.base_delay * 2u32.pow(attempt)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BridgeError::OperationFailed("All retry attempts exhausted".to_string())
        }))
    }
}

#[async_trait]
impl MediaCatalog for EmbyCatalog {
    async fn resolve_path(&self, item_id: &str) -> Result<Option<PathBuf>> {
        let items = self
            .get_items(
                "/Items",
                &[("Ids", item_id.to_string()), ("Fields", "Path".to_string())],
            )
            .await?;

        Ok(items
            .into_iter()
            .find(|item| item.id == item_id)
            .and_then(|item| item.path)
            .map(PathBuf::from))
    }

    async fn next_episodes(
        &self,
        user_id: &str,
        series_id: &str,
        limit: usize,
    ) -> Result<Vec<CatalogEpisode>> {
        let items = self
            .get_items(
                "/Shows/NextUp",
                &[
                    ("UserId", user_id.to_string()),
                    ("SeriesId", series_id.to_string()),
                    ("Limit", limit.to_string()),
                    ("Fields", "Path".to_string()),
                ],
            )
            .await?;

        Ok(items
            .into_iter()
            .take(limit)
            .map(|item| CatalogEpisode {
                item_id: item.id,
                path: item.path.map(PathBuf::from),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_items_response() {
        let body = r#"{"Items":[{"Id":"42","Path":"/media/tv/Show/S01E02.mkv","Name":"Two"},{"Id":"43"}],"TotalRecordCount":2}"#;
        let parsed: ItemsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[0].path.as_deref(), Some("/media/tv/Show/S01E02.mkv"));
        assert_eq!(parsed.items[1].path, None);
    }

    #[test]
    fn test_base_url_is_normalised() {
        let catalog = EmbyCatalog::new("http://emby:8096/", "key").unwrap();
        assert_eq!(catalog.base_url, "http://emby:8096");
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_after_retries() {
        let catalog = EmbyCatalog::new("http://127.0.0.1:9", "key")
            .unwrap()
            .with_retry(2, Duration::from_millis(1));
        assert!(catalog.resolve_path("1").await.is_err());
    }
}
