use anyhow::{Context, Result};
use reqwest::{Client as ReqwestClient, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared_types::{KeystoreConfig, KeystoreRecord, StorageUsage};
use std::time::Duration;
use tracing::debug;

/// Optional filters and shaping for [`KeystoreClient::find`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kms_module: Option<String>,
    /// One of `id`, `sequence`, `created`, `updated`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    /// `asc` or `desc`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    details: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    records: Vec<KeystoreRecord>,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    success: bool,
}

/// Client for interacting with the keystore configuration service
pub struct KeystoreClient {
    client: ReqwestClient,
    base_url: String,
}

impl KeystoreClient {
    /// Create a new client instance
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = ReqwestClient::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Build `<base_url>/<segments...>`, percent-encoding each segment.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid base URL: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Base URL cannot carry a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Create a keystore config; `config.sequence` must be 0
    pub async fn insert(&self, config: &KeystoreConfig) -> Result<KeystoreRecord> {
        let url = self.url(&["keystores"])?;
        debug!("Inserting keystore {}", config.id);

        let response = self.client.post(url).json(config).send().await?;
        read_json(response).await
    }

    /// Get a keystore config; `fresh` bypasses the server's cache
    pub async fn get(&self, id: &str, fresh: bool) -> Result<KeystoreRecord> {
        let mut url = self.url(&["keystores", id])?;
        if fresh {
            url.query_pairs_mut().append_pair("fresh", "true");
        }

        let response = self.client.get(url).send().await?;
        read_json(response).await
    }

    /// Update a keystore config; `config.sequence` must be one past the
    /// stored sequence
    pub async fn update(&self, config: &KeystoreConfig) -> Result<bool> {
        let url = self.url(&["keystores", &config.id])?;
        debug!("Updating keystore {}", config);

        let response = self.client.post(url).json(config).send().await?;
        let result: UpdateResponse = read_json(response).await?;
        Ok(result.success)
    }

    /// Find the keystore configs of a controller
    pub async fn find(&self, controller: &str, params: &FindParams) -> Result<Vec<KeystoreRecord>> {
        let url = self.url(&["keystores"])?;

        let response = self
            .client
            .get(url)
            .query(&[("controller", controller)])
            .query(params)
            .send()
            .await?;
        let result: FindResponse = read_json(response).await?;
        Ok(result.records)
    }

    /// Metered storage of every keystore under a meter
    pub async fn get_storage_usage(&self, meter_id: &str) -> Result<StorageUsage> {
        let url = self.url(&["meters", meter_id, "usage"])?;

        let response = self.client.get(url).send().await?;
        read_json(response).await
    }

    /// Check if the service is healthy
    pub async fn health_check(&self) -> Result<bool> {
        let url = self.url(&["health"])?;

        let response = self.client.get(url).send().await?;

        Ok(response.status() == StatusCode::OK)
    }
}

/// Decode a success body, or turn an error body into an error carrying the
/// service's error kind.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await?;
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody {
            error,
            details: Some(details),
        }) => anyhow::bail!("{error} ({status}): {details}"),
        Ok(ErrorBody { error, details: None }) => anyhow::bail!("{error} ({status})"),
        Err(_) => anyhow::bail!("Request failed ({status}): {body}"),
    }
}
