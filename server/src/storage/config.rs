//! Where keystore records are kept.
//!
//! Every record write is conditional: updates are compare-and-swap on the
//! stored version and reference claims are create-if-absent. A store that
//! cannot enforce either is refused here instead of silently losing writes.

use anyhow::{Context, Result};
use object_store::aws::{AmazonS3Builder, DynamoCommit, S3ConditionalPut};
use object_store::memory::InMemory;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::settings::env_or;

/// How an S3 bucket enforces conditional writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum ConditionalWrites {
    /// `If-Match` / `If-None-Match` preconditions (AWS S3, MinIO, R2).
    Etag,
    /// Commit locks held in a DynamoDB table next to the bucket.
    Dynamo { table: String },
}

impl ConditionalWrites {
    /// Parse `etag` or `dynamo:<table>`.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "etag" => Ok(Self::Etag),
            other => match other.split_once(':') {
                Some(("dynamo", table)) if !table.trim().is_empty() => Ok(Self::Dynamo {
                    table: table.trim().to_string(),
                }),
                _ => anyhow::bail!(
                    "Unsupported conditional write mode {other:?}. Keystore updates need \
                     conditional puts: use 'etag' or 'dynamo:<table>'"
                ),
            },
        }
    }

    fn to_s3(&self) -> S3ConditionalPut {
        match self {
            Self::Etag => S3ConditionalPut::ETagMatch,
            Self::Dynamo { table } => S3ConditionalPut::Dynamo(DynamoCommit::new(table.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
    pub conditional_writes: ConditionalWrites,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            allow_http: false,
            conditional_writes: ConditionalWrites::Etag,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Point at an S3-compatible endpoint; plain `http://` endpoints are
    /// allowed only when asked for.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>, allow_http: bool) -> Self {
        self.endpoint = Some(endpoint.into());
        self.allow_http = allow_http;
        self
    }

    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    pub fn with_conditional_writes(mut self, conditional_writes: ConditionalWrites) -> Self {
        self.conditional_writes = conditional_writes;
        self
    }

    fn build(self) -> Result<Arc<dyn ObjectStore>> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&self.bucket)
            .with_allow_http(self.allow_http)
            .with_conditional_put(self.conditional_writes.to_s3());
        if let Some(region) = self.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = self.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(access_key_id) = self.access_key_id {
            builder = builder.with_access_key_id(access_key_id);
        }
        if let Some(secret_access_key) = self.secret_access_key {
            builder = builder.with_secret_access_key(secret_access_key);
        }
        let store = builder
            .build()
            .with_context(|| format!("Failed to open keystore bucket {}", self.bucket))?;
        Ok(Arc::new(store))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "backend")]
pub enum StorageConfig {
    /// Process-local store; contents are lost on shutdown.
    Memory,
    S3(S3Config),
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn s3(config: S3Config) -> Self {
        Self::S3(config)
    }

    /// Read `STORAGE_BACKEND` and, for `s3`, the `AWS_*` variables plus
    /// `KMS_S3_CONDITIONAL_WRITES` (`etag` unless set).
    pub fn from_env() -> Result<Self> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => Ok(Self::memory()),
            "s3" => {
                let bucket = std::env::var("AWS_BUCKET")
                    .context("AWS_BUCKET is required for the s3 keystore backend")?;
                let mut config = S3Config::new(bucket);
                config.region = std::env::var("AWS_REGION").ok();
                config.endpoint = std::env::var("AWS_ENDPOINT").ok();
                config.access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok();
                config.secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok();
                config.allow_http = env_or("AWS_ALLOW_HTTP", false)?;
                if let Ok(mode) = std::env::var("KMS_S3_CONDITIONAL_WRITES") {
                    config.conditional_writes = ConditionalWrites::parse(&mode)
                        .context("Invalid value for KMS_S3_CONDITIONAL_WRITES")?;
                }
                Ok(Self::S3(config))
            }
            _ => anyhow::bail!(
                "Unknown storage backend: {}. Must be 'memory' or 's3'",
                backend
            ),
        }
    }

    /// Open the object store this config describes.
    pub(crate) fn open(self) -> Result<Arc<dyn ObjectStore>> {
        match self {
            Self::Memory => Ok(Arc::new(InMemory::new())),
            Self::S3(config) => config.build(),
        }
    }
}
