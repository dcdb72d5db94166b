use serde::{Deserialize, Serialize};
use shared_types::KeystoreRecord;

use crate::storage::{FindOptions, KeystoreQuery, SortField, SortOrder};

/// Query string of `GET /keystores`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindKeystoresParams {
    pub controller: String,
    pub reference_id: Option<String>,
    pub meter_id: Option<String>,
    pub kms_module: Option<String>,
    pub sort: Option<SortField>,
    /// Ignored without `sort`; defaults to ascending.
    pub order: Option<SortOrder>,
    pub limit: Option<usize>,
}

impl FindKeystoresParams {
    pub fn query(&self) -> KeystoreQuery {
        KeystoreQuery {
            reference_id: self.reference_id.clone(),
            meter_id: self.meter_id.clone(),
            kms_module: self.kms_module.clone(),
        }
    }

    pub fn options(&self) -> FindOptions {
        FindOptions {
            sort: self
                .sort
                .map(|field| (field, self.order.unwrap_or_default())),
            limit: self.limit,
        }
    }
}

/// Query string of `GET /keystores/:id`
#[derive(Debug, Default, Deserialize)]
pub struct GetKeystoreParams {
    #[serde(default)]
    pub fresh: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FindKeystoresResponse {
    pub records: Vec<KeystoreRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateKeystoreResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Kind name, e.g. `DuplicateError`
    pub error: String,
    pub details: Option<String>,
}
