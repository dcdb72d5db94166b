use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration of a single keystore.
///
/// Serialized with the camelCase field names used by the persisted record and
/// the HTTP API (`kmsModule`, `referenceId`, `meterId`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreConfig {
    pub id: String,
    pub controller: String,
    /// Backend module servicing key operations; cannot change once set.
    pub kms_module: String,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_id: Option<String>,
}

impl KeystoreConfig {
    /// Create a config at sequence 0 with no reference or meter id.
    pub fn new(
        id: impl Into<String>,
        controller: impl Into<String>,
        kms_module: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            controller: controller.into(),
            kms_module: kms_module.into(),
            sequence: 0,
            reference_id: None,
            meter_id: None,
        }
    }

    pub fn with_reference_id(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn with_meter_id(mut self, meter_id: impl Into<String>) -> Self {
        self.meter_id = Some(meter_id.into());
        self
    }

    /// Returns a copy of this config with the sequence bumped by one, ready to
    /// be submitted as an update.
    pub fn next(&self) -> Self {
        let mut next = self.clone();
        next.sequence += 1;
        next
    }
}

impl fmt::Display for KeystoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.sequence)
    }
}

/// Store-maintained timestamps, persisted as epoch milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordMeta {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated: DateTime<Utc>,
}

impl RecordMeta {
    /// Both timestamps set to now, truncated to the persisted precision.
    pub fn now() -> Self {
        let now = Utc::now().trunc_subsecs(3);
        Self {
            created: now,
            updated: now,
        }
    }

    /// Keeps `created` and moves `updated` to now.
    pub fn touched(self) -> Self {
        Self {
            created: self.created,
            updated: Utc::now().trunc_subsecs(3),
        }
    }
}

/// A persisted keystore: its config plus store-maintained metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeystoreRecord {
    pub meta: RecordMeta,
    pub config: KeystoreConfig,
}

/// Metered storage usage for a meter, in storage units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageUsage {
    pub storage: u64,
}

/// Number of keys held by a keystore, as reported by its backend module.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyCount {
    pub count: u64,
}
