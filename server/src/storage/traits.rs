use async_trait::async_trait;
use shared_types::{KeystoreConfig, KeystoreRecord};

use super::indexes::QueryPlan;
use super::query::{ExplainTarget, FindOptions, KeystoreQuery};
use crate::error::KeystoreResult;

/// Durable storage for keystore records.
///
/// Implementations own uniqueness of `config.id` and of
/// `(config.controller, config.referenceId)`, and must make
/// [`compare_and_swap`](KeystoreStorage::compare_and_swap) atomic per record.
#[async_trait]
pub trait KeystoreStorage: Send + Sync {
    /// Create a record.
    ///
    /// # Errors
    /// Returns `KeystoreError::Duplicate` if the id or the controller's
    /// reference id is already taken.
    async fn insert(&self, record: &KeystoreRecord) -> KeystoreResult<()>;

    async fn get(&self, id: &str) -> KeystoreResult<Option<KeystoreRecord>>;

    async fn find(
        &self,
        controller: &str,
        query: &KeystoreQuery,
        options: &FindOptions,
    ) -> KeystoreResult<Vec<KeystoreRecord>>;

    /// Configs of every keystore under `meter_id`.
    async fn find_by_meter(&self, meter_id: &str) -> KeystoreResult<Vec<KeystoreConfig>>;

    /// Replace the config of `id` if, and only if, the stored record is at
    /// `expected_sequence` and uses `expected_kms_module`.
    ///
    /// Returns `Ok(false)` when nothing matched: unknown id, stale sequence,
    /// changed module, or a concurrent writer won the race.
    async fn compare_and_swap(
        &self,
        id: &str,
        expected_sequence: u64,
        expected_kms_module: &str,
        config: &KeystoreConfig,
    ) -> KeystoreResult<bool>;

    async fn explain(&self, target: ExplainTarget<'_>) -> KeystoreResult<QueryPlan>;
}
