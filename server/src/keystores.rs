use shared_types::{KeystoreConfig, KeystoreRecord, RecordMeta, StorageUsage};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::cache::ConfigCache;
use crate::error::{KeystoreError, KeystoreResult};
use crate::settings::KmsSettings;
use crate::storage::{ExplainTarget, FindOptions, KeystoreQuery, KeystoreStorage, QueryPlan};
use crate::usage::{UsageAggregator, UsageRequest};

/// Keystore configuration store: validation, persistence through a
/// [`KeystoreStorage`], a read-through cache and metered usage.
///
/// Built once at start-up and shared; all methods take `&self`.
pub struct KeystoreService {
    storage: Arc<dyn KeystoreStorage>,
    cache: ConfigCache,
    usage: UsageAggregator,
}

impl KeystoreService {
    pub fn new(storage: Arc<dyn KeystoreStorage>, settings: &KmsSettings) -> Self {
        Self {
            storage,
            cache: ConfigCache::new(&settings.cache),
            usage: UsageAggregator::new(settings.storage_cost, settings.usage_max_concurrency),
        }
    }

    /// Persist a new keystore config at sequence 0.
    #[instrument(skip(self, config), fields(id = %config.id))]
    pub async fn insert(&self, config: KeystoreConfig) -> KeystoreResult<KeystoreRecord> {
        validate_config(&config)?;
        if config.sequence != 0 {
            return Err(KeystoreError::Data(
                "Keystore config sequence must be \"0\".".to_string(),
            ));
        }

        let record = KeystoreRecord {
            meta: RecordMeta::now(),
            config,
        };
        self.storage.insert(&record).await?;
        info!("Inserted keystore config");
        Ok(record)
    }

    /// Records owned by `controller` that match `query`.
    #[instrument(skip(self, query, options))]
    pub async fn find(
        &self,
        controller: &str,
        query: &KeystoreQuery,
        options: &FindOptions,
    ) -> KeystoreResult<Vec<KeystoreRecord>> {
        validate_controller(controller)?;
        let records = self.storage.find(controller, query, options).await?;
        debug!("Found {} keystore configs", records.len());
        Ok(records)
    }

    pub async fn explain_find(
        &self,
        controller: &str,
        query: &KeystoreQuery,
    ) -> KeystoreResult<QueryPlan> {
        validate_controller(controller)?;
        self.storage
            .explain(ExplainTarget::Find { controller, query })
            .await
    }

    /// Replace the stored config with `config` if the stored one is at
    /// `config.sequence - 1` with the same `kmsModule`.
    ///
    /// The cache entry for the id is dropped only once the write is durable.
    #[instrument(skip(self, config), fields(id = %config.id, sequence = config.sequence))]
    pub async fn update(&self, config: &KeystoreConfig) -> KeystoreResult<bool> {
        validate_config(config)?;
        let expected_sequence = expected_sequence(config)?;

        let swapped = self
            .storage
            .compare_and_swap(
                &config.id,
                expected_sequence,
                &config.kms_module,
                config,
            )
            .await?;
        if !swapped {
            return Err(invalid_state(config));
        }

        self.cache.invalidate(&config.id).await;
        info!("Updated keystore config");
        Ok(true)
    }

    pub async fn explain_update(&self, config: &KeystoreConfig) -> KeystoreResult<QueryPlan> {
        validate_config(config)?;
        let expected_sequence = expected_sequence(config)?;
        self.storage
            .explain(ExplainTarget::CompareAndSwap {
                id: &config.id,
                expected_sequence,
                expected_kms_module: &config.kms_module,
            })
            .await
    }

    /// Cached read. `fresh` drops any cached entry first, including a fetch
    /// still in flight, so the result reflects the store as of this call.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str, fresh: bool) -> KeystoreResult<KeystoreRecord> {
        if fresh {
            self.cache.invalidate(id).await;
        }
        let storage = Arc::clone(&self.storage);
        let key = id.to_string();
        self.cache
            .get_or_fetch(id, async move { fetch_record(storage.as_ref(), &key).await })
            .await
    }

    pub async fn get_uncached_record(&self, id: &str) -> KeystoreResult<KeystoreRecord> {
        fetch_record(self.storage.as_ref(), id).await
    }

    pub async fn explain_get_uncached_record(&self, id: &str) -> KeystoreResult<QueryPlan> {
        self.storage.explain(ExplainTarget::Record { id }).await
    }

    /// Metered storage for every keystore under `request.meter_id`.
    #[instrument(skip_all, fields(meter_id = %request.meter_id))]
    pub async fn get_storage_usage(
        &self,
        request: UsageRequest<'_>,
    ) -> KeystoreResult<StorageUsage> {
        let configs = self.storage.find_by_meter(request.meter_id).await?;
        self.usage.run(configs, &request).await
    }

    pub async fn explain_storage_usage(&self, meter_id: &str) -> KeystoreResult<QueryPlan> {
        self.storage.explain(ExplainTarget::Meter { meter_id }).await
    }
}

async fn fetch_record(storage: &dyn KeystoreStorage, id: &str) -> KeystoreResult<KeystoreRecord> {
    storage
        .get(id)
        .await?
        .ok_or_else(|| KeystoreError::KeystoreNotFound {
            keystore_id: id.to_string(),
        })
}

fn expected_sequence(config: &KeystoreConfig) -> KeystoreResult<u64> {
    config
        .sequence
        .checked_sub(1)
        .ok_or_else(|| invalid_state(config))
}

fn invalid_state(config: &KeystoreConfig) -> KeystoreError {
    KeystoreError::InvalidState {
        id: config.id.clone(),
        sequence: config.sequence,
    }
}

fn require_non_empty(field: &str, value: &str) -> KeystoreResult<()> {
    if value.is_empty() {
        return Err(KeystoreError::Data(format!(
            "\"{field}\" must be a non-empty string."
        )));
    }
    Ok(())
}

fn validate_controller(controller: &str) -> KeystoreResult<()> {
    require_non_empty("controller", controller)
}

fn validate_config(config: &KeystoreConfig) -> KeystoreResult<()> {
    require_non_empty("config.id", &config.id)?;
    require_non_empty("config.controller", &config.controller)?;
    require_non_empty("config.kmsModule", &config.kms_module)?;
    if let Some(reference_id) = &config.reference_id {
        require_non_empty("config.referenceId", reference_id)?;
    }
    if let Some(meter_id) = &config.meter_id {
        require_non_empty("config.meterId", meter_id)?;
    }
    Ok(())
}
