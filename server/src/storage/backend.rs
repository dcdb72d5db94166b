use anyhow::Result;
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use object_store::path::{Path, PathPart};
use object_store::{ObjectMeta, ObjectStore, PutMode, PutPayload, UpdateVersion};
use shared_types::{KeystoreConfig, KeystoreRecord};
use std::sync::Arc;
use tracing::{debug, warn};

use super::config::StorageConfig;
use super::indexes::{
    IndexDefinition, PlanStage, QueryPlan, CONTROLLER_INDEX, ID_INDEX, METER_INDEX,
    REFERENCE_INDEX,
};
use super::query::{ExplainTarget, FindOptions, KeystoreQuery};
use super::traits::KeystoreStorage;
use crate::error::{KeystoreError, KeystoreResult};

const INDEX_ROOT: &str = "indexes";

/// Indexes kept as marker objects next to the records.
const MARKED_INDEXES: [IndexDefinition; 2] = [CONTROLLER_INDEX, METER_INDEX];

/// Records fetched concurrently while resolving index entries.
const INDEX_FETCH_CONCURRENCY: usize = 16;

/// Keystore storage on top of an [`ObjectStore`].
///
/// Each record is one JSON object at `keystores/<id>`. Secondary indexes are
/// empty marker objects (`indexes/controller/<controller>/<id>`,
/// `indexes/meter/<meter>/<id>`) written before the record and written again
/// once it is committed. Reads check every marker against its record; a
/// marker whose record does not carry the value is deleted, then restored if
/// the record moved onto the value meanwhile.
///
/// Reference ids are claimed with create-if-absent objects at
/// `indexes/reference/<controller>/<referenceId>` holding the owner's id;
/// this is what enforces per-controller uniqueness. A claim is only released
/// once the owner's stored record is seen not to carry it.
///
/// Record writes use conditional puts, so the underlying store must support
/// [`PutMode::Create`] and [`PutMode::Update`].
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
}

struct StoredRecord {
    record: KeystoreRecord,
    version: UpdateVersion,
}

#[derive(Default)]
struct IndexScan {
    keys_examined: usize,
    docs_examined: usize,
    records: Vec<KeystoreRecord>,
}

impl ObjectStoreBackend {
    pub fn from_config(config: StorageConfig) -> Result<Self> {
        Ok(Self::new(config.open()?))
    }

    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn record_path(id: &str) -> Path {
        Path::from_iter([ID_INDEX.prefix, id])
    }

    fn index_prefix(index: &IndexDefinition, value: &str) -> Path {
        Path::from_iter([INDEX_ROOT, index.prefix, value])
    }

    fn index_entry(index: &IndexDefinition, value: &str, id: &str) -> Path {
        Path::from_iter([INDEX_ROOT, index.prefix, value, id])
    }

    fn reference_path(controller: &str, reference_id: &str) -> Path {
        Path::from_iter([INDEX_ROOT, REFERENCE_INDEX.prefix, controller, reference_id])
    }

    fn reference_key(config: &KeystoreConfig) -> Option<(&str, &str)> {
        config
            .reference_id
            .as_deref()
            .map(|reference_id| (config.controller.as_str(), reference_id))
    }

    fn cas_matches(
        config: &KeystoreConfig,
        expected_sequence: u64,
        expected_kms_module: &str,
    ) -> bool {
        config.sequence == expected_sequence && config.kms_module == expected_kms_module
    }

    async fn read_record(&self, path: &Path) -> KeystoreResult<Option<StoredRecord>> {
        match self.store.get(path).await {
            Ok(result) => {
                let version = UpdateVersion {
                    e_tag: result.meta.e_tag.clone(),
                    version: result.meta.version.clone(),
                };
                let bytes = result.bytes().await?;
                let record: KeystoreRecord = serde_json::from_slice(&bytes)?;
                Ok(Some(StoredRecord { record, version }))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_reference(&self, path: &Path) -> KeystoreResult<Option<String>> {
        match self.store.get(path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the stored record for `id` currently files `(controller,
    /// referenceId)`.
    async fn holds_reference(
        &self,
        id: &str,
        controller: &str,
        reference_id: &str,
    ) -> KeystoreResult<bool> {
        Ok(self
            .read_record(&Self::record_path(id))
            .await?
            .is_some_and(|stored| {
                Self::reference_key(&stored.record.config) == Some((controller, reference_id))
            }))
    }

    async fn create_claim(&self, path: &Path, id: &str) -> object_store::Result<bool> {
        let payload = PutPayload::from(id.as_bytes().to_vec());
        match self.store.put_opts(path, payload, PutMode::Create.into()).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Claim the config's `(controller, referenceId)` for its id. Succeeds if
    /// the claim is new or already held by this id.
    async fn claim_reference(&self, config: &KeystoreConfig) -> KeystoreResult<()> {
        let Some((controller, reference_id)) = Self::reference_key(config) else {
            return Ok(());
        };
        let path = Self::reference_path(controller, reference_id);

        // one retry covers a claim released between our create and our read
        for _ in 0..2 {
            if self.create_claim(&path, &config.id).await? {
                return Ok(());
            }
            match self.read_reference(&path).await? {
                Some(holder) if holder == config.id => return Ok(()),
                Some(_) => break,
                None => {}
            }
        }

        Err(KeystoreError::Duplicate {
            id: config.id.clone(),
            reference_id: Some(reference_id.to_string()),
        })
    }

    /// Recreate the claim for a committed record in case a concurrent release
    /// removed it before the commit landed.
    async fn reassert_reference(&self, config: &KeystoreConfig) {
        let Some((controller, reference_id)) = Self::reference_key(config) else {
            return;
        };
        let path = Self::reference_path(controller, reference_id);
        match self.create_claim(&path, &config.id).await {
            Ok(true) => debug!("Restored reference claim {}", path),
            Ok(false) => {}
            Err(e) => warn!("Failed to restore reference claim {}: {}", path, e),
        }
    }

    /// Drop the claim `id` holds on `(controller, referenceId)` if its stored
    /// record does not carry that reference.
    ///
    /// A claim held by another id is left alone. If the record takes the
    /// reference while the claim is being deleted, the claim is put back.
    async fn release_reference(&self, id: &str, controller: &str, reference_id: &str) {
        let path = Self::reference_path(controller, reference_id);
        let released: KeystoreResult<bool> = async {
            if self.read_reference(&path).await?.as_deref() != Some(id)
                || self.holds_reference(id, controller, reference_id).await?
            {
                return Ok(false);
            }
            match self.store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            if self.holds_reference(id, controller, reference_id).await? {
                self.create_claim(&path, id).await?;
                return Ok(false);
            }
            Ok(true)
        }
        .await;

        match released {
            Ok(true) => debug!("Released reference claim {}", path),
            Ok(false) => {}
            Err(e) => warn!("Failed to release reference claim {}: {}", path, e),
        }
    }

    /// Write the index markers for `config` that `previous` does not already
    /// have.
    async fn write_index_entries(
        &self,
        config: &KeystoreConfig,
        previous: Option<&KeystoreConfig>,
    ) -> KeystoreResult<()> {
        for index in &MARKED_INDEXES {
            let Some(value) = index.value_of(config) else {
                continue;
            };
            if previous.is_some_and(|p| index.value_of(p) == Some(value)) {
                continue;
            }
            let path = Self::index_entry(index, value, &config.id);
            self.store.put(&path, PutPayload::from(Vec::<u8>::new())).await?;
        }
        Ok(())
    }

    /// Delete a marker whose record no longer files under `value`, and put
    /// it back if the record moved onto `value` while it was deleted.
    async fn retire_index_entry(
        &self,
        index: &IndexDefinition,
        value: &str,
        entry: &Path,
        record: &Path,
    ) {
        let retired: KeystoreResult<bool> = async {
            match self.store.delete(entry).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            let held = self
                .read_record(record)
                .await?
                .is_some_and(|stored| index.value_of(&stored.record.config) == Some(value));
            if held {
                self.store.put(entry, PutPayload::from(Vec::<u8>::new())).await?;
            }
            Ok(!held)
        }
        .await;

        match retired {
            Ok(true) => debug!("Pruned stale {} entry {}", index.name, entry),
            Ok(false) => {}
            Err(e) => warn!("Failed to prune {} entry {}: {}", index.name, entry, e),
        }
    }

    /// Retire the markers `previous` had that `config` no longer has.
    async fn retire_moved_index_entries(
        &self,
        previous: &KeystoreConfig,
        config: &KeystoreConfig,
    ) {
        for index in &MARKED_INDEXES {
            let Some(old) = index.value_of(previous) else {
                continue;
            };
            if index.value_of(config) == Some(old) {
                continue;
            }
            let entry = Self::index_entry(index, old, &config.id);
            self.retire_index_entry(index, old, &entry, &Self::record_path(&config.id))
                .await;
        }
    }

    /// Write the index markers, then the record: create-if-absent when
    /// `previous` is `None`, otherwise conditional on the version read with
    /// `previous`. Markers are written again after the commit.
    ///
    /// Returns `Ok(false)` if a conditional update lost to a concurrent writer.
    async fn put_record(
        &self,
        record: &KeystoreRecord,
        previous: Option<(&KeystoreConfig, UpdateVersion)>,
    ) -> KeystoreResult<bool> {
        let config = &record.config;
        let previous_config = previous.as_ref().map(|(p, _)| *p);
        self.write_index_entries(config, previous_config).await?;

        let payload = PutPayload::from(serde_json::to_vec(record)?);
        let mode = match previous {
            Some((_, version)) => PutMode::Update(version),
            None => PutMode::Create,
        };
        match self
            .store
            .put_opts(&Self::record_path(&config.id), payload, mode.into())
            .await
        {
            Ok(_) => {}
            Err(object_store::Error::AlreadyExists { .. }) => {
                return Err(KeystoreError::Duplicate {
                    id: config.id.clone(),
                    reference_id: config.reference_id.clone(),
                })
            }
            Err(object_store::Error::Precondition { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.write_index_entries(config, previous_config).await {
            warn!("Failed to restore index entries for {}: {}", config.id, e);
        }
        Ok(true)
    }

    /// Load the records behind every marker under `index`/`value`, pruning
    /// markers whose record is gone or files elsewhere.
    async fn scan_index(
        &self,
        index: &IndexDefinition,
        value: &str,
        keep: impl Fn(&KeystoreConfig) -> bool,
    ) -> KeystoreResult<IndexScan> {
        let prefix = Self::index_prefix(index, value);
        let entries: Vec<ObjectMeta> = self.store.list(Some(&prefix)).try_collect().await?;
        let keys_examined = entries.len();

        let targets: Vec<(Path, Path)> = entries
            .into_iter()
            .filter_map(|meta| {
                let id = meta.location.parts().last()?;
                let record = Path::from_iter([PathPart::from(ID_INDEX.prefix), id]);
                Some((meta.location, record))
            })
            .collect();

        let loaded: Vec<(Path, Path, Option<StoredRecord>)> = stream::iter(targets)
            .map(|(entry, record)| async move {
                let stored = self.read_record(&record).await?;
                Ok::<_, KeystoreError>((entry, record, stored))
            })
            .buffered(INDEX_FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        let mut scan = IndexScan {
            keys_examined,
            ..IndexScan::default()
        };
        for (entry, record, stored) in loaded {
            match stored {
                Some(stored) => {
                    scan.docs_examined += 1;
                    if index.value_of(&stored.record.config) == Some(value) {
                        if keep(&stored.record.config) {
                            scan.records.push(stored.record);
                        }
                    } else {
                        self.retire_index_entry(index, value, &entry, &record).await;
                    }
                }
                None => self.retire_index_entry(index, value, &entry, &record).await,
            }
        }
        Ok(scan)
    }

    async fn scan_reference(
        &self,
        controller: &str,
        reference_id: &str,
        query: &KeystoreQuery,
    ) -> KeystoreResult<IndexScan> {
        let path = Self::reference_path(controller, reference_id);
        let Some(id) = self.read_reference(&path).await? else {
            return Ok(IndexScan::default());
        };

        let record = self.get(&id).await?;
        let docs_examined = usize::from(record.is_some());
        let records = record
            .filter(|record| {
                Self::reference_key(&record.config) == Some((controller, reference_id))
                    && query.matches(&record.config)
            })
            .into_iter()
            .collect();

        Ok(IndexScan {
            keys_examined: 1,
            docs_examined,
            records,
        })
    }

    async fn scan_controller(
        &self,
        controller: &str,
        query: &KeystoreQuery,
    ) -> KeystoreResult<(&'static IndexDefinition, IndexScan)> {
        if let Some(reference_id) = query.reference_id.as_deref() {
            let scan = self.scan_reference(controller, reference_id, query).await?;
            return Ok((&REFERENCE_INDEX, scan));
        }

        let scan = self
            .scan_index(&CONTROLLER_INDEX, controller, |config| query.matches(config))
            .await?;
        Ok((&CONTROLLER_INDEX, scan))
    }

    async fn scan_meter(&self, meter_id: &str) -> KeystoreResult<IndexScan> {
        self.scan_index(&METER_INDEX, meter_id, |_| true).await
    }
}

#[async_trait]
impl KeystoreStorage for ObjectStoreBackend {
    async fn insert(&self, record: &KeystoreRecord) -> KeystoreResult<()> {
        let config = &record.config;
        self.claim_reference(config).await?;

        match self.put_record(record, None).await {
            Ok(_) => {
                self.reassert_reference(config).await;
                debug!("Inserted keystore record {}", config.id);
                Ok(())
            }
            Err(e) => {
                if let Some((controller, reference_id)) = Self::reference_key(config) {
                    self.release_reference(&config.id, controller, reference_id)
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn get(&self, id: &str) -> KeystoreResult<Option<KeystoreRecord>> {
        Ok(self
            .read_record(&Self::record_path(id))
            .await?
            .map(|stored| stored.record))
    }

    async fn find(
        &self,
        controller: &str,
        query: &KeystoreQuery,
        options: &FindOptions,
    ) -> KeystoreResult<Vec<KeystoreRecord>> {
        let (_, scan) = self.scan_controller(controller, query).await?;
        Ok(options.apply(scan.records))
    }

    async fn find_by_meter(&self, meter_id: &str) -> KeystoreResult<Vec<KeystoreConfig>> {
        let scan = self.scan_meter(meter_id).await?;
        Ok(scan.records.into_iter().map(|record| record.config).collect())
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected_sequence: u64,
        expected_kms_module: &str,
        config: &KeystoreConfig,
    ) -> KeystoreResult<bool> {
        let Some(StoredRecord {
            record: current,
            version,
        }) = self.read_record(&Self::record_path(id)).await?
        else {
            return Ok(false);
        };
        if !Self::cas_matches(&current.config, expected_sequence, expected_kms_module) {
            return Ok(false);
        }

        let previous = &current.config;
        let reference_moved = Self::reference_key(previous) != Self::reference_key(config);
        if reference_moved {
            self.claim_reference(config).await?;
        }

        let record = KeystoreRecord {
            meta: current.meta.touched(),
            config: config.clone(),
        };

        let swapped = self.put_record(&record, Some((previous, version))).await;
        if let Ok(true) = swapped {
            if reference_moved {
                self.reassert_reference(config).await;
                if let Some((controller, reference_id)) = Self::reference_key(previous) {
                    self.release_reference(id, controller, reference_id).await;
                }
            }
            self.retire_moved_index_entries(previous, config).await;
            debug!("Swapped keystore record {} to sequence {}", id, config.sequence);
        } else if reference_moved {
            if let Some((controller, reference_id)) = Self::reference_key(config) {
                self.release_reference(id, controller, reference_id).await;
            }
        }
        swapped
    }

    async fn explain(&self, target: ExplainTarget<'_>) -> KeystoreResult<QueryPlan> {
        let plan = match target {
            ExplainTarget::Record { id } => {
                let found = usize::from(self.get(id).await?.is_some());
                QueryPlan {
                    stage: PlanStage::IdLookup,
                    index: ID_INDEX.name,
                    keys_examined: found,
                    docs_examined: found,
                    n_returned: found,
                }
            }
            ExplainTarget::CompareAndSwap {
                id,
                expected_sequence,
                expected_kms_module,
            } => {
                let record = self.get(id).await?;
                let examined = usize::from(record.is_some());
                let matched = usize::from(record.is_some_and(|record| {
                    Self::cas_matches(&record.config, expected_sequence, expected_kms_module)
                }));
                QueryPlan {
                    stage: PlanStage::IdLookup,
                    index: ID_INDEX.name,
                    keys_examined: examined,
                    docs_examined: examined,
                    n_returned: matched,
                }
            }
            ExplainTarget::Find { controller, query } => {
                let (index, scan) = self.scan_controller(controller, query).await?;
                QueryPlan {
                    stage: PlanStage::IndexScan,
                    index: index.name,
                    keys_examined: scan.keys_examined,
                    docs_examined: scan.docs_examined,
                    n_returned: scan.records.len(),
                }
            }
            ExplainTarget::Meter { meter_id } => {
                let scan = self.scan_meter(meter_id).await?;
                QueryPlan {
                    stage: PlanStage::IndexScan,
                    index: METER_INDEX.name,
                    keys_examined: scan.keys_examined,
                    docs_examined: scan.docs_examined,
                    n_returned: scan.records.len(),
                }
            }
        };
        Ok(plan)
    }
}
