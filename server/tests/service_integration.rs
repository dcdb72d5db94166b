#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use anyhow::Result;
use async_trait::async_trait;
use keystore_server::storage::{
    ExplainTarget, FindOptions, KeystoreQuery, KeystoreStorage, ObjectStoreBackend, QueryPlan,
    StorageConfig,
};
use keystore_server::{
    AggregateHook, CachingModuleManager, ErrorKind, KeyCounter, KeystoreError, KeystoreResult,
    KeystoreService, KmsSettings, ModuleCapabilities, ModuleRegistry, UsageCounter, UsageRequest,
};
use shared_types::{KeyCount, KeystoreConfig, KeystoreRecord};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Storage that counts point lookups and holds each result back for a while
/// after reading it.
struct CountingStorage {
    inner: ObjectStoreBackend,
    gets: AtomicUsize,
}

#[async_trait]
impl KeystoreStorage for CountingStorage {
    async fn insert(&self, record: &KeystoreRecord) -> KeystoreResult<()> {
        self.inner.insert(record).await
    }

    async fn get(&self, id: &str) -> KeystoreResult<Option<KeystoreRecord>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.inner.get(id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        snapshot
    }

    async fn find(
        &self,
        controller: &str,
        query: &KeystoreQuery,
        options: &FindOptions,
    ) -> KeystoreResult<Vec<KeystoreRecord>> {
        self.inner.find(controller, query, options).await
    }

    async fn find_by_meter(&self, meter_id: &str) -> KeystoreResult<Vec<KeystoreConfig>> {
        self.inner.find_by_meter(meter_id).await
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected_sequence: u64,
        expected_kms_module: &str,
        config: &KeystoreConfig,
    ) -> KeystoreResult<bool> {
        self.inner
            .compare_and_swap(id, expected_sequence, expected_kms_module, config)
            .await
    }

    async fn explain(&self, target: ExplainTarget<'_>) -> KeystoreResult<QueryPlan> {
        self.inner.explain(target).await
    }
}

struct OneKey;

struct NoKeys;

#[async_trait]
impl KeyCounter for NoKeys {
    async fn get_key_count(&self, _keystore_id: &str) -> Result<KeyCount> {
        Ok(KeyCount { count: 0 })
    }
}

/// Adds a fixed amount for every keystore.
struct FlatFee(u64);

#[async_trait]
impl AggregateHook for FlatFee {
    async fn aggregate(
        &self,
        _meter_id: &str,
        _config: &KeystoreConfig,
        usage: &UsageCounter,
    ) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        usage.add(self.0);
        Ok(())
    }
}

#[async_trait]
impl KeyCounter for OneKey {
    async fn get_key_count(&self, _keystore_id: &str) -> Result<KeyCount> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(KeyCount { count: 1 })
    }
}

/// Records the meter and config of every call.
#[derive(Default)]
struct RecordingHook {
    seen: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl AggregateHook for RecordingHook {
    async fn aggregate(
        &self,
        meter_id: &str,
        config: &KeystoreConfig,
        usage: &UsageCounter,
    ) -> Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((meter_id.to_string(), config.id.clone()));
        usage.add(100);
        Ok(())
    }
}

fn storage() -> Arc<ObjectStoreBackend> {
    Arc::new(ObjectStoreBackend::from_config(StorageConfig::memory()).unwrap())
}

fn modules() -> CachingModuleManager<ModuleRegistry> {
    CachingModuleManager::new(
        ModuleRegistry::new()
            .with_module("ssm-v1", ModuleCapabilities::with_key_counter(Arc::new(OneKey)))
            .with_module("empty-v1", ModuleCapabilities::with_key_counter(Arc::new(NoKeys)))
            .with_module("bare-v1", ModuleCapabilities::default()),
    )
}

fn settings_with_pool(usage_max_concurrency: usize) -> KmsSettings {
    KmsSettings {
        usage_max_concurrency,
        ..KmsSettings::default()
    }
}

fn keystore(n: usize) -> KeystoreConfig {
    KeystoreConfig::new(
        format!("https://example.com/keystores/{n}"),
        "alice",
        "ssm-v1",
    )
}

#[tokio::test]
async fn test_racing_updates_have_one_winner() -> Result<()> {
    let service = Arc::new(KeystoreService::new(storage(), &KmsSettings::default()));
    let original = service.insert(keystore(1)).await?.config;

    let attempts = (0..8).map(|i| {
        let service = service.clone();
        let next = original.next().with_meter_id(format!("meter-{i}"));
        tokio::spawn(async move { service.update(&next).await })
    });

    let mut winners = 0;
    for attempt in futures::future::join_all(attempts).await {
        match attempt? {
            Ok(true) => winners += 1,
            Ok(false) => panic!("update reports failure through errors"),
            Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidState),
        }
    }
    assert_eq!(winners, 1);

    let current = service.get(&original.id, true).await?;
    assert_eq!(current.config.sequence, 1);
    Ok(())
}

#[tokio::test]
async fn test_kms_module_cannot_change() -> Result<()> {
    let service = KeystoreService::new(storage(), &KmsSettings::default());
    let original = service.insert(keystore(1)).await?.config;

    let mut next = original.next();
    next.kms_module = "other-v1".to_string();
    let err = service.update(&next).await.unwrap_err();
    assert!(matches!(err, KeystoreError::InvalidState { sequence: 1, .. }));
    Ok(())
}

#[tokio::test]
async fn test_update_onto_taken_reference_id_is_duplicate() -> Result<()> {
    let service = KeystoreService::new(storage(), &KmsSettings::default());
    service
        .insert(keystore(1).with_reference_id("primary"))
        .await?;
    let other = service.insert(keystore(2)).await?.config;

    let err = service
        .update(&other.next().with_reference_id("primary"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Duplicate);
    Ok(())
}

#[tokio::test]
async fn test_stale_read_until_fresh() -> Result<()> {
    let backend = storage();
    let service = KeystoreService::new(backend.clone(), &KmsSettings::default());
    let original = service.insert(keystore(1)).await?.config;
    service.get(&original.id, false).await?;

    // another instance updates the store behind this cache
    let next = original.next().with_meter_id("meter-1");
    assert!(backend.compare_and_swap(&next.id, 0, "ssm-v1", &next).await?);

    let cached = service.get(&original.id, false).await?;
    assert_eq!(cached.config, original);

    let fresh = service.get(&original.id, true).await?;
    assert_eq!(fresh.config, next);

    let cached = service.get(&original.id, false).await?;
    assert_eq!(cached.config, next);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_gets_share_one_fetch() -> Result<()> {
    let storage = Arc::new(CountingStorage {
        inner: ObjectStoreBackend::from_config(StorageConfig::memory())?,
        gets: AtomicUsize::new(0),
    });
    let service = Arc::new(KeystoreService::new(
        storage.clone(),
        &KmsSettings::default(),
    ));
    let id = service.insert(keystore(1)).await?.config.id;

    let reads = (0..10).map(|_| {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.get(&id, false).await })
    });
    for read in futures::future::join_all(reads).await {
        assert_eq!(read??.config.id, id);
    }
    assert_eq!(storage.gets.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_read_racing_local_update_is_not_cached() -> Result<()> {
    let storage = Arc::new(CountingStorage {
        inner: ObjectStoreBackend::from_config(StorageConfig::memory())?,
        gets: AtomicUsize::new(0),
    });
    let service = Arc::new(KeystoreService::new(
        storage.clone(),
        &KmsSettings::default(),
    ));
    let original = service.insert(keystore(1)).await?.config;

    // this read snapshots sequence 0 and is still in flight when the update lands
    let reader = {
        let service = service.clone();
        let id = original.id.clone();
        tokio::spawn(async move { service.get(&id, false).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let next = original.next().with_meter_id("meter-1");
    assert!(service.update(&next).await?);

    let fresh = service.get(&original.id, true).await?;
    assert_eq!(fresh.config.sequence, 1);

    assert_eq!(reader.await??.config.sequence, 0);
    let cached = service.get(&original.id, false).await?;
    assert_eq!(cached.config, next);
    Ok(())
}

#[tokio::test]
async fn test_racing_updates_onto_one_reference_id() -> Result<()> {
    let service = Arc::new(KeystoreService::new(storage(), &KmsSettings::default()));
    let first = service.insert(keystore(1)).await?.config;
    let second = service.insert(keystore(2)).await?.config;

    let attempts = [first, second].map(|config| {
        let service = service.clone();
        let next = config.next().with_reference_id("primary");
        tokio::spawn(async move { service.update(&next).await })
    });

    let mut winners = 0;
    for attempt in futures::future::join_all(attempts).await {
        match attempt? {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Duplicate),
        }
    }
    assert_eq!(winners, 1);

    let holders = service
        .find(
            "alice",
            &KeystoreQuery::by_reference_id("primary"),
            &FindOptions::default(),
        )
        .await?;
    assert_eq!(holders.len(), 1);
    let all = service
        .find("alice", &KeystoreQuery::default(), &FindOptions::default())
        .await?;
    let claimed = all
        .iter()
        .filter(|r| r.config.reference_id.as_deref() == Some("primary"))
        .count();
    assert_eq!(claimed, 1);
    Ok(())
}

#[tokio::test]
async fn test_get_unknown_id_is_not_found() {
    let service = KeystoreService::new(storage(), &KmsSettings::default());

    let err = service.get("https://example.com/missing", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = service
        .get_uncached_record("https://example.com/missing")
        .await
        .unwrap_err();
    assert!(matches!(err, KeystoreError::KeystoreNotFound { .. }));
}

#[tokio::test]
async fn test_storage_usage_accounting() -> Result<()> {
    let modules = modules();
    let service = KeystoreService::new(storage(), &settings_with_pool(10));

    service.insert(keystore(0).with_meter_id("meter-1")).await?;
    let usage = service
        .get_storage_usage(UsageRequest::new("meter-1", &modules))
        .await?;
    assert_eq!(usage.storage, 2);

    for n in 1..51 {
        service.insert(keystore(n).with_meter_id("meter-1")).await?;
    }
    let usage = service
        .get_storage_usage(UsageRequest::new("meter-1", &modules))
        .await?;
    assert_eq!(usage.storage, 102);

    let usage = service
        .get_storage_usage(UsageRequest::new("meter-unknown", &modules))
        .await?;
    assert_eq!(usage.storage, 0);
    Ok(())
}

#[tokio::test]
async fn test_storage_usage_of_keystore_without_keys() -> Result<()> {
    let modules = modules();
    let service = KeystoreService::new(storage(), &KmsSettings::default());
    service
        .insert(
            KeystoreConfig::new("https://example.com/keystores/empty", "alice", "empty-v1")
                .with_meter_id("meter-1"),
        )
        .await?;

    let usage = service
        .get_storage_usage(UsageRequest::new("meter-1", &modules))
        .await?;
    assert_eq!(usage.storage, 1);
    Ok(())
}

#[tokio::test]
async fn test_storage_usage_with_hook_over_default_pool() -> Result<()> {
    let modules = modules();
    let service = KeystoreService::new(storage(), &KmsSettings::default());
    for n in 0..51 {
        let config = KeystoreConfig::new(
            format!("https://example.com/keystores/{n}"),
            "alice",
            "empty-v1",
        );
        service.insert(config.with_meter_id("meter-1")).await?;
    }

    // 51 hook units plus 51 key-count units exceed the pool of 100
    let request = UsageRequest::new("meter-1", &modules).with_aggregate(Arc::new(FlatFee(1)));
    let usage = service.get_storage_usage(request).await?;
    assert_eq!(usage.storage, 102);
    Ok(())
}

#[tokio::test]
async fn test_storage_usage_with_aggregate_hook() -> Result<()> {
    let modules = modules();
    let service = KeystoreService::new(storage(), &KmsSettings::default());
    service.insert(keystore(1).with_meter_id("meter-1")).await?;
    service.insert(keystore(2).with_meter_id("meter-2")).await?;

    let hook = Arc::new(RecordingHook::default());
    let usage = service
        .get_storage_usage(UsageRequest::new("meter-1", &modules).with_aggregate(hook.clone()))
        .await?;

    assert_eq!(usage.storage, 1 + 1 + 100);
    let seen = hook.seen.lock().unwrap();
    assert_eq!(
        *seen,
        [("meter-1".to_string(), keystore(1).id)]
    );
    Ok(())
}

#[tokio::test]
async fn test_storage_usage_cancelled_before_start() -> Result<()> {
    let modules = modules();
    let service = KeystoreService::new(storage(), &KmsSettings::default());
    service.insert(keystore(1).with_meter_id("meter-1")).await?;

    let signal = CancellationToken::new();
    signal.cancel();
    let err = service
        .get_storage_usage(UsageRequest::new("meter-1", &modules).with_signal(&signal))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Abort);
    assert!(matches!(err, KeystoreError::Aborted { ref meter_id } if meter_id == "meter-1"));
    Ok(())
}

#[tokio::test]
async fn test_storage_usage_needs_key_count() -> Result<()> {
    let modules = modules();
    let service = KeystoreService::new(storage(), &KmsSettings::default());
    service
        .insert(
            KeystoreConfig::new("https://example.com/keystores/bare", "alice", "bare-v1")
                .with_meter_id("meter-1"),
        )
        .await?;

    let err = service
        .get_storage_usage(UsageRequest::new("meter-1", &modules))
        .await
        .unwrap_err();
    assert!(matches!(err, KeystoreError::KeyCountUnsupported { ref kms_module } if kms_module == "bare-v1"));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn test_explain_plans() -> Result<()> {
    let service = KeystoreService::new(storage(), &KmsSettings::default());
    let first = service
        .insert(keystore(1).with_meter_id("meter-1"))
        .await?
        .config;
    service.insert(keystore(2).with_meter_id("meter-1")).await?;

    let plan = service
        .explain_find("alice", &KeystoreQuery::default())
        .await?;
    assert!(plan.is_index_covered());
    assert_eq!((plan.keys_examined, plan.n_returned), (2, 2));

    let plan = service.explain_get_uncached_record(&first.id).await?;
    assert_eq!((plan.keys_examined, plan.docs_examined, plan.n_returned), (1, 1, 1));

    let plan = service.explain_update(&first.next()).await?;
    assert_eq!(plan.n_returned, 1);

    let plan = service.explain_storage_usage("meter-1").await?;
    assert!(plan.is_index_covered());
    assert_eq!(plan.n_returned, 2);
    Ok(())
}
