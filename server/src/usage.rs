//! Metered storage accounting.
//!
//! Every keystore under a meter costs a fixed amount, plus a per-key amount
//! for each key its KMS module reports. Key counts and the optional aggregate
//! hook run as units on a bounded task pool.

use anyhow::Result;
use async_trait::async_trait;
use shared_types::{KeystoreConfig, StorageUsage};
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{KeystoreError, KeystoreResult};
use crate::modules::{KeyCounter, ModuleManager};
use crate::settings::StorageCost;

/// Running usage total shared by the units of one computation.
#[derive(Debug, Clone, Default)]
pub struct UsageCounter(Arc<AtomicU64>);

impl UsageCounter {
    pub fn add(&self, storage: u64) {
        self.0.fetch_add(storage, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caller-supplied extra accounting, run once per keystore under the meter.
#[async_trait]
pub trait AggregateHook: Send + Sync {
    async fn aggregate(
        &self,
        meter_id: &str,
        config: &KeystoreConfig,
        usage: &UsageCounter,
    ) -> Result<()>;
}

pub struct UsageRequest<'a> {
    pub meter_id: &'a str,
    pub module_manager: &'a dyn ModuleManager,
    /// Polled before each keystore, before each unit is scheduled and when
    /// each unit starts. Work already running is never interrupted.
    pub signal: Option<&'a CancellationToken>,
    pub aggregate: Option<Arc<dyn AggregateHook>>,
}

impl<'a> UsageRequest<'a> {
    pub fn new(meter_id: &'a str, module_manager: &'a dyn ModuleManager) -> Self {
        Self {
            meter_id,
            module_manager,
            signal: None,
            aggregate: None,
        }
    }

    pub fn with_signal(mut self, signal: &'a CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_aggregate(mut self, aggregate: Arc<dyn AggregateHook>) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    fn aborted(&self) -> bool {
        self.signal.is_some_and(CancellationToken::is_cancelled)
    }
}

pub(crate) struct UsageAggregator {
    cost: StorageCost,
    max_concurrency: usize,
}

/// Bookkeeping for one computation: the pool, its permits and the first
/// error seen.
struct UnitPool {
    units: JoinSet<KeystoreResult<()>>,
    permits: Arc<Semaphore>,
    failure: Option<KeystoreError>,
}

impl UnitPool {
    fn new(max_concurrency: usize) -> Self {
        Self {
            units: JoinSet::new(),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            failure: None,
        }
    }

    fn fail(&mut self, err: KeystoreError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        } else {
            debug!("Discarding subsequent usage error: {}", err);
        }
    }

    fn settle(&mut self, result: Result<KeystoreResult<()>, JoinError>) {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(e),
            Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
            Err(e) => warn!("Usage unit did not complete: {}", e),
        }
    }

    /// Collect units that have already finished without waiting.
    fn drain_finished(&mut self) {
        while let Some(result) = self.units.try_join_next() {
            self.settle(result);
        }
    }

    async fn permit(&mut self, meter_id: &str) -> KeystoreResult<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| KeystoreError::aggregate(meter_id, e.into()))
    }

    async fn settle_all(&mut self) {
        while let Some(result) = self.units.join_next().await {
            self.settle(result);
        }
    }
}

impl UsageAggregator {
    pub(crate) fn new(cost: StorageCost, max_concurrency: usize) -> Self {
        Self {
            cost,
            max_concurrency,
        }
    }

    #[instrument(skip_all, fields(meter_id = %request.meter_id, keystores = configs.len()))]
    pub(crate) async fn run(
        &self,
        configs: Vec<KeystoreConfig>,
        request: &UsageRequest<'_>,
    ) -> KeystoreResult<StorageUsage> {
        let usage = UsageCounter::default();
        let mut pool = UnitPool::new(self.max_concurrency);

        if let Err(e) = self.schedule(configs, request, &usage, &mut pool).await {
            pool.fail(e);
        }
        pool.settle_all().await;

        if let Some(err) = pool.failure {
            warn!("Storage usage computation failed: {}", err);
            return Err(err);
        }
        if request.aborted() {
            return Err(aborted(request.meter_id));
        }

        let storage = usage.get();
        debug!("Computed storage usage {}", storage);
        Ok(StorageUsage { storage })
    }

    /// Walk the configs and hand units to the pool. Stops at the first
    /// error, whether raised here or by an already finished unit.
    async fn schedule(
        &self,
        configs: Vec<KeystoreConfig>,
        request: &UsageRequest<'_>,
        usage: &UsageCounter,
        pool: &mut UnitPool,
    ) -> KeystoreResult<()> {
        let meter_id = request.meter_id;

        for config in configs {
            pool.drain_finished();
            if pool.failure.is_some() {
                return Ok(());
            }
            if request.aborted() {
                return Err(aborted(meter_id));
            }

            usage.add(self.cost.keystore);

            if let Some(hook) = &request.aggregate {
                let permit = pool.permit(meter_id).await?;
                if request.aborted() {
                    return Err(aborted(meter_id));
                }
                pool.units.spawn(aggregate_unit(
                    hook.clone(),
                    meter_id.to_string(),
                    config.clone(),
                    usage.clone(),
                    request.signal.cloned(),
                    permit,
                ));
            }

            let capabilities = request.module_manager.resolve(&config.kms_module).await?;
            let Some(counter) = capabilities.key_counter else {
                return Err(KeystoreError::KeyCountUnsupported {
                    kms_module: config.kms_module,
                });
            };

            let permit = pool.permit(meter_id).await?;
            if request.aborted() {
                return Err(aborted(meter_id));
            }
            pool.units.spawn(key_count_unit(
                counter,
                meter_id.to_string(),
                config,
                self.cost.key,
                usage.clone(),
                request.signal.cloned(),
                permit,
            ));
        }
        Ok(())
    }
}

fn aborted(meter_id: &str) -> KeystoreError {
    KeystoreError::Aborted {
        meter_id: meter_id.to_string(),
    }
}

async fn aggregate_unit(
    hook: Arc<dyn AggregateHook>,
    meter_id: String,
    config: KeystoreConfig,
    usage: UsageCounter,
    signal: Option<CancellationToken>,
    _permit: OwnedSemaphorePermit,
) -> KeystoreResult<()> {
    if signal.is_some_and(|s| s.is_cancelled()) {
        return Err(aborted(&meter_id));
    }
    hook.aggregate(&meter_id, &config, &usage)
        .await
        .map_err(|e| KeystoreError::aggregate(&meter_id, e))
}

async fn key_count_unit(
    counter: Arc<dyn KeyCounter>,
    meter_id: String,
    config: KeystoreConfig,
    cost_per_key: u64,
    usage: UsageCounter,
    signal: Option<CancellationToken>,
    _permit: OwnedSemaphorePermit,
) -> KeystoreResult<()> {
    if signal.is_some_and(|s| s.is_cancelled()) {
        return Err(aborted(&meter_id));
    }
    let key_count = counter
        .get_key_count(&config.id)
        .await
        .map_err(|e| KeystoreError::module(&config.kms_module, e))?;
    usage.add(key_count.count.saturating_mul(cost_per_key));
    Ok(())
}
