//! Read-through cache of keystore records.
//!
//! Keyed by keystore id and bounded both by entry count (least recently used
//! entries go first) and by entry age. The cached value is the fetch itself,
//! shared between callers: concurrent misses for the same id join one fetch,
//! and invalidating an id drops a fetch still in flight so that the next read
//! starts over. Failed fetches are not cached.
//!
//! The cache is advisory. It is local to this process and only invalidated by
//! writes made through this process, so other instances may serve a stale
//! record for up to the configured max age.

use futures::future::{BoxFuture, FutureExt, Shared};
use moka::future::Cache;
use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;
use shared_types::KeystoreRecord;
use std::future::{self, Future};
use tracing::trace;

use crate::error::KeystoreResult;
use crate::settings::CacheSettings;

type PendingRecord = Shared<BoxFuture<'static, KeystoreResult<KeystoreRecord>>>;

#[derive(Clone)]
pub struct ConfigCache {
    cache: Cache<String, PendingRecord>,
}

impl ConfigCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let cache = Cache::builder()
            .max_capacity(settings.max_size)
            .time_to_live(settings.max_age)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self { cache }
    }

    /// Return the cached record for `id`, or run `fetch` to load it.
    ///
    /// If a fetch for `id` is already in flight, this waits for that fetch
    /// instead of starting another one, and receives its result or error.
    pub async fn get_or_fetch<F>(&self, id: &str, fetch: F) -> KeystoreResult<KeystoreRecord>
    where
        F: Future<Output = KeystoreResult<KeystoreRecord>> + Send + 'static,
    {
        let pending = self
            .cache
            .get_with_by_ref(id, async move { fetch.boxed().shared() })
            .await;

        let result = pending.clone().await;
        if result.is_err() {
            self.forget(id, &pending).await;
        }
        result
    }

    /// Drop `pending` unless the entry was replaced in the meantime.
    async fn forget(&self, id: &str, pending: &PendingRecord) {
        self.cache
            .entry_by_ref(id)
            .and_compute_with(|entry| {
                let op = match entry {
                    Some(entry) if entry.value().ptr_eq(pending) => Op::Remove,
                    _ => Op::Nop,
                };
                future::ready(op)
            })
            .await;
    }

    /// Drop the entry for `id`, including a fetch still in flight. Callers
    /// already waiting on that fetch still receive its result.
    pub async fn invalidate(&self, id: &str) {
        trace!("Invalidating cached keystore config {}", id);
        self.cache.invalidate(id).await;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cache.contains_key(id)
    }
}
