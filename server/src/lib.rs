//! Keystore configuration store.
//!
//! Persists keystore configs in an object store with compare-and-swap
//! updates, serves reads through a bounded cache and computes metered
//! storage usage across KMS modules.

pub mod cache;
pub mod error;
pub mod http;
pub mod keystores;
pub mod modules;
pub mod settings;
pub mod storage;
pub mod usage;

pub use error::{ErrorKind, KeystoreError, KeystoreResult};
pub use keystores::KeystoreService;
pub use modules::{
    CachingModuleManager, KeyCounter, ModuleCapabilities, ModuleLoader, ModuleManager,
    ModuleRegistry,
};
pub use settings::{CacheSettings, KmsSettings, StorageCost};
pub use usage::{AggregateHook, UsageCounter, UsageRequest};
