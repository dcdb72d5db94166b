//! Resolution of KMS module names to the capabilities the store relies on.
//!
//! The store only ever talks to [`ModuleManager`]. How a module is located and
//! instantiated is the job of a [`ModuleLoader`]; [`CachingModuleManager`]
//! puts a single-flight memo in front of any loader.

use anyhow::Result;
use async_trait::async_trait;
use shared_types::KeyCount;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::error::{KeystoreError, KeystoreResult};

/// Reports how many keys a KMS module holds for a keystore.
#[async_trait]
pub trait KeyCounter: Send + Sync {
    async fn get_key_count(&self, keystore_id: &str) -> Result<KeyCount>;
}

/// What a loaded KMS module exposes to the store.
#[derive(Clone, Default)]
pub struct ModuleCapabilities {
    pub key_counter: Option<Arc<dyn KeyCounter>>,
}

impl ModuleCapabilities {
    pub fn with_key_counter(key_counter: Arc<dyn KeyCounter>) -> Self {
        Self {
            key_counter: Some(key_counter),
        }
    }
}

impl fmt::Debug for ModuleCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCapabilities")
            .field("key_counter", &self.key_counter.is_some())
            .finish()
    }
}

#[async_trait]
pub trait ModuleManager: Send + Sync {
    async fn resolve(&self, kms_module: &str) -> KeystoreResult<ModuleCapabilities>;
}

#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, kms_module: &str) -> Result<ModuleCapabilities>;
}

/// Memoises a [`ModuleLoader`] per module id.
///
/// Concurrent first resolutions of the same module wait on one load. A load
/// that fails is not remembered; the next resolution tries again.
pub struct CachingModuleManager<L> {
    loader: L,
    modules: Mutex<HashMap<String, Arc<OnceCell<ModuleCapabilities>>>>,
}

impl<L: ModuleLoader> CachingModuleManager<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            modules: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, kms_module: &str) -> Arc<OnceCell<ModuleCapabilities>> {
        let mut modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        modules.entry(kms_module.to_string()).or_default().clone()
    }
}

#[async_trait]
impl<L: ModuleLoader> ModuleManager for CachingModuleManager<L> {
    #[instrument(skip(self))]
    async fn resolve(&self, kms_module: &str) -> KeystoreResult<ModuleCapabilities> {
        let cell = self.cell(kms_module);
        let capabilities = cell
            .get_or_try_init(|| async {
                debug!("Loading KMS module {}", kms_module);
                self.loader.load(kms_module).await
            })
            .await
            .map_err(|e| KeystoreError::module(kms_module, e))?;
        Ok(capabilities.clone())
    }
}

/// Loader over a fixed set of modules registered at start-up.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleCapabilities>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, kms_module: impl Into<String>, capabilities: ModuleCapabilities) -> Self {
        self.modules.insert(kms_module.into(), capabilities);
        self
    }
}

#[async_trait]
impl ModuleLoader for ModuleRegistry {
    async fn load(&self, kms_module: &str) -> Result<ModuleCapabilities> {
        self.modules
            .get(kms_module)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown KMS module \"{}\"", kms_module))
    }
}
