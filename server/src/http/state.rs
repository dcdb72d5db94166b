use crate::keystores::KeystoreService;
use crate::modules::ModuleManager;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub keystores: Arc<KeystoreService>,
    /// Resolves KMS modules when computing storage usage.
    pub modules: Arc<dyn ModuleManager>,
}

impl AppState {
    pub fn new(keystores: Arc<KeystoreService>, modules: Arc<dyn ModuleManager>) -> Self {
        Self { keystores, modules }
    }
}
