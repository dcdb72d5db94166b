use anyhow::Result;
use keystore_server::http::{self, AppState};
use keystore_server::storage::{ObjectStoreBackend, StorageConfig};
use keystore_server::{
    CachingModuleManager, KeystoreService, KmsSettings, ModuleManager, ModuleRegistry,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    info!("Starting keystore server");

    let storage_config = StorageConfig::from_env()?;
    match &storage_config {
        StorageConfig::Memory => info!("Using in-memory storage; records are lost on shutdown"),
        StorageConfig::S3(s3) => info!(
            "Using S3 storage in bucket {} with {:?} conditional writes",
            s3.bucket, s3.conditional_writes
        ),
    }
    let storage = Arc::new(ObjectStoreBackend::from_config(storage_config)?);

    let settings = KmsSettings::from_env()?;
    info!(
        "Cache holds {} configs for {:?}; usage pool size {}",
        settings.cache.max_size, settings.cache.max_age, settings.usage_max_concurrency
    );

    let keystores = Arc::new(KeystoreService::new(storage, &settings));
    // KMS modules are linked in by the embedding deployment; none ship with
    // the standalone server.
    let modules: Arc<dyn ModuleManager> =
        Arc::new(CachingModuleManager::new(ModuleRegistry::new()));

    let addr = std::env::var("BIND_ADDRESS")
        .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
        .parse::<SocketAddr>()?;

    http::start_server(AppState::new(keystores, modules), addr).await?;

    Ok(())
}
