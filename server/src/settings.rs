use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_size: u64,
    pub max_age: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_age: Duration::from_secs(5 * 60),
        }
    }
}

/// Storage units charged per keystore and per key when computing usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCost {
    pub keystore: u64,
    pub key: u64,
}

impl Default for StorageCost {
    fn default() -> Self {
        Self { keystore: 1, key: 1 }
    }
}

/// Tunables of the keystore service, read once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsSettings {
    pub cache: CacheSettings,
    pub storage_cost: StorageCost,
    /// Upper bound on in-flight key-count and aggregate units per usage call.
    pub usage_max_concurrency: usize,
}

impl Default for KmsSettings {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            storage_cost: StorageCost::default(),
            usage_max_concurrency: 100,
        }
    }
}

impl KmsSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_age_ms = env_or("KMS_CACHE_MAX_AGE_MS", defaults.cache.max_age.as_millis() as u64)?;
        let usage_max_concurrency =
            env_or("KMS_USAGE_MAX_CONCURRENCY", defaults.usage_max_concurrency)?;
        if usage_max_concurrency == 0 {
            anyhow::bail!("KMS_USAGE_MAX_CONCURRENCY must be at least 1");
        }

        Ok(Self {
            cache: CacheSettings {
                max_size: env_or("KMS_CACHE_MAX_SIZE", defaults.cache.max_size)?,
                max_age: Duration::from_millis(max_age_ms),
            },
            storage_cost: StorageCost {
                keystore: env_or("KMS_STORAGE_COST_KEYSTORE", defaults.storage_cost.keystore)?,
                key: env_or("KMS_STORAGE_COST_KEY", defaults.storage_cost.key)?,
            },
            usage_max_concurrency,
        })
    }
}

pub(crate) fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Invalid value for {name}: {value:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = KmsSettings::default();
        assert_eq!(settings.cache.max_size, 1000);
        assert_eq!(settings.cache.max_age, Duration::from_millis(300_000));
        assert_eq!(settings.storage_cost, StorageCost { keystore: 1, key: 1 });
        assert_eq!(settings.usage_max_concurrency, 100);
    }

    #[test]
    fn test_env_or_parses_and_rejects() {
        std::env::set_var("KMS_TEST_ENV_OR_VALID", "42");
        std::env::set_var("KMS_TEST_ENV_OR_INVALID", "forty-two");

        assert_eq!(env_or("KMS_TEST_ENV_OR_VALID", 1u64).unwrap(), 42);
        assert_eq!(env_or("KMS_TEST_ENV_OR_UNSET", 7u64).unwrap(), 7);
        let err = env_or("KMS_TEST_ENV_OR_INVALID", 1u64).unwrap_err();
        assert!(err.to_string().contains("KMS_TEST_ENV_OR_INVALID"));
    }
}
