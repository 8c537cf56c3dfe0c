//! Environment-driven configuration.

use std::sync::Arc;

use agentpay_store::{MemoryStore, RedisStore, Store};

use crate::error::Error;

/// Which storage backend to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local, non-persistent.
    #[default]
    Memory,
    /// Shared Redis server.
    Redis,
}

/// Deployment environment tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnv {
    /// Local development.
    #[default]
    Development,
    /// Production.
    Production,
}

/// Engine configuration, read from `AGENTPAY_`-prefixed environment
/// variables. Everything is optional; the defaults run on the in-memory
/// backend.
///
/// * `AGENTPAY_STORE` — `memory` (default) or `redis`.
/// * `AGENTPAY_REDIS_URL` — connection string, required for `redis`.
/// * `AGENTPAY_ENV` — `development` (default) or `production`.
///
/// Log filtering rides the standard `RUST_LOG` env-filter and is the
/// embedder's tracing-subscriber configuration, not ours.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct EngineConfig {
    /// Storage backend selector.
    #[serde(default)]
    pub store: StoreBackend,
    /// Redis connection string.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Deployment environment tag.
    #[serde(default)]
    pub env: RuntimeEnv,
}

impl EngineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        let raw = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENTPAY"))
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        raw.try_deserialize().map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Construct the configured storage backend.
    pub async fn build_store(&self) -> Result<Arc<dyn Store>, Error> {
        match self.store {
            StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreBackend::Redis => {
                let url = self.redis_url.as_deref().ok_or_else(|| {
                    Error::Configuration(
                        "AGENTPAY_REDIS_URL is required for the redis backend".to_owned(),
                    )
                })?;
                Ok(Arc::new(RedisStore::connect(url).await?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_memory_development() {
        let config = EngineConfig::default();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.env, RuntimeEnv::Development);
    }

    #[test]
    fn from_env_reads_prefixed_variables() -> Result<(), Box<dyn std::error::Error>> {
        // SAFETY: no other test in this crate touches these variables.
        unsafe {
            std::env::set_var("AGENTPAY_STORE", "redis");
            std::env::set_var("AGENTPAY_REDIS_URL", "redis://127.0.0.1:6379");
            std::env::set_var("AGENTPAY_ENV", "production");
        }
        let config = EngineConfig::from_env()?;
        // SAFETY: same variables, same single owner.
        unsafe {
            std::env::remove_var("AGENTPAY_STORE");
            std::env::remove_var("AGENTPAY_REDIS_URL");
            std::env::remove_var("AGENTPAY_ENV");
        }
        assert_eq!(config.store, StoreBackend::Redis);
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.env, RuntimeEnv::Production);
        Ok(())
    }

    #[tokio::test]
    async fn redis_backend_requires_a_url() {
        let config = EngineConfig {
            store: StoreBackend::Redis,
            redis_url: None,
            env: RuntimeEnv::Development,
        };
        let err = config.build_store().await.err();
        assert!(matches!(err, Some(Error::Configuration(_))));
    }

    #[test]
    fn backend_names_deserialize() -> Result<(), Box<dyn std::error::Error>> {
        let backend: StoreBackend = serde_json::from_str("\"redis\"")?;
        assert_eq!(backend, StoreBackend::Redis);
        let env: RuntimeEnv = serde_json::from_str("\"production\"")?;
        assert_eq!(env, RuntimeEnv::Production);
        Ok(())
    }
}
