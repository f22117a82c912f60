//! Startup configuration, read once from the environment.
//!
//! Follows the load-then-validate shape of
//! `mosaicfs-agent::config::AgentConfig::load`, except the source is
//! environment variables rather than a TOML file.

use std::path::PathBuf;
use std::time::Duration;

use crate::eviction::EvictionPolicy;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub directory: PathBuf,
    pub size_limit: u64,
    pub inline_threshold: u64,
    pub value_size_limit: u64,
    pub default_expire: Duration,
    pub cull_limit: u32,
    pub eviction_policy: EvictionPolicy,
    pub put_timeout: Duration,
    pub debug: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/tmp"),
            size_limit: 8 << 30,
            inline_threshold: 32 * 1024,
            value_size_limit: 300 << 20,
            default_expire: Duration::from_secs(86_400),
            cull_limit: 10,
            eviction_policy: EvictionPolicy::Lrs,
            put_timeout: Duration::from_secs(180),
            debug: false,
        }
    }
}

impl CacheConfig {
    /// Read `CACHE_DIRECTORY`, `CACHE_SIZE_LIMIT`, `VALUE_SIZE_LIMIT`,
    /// `DEFAULT_EXPIRE`, `EVICTION_POLICY`, `REQUEST_TIMEOUT` and `DEBUG`
    /// per spec.md §6, falling back to the defaults above, then validates.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let directory = std::env::var("CACHE_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or(defaults.directory);

        let size_limit = parse_env_u64("CACHE_SIZE_LIMIT", defaults.size_limit)?;
        let value_size_limit = parse_env_u64("VALUE_SIZE_LIMIT", defaults.value_size_limit)?;
        let default_expire_secs = parse_env_u64(
            "DEFAULT_EXPIRE",
            defaults.default_expire.as_secs(),
        )?;
        let put_timeout_secs = parse_env_u64("REQUEST_TIMEOUT", defaults.put_timeout.as_secs())?;

        let eviction_policy = match std::env::var("EVICTION_POLICY") {
            Ok(s) => s
                .parse()
                .map_err(|e: String| anyhow::anyhow!("invalid EVICTION_POLICY: {e}"))?,
            Err(_) => defaults.eviction_policy,
        };

        let debug = std::env::var("DEBUG")
            .map(|s| matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(defaults.debug);

        let config = Self {
            directory,
            size_limit,
            inline_threshold: defaults.inline_threshold,
            value_size_limit,
            default_expire: Duration::from_secs(default_expire_secs),
            cull_limit: defaults.cull_limit,
            eviction_policy,
            put_timeout: Duration::from_secs(put_timeout_secs),
            debug,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.size_limit == 0 {
            anyhow::bail!("CACHE_SIZE_LIMIT must not be zero");
        }
        if self.value_size_limit == 0 {
            anyhow::bail!("VALUE_SIZE_LIMIT must not be zero");
        }
        if self.value_size_limit > self.size_limit {
            anyhow::bail!("VALUE_SIZE_LIMIT must not exceed CACHE_SIZE_LIMIT");
        }
        if self.cull_limit == 0 {
            anyhow::bail!("cull_limit must not be zero");
        }
        Ok(())
    }
}

fn parse_env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(s) => s
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("invalid {name}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CacheConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_value_limit_above_size_limit() {
        let mut config = CacheConfig::default();
        config.value_size_limit = config.size_limit + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_size_limit() {
        let mut config = CacheConfig::default();
        config.size_limit = 0;
        assert!(config.validate().is_err());
    }
}
