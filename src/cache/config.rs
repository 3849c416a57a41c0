//! Cache backend selection.
//!
//! Resolved from the `[cache]` section of `featuretag.toml`.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_NAIVE_CAPACITY: usize = 1000;
const DEFAULT_REDIS_POOL_SIZE: usize = 8;
const DEFAULT_REDIS_TIMEOUT_MS: u64 = 2000;
const DEFAULT_REDIS_KEY_PREFIX: &str = "featuretag";

/// Which backend stores weak etags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Disabled,
    /// In-process map.
    Naive,
    /// Redis server shared between instances.
    Redis,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Naive => "naive",
            Self::Redis => "redis",
        }
    }
}

impl FromStr for CacheKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "disabled" | "none" => Ok(Self::Disabled),
            "naive" | "bounded" | "memory" => Ok(Self::Naive),
            "redis" | "external" => Ok(Self::Redis),
            other => Err(format!(
                "unsupported cache kind `{other}` (expected disabled, naive or redis)"
            )),
        }
    }
}

/// Connection settings for the external store.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub password: Option<String>,
    pub pool_size: usize,
    pub timeout: Duration,
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
            pool_size: DEFAULT_REDIS_POOL_SIZE,
            timeout: Duration::from_millis(DEFAULT_REDIS_TIMEOUT_MS),
            key_prefix: DEFAULT_REDIS_KEY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub kind: CacheKind,
    /// Initial capacity hint of the naive store. Not an eviction bound.
    pub naive_capacity: usize,
    /// Required when `kind` is `Redis`.
    pub redis: Option<RedisConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Disabled,
            naive_capacity: DEFAULT_NAIVE_CAPACITY,
            redis: None,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        let redis = settings.redis_url.as_ref().map(|url| RedisConfig {
            url: url.clone(),
            password: settings.redis_password.clone(),
            pool_size: settings.redis_pool_size.get(),
            timeout: settings.redis_timeout,
            key_prefix: settings.redis_key_prefix.clone(),
        });

        Self {
            kind: settings.kind,
            naive_capacity: settings.naive_capacity,
            redis,
        }
    }
}

impl CacheConfig {
    pub fn naive(capacity: usize) -> Self {
        Self {
            kind: CacheKind::Naive,
            naive_capacity: capacity,
            redis: None,
        }
    }

    pub fn redis(redis: RedisConfig) -> Self {
        Self {
            kind: CacheKind::Redis,
            redis: Some(redis),
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.kind != CacheKind::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disabled() {
        let config = CacheConfig::default();
        assert_eq!(config.kind, CacheKind::Disabled);
        assert!(!config.is_enabled());
        assert_eq!(config.naive_capacity, 1000);
    }

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("Naive".parse::<CacheKind>(), Ok(CacheKind::Naive));
        assert_eq!("bounded".parse::<CacheKind>(), Ok(CacheKind::Naive));
        assert_eq!("REDIS".parse::<CacheKind>(), Ok(CacheKind::Redis));
        assert_eq!("external".parse::<CacheKind>(), Ok(CacheKind::Redis));
        assert_eq!("".parse::<CacheKind>(), Ok(CacheKind::Disabled));
    }

    #[test]
    fn kind_rejects_unknown_backend() {
        let err = "memcached".parse::<CacheKind>().expect_err("unknown kind");
        assert!(err.contains("memcached"));
    }

    #[test]
    fn redis_config_defaults() {
        let redis = RedisConfig::new("redis://127.0.0.1:6379");
        assert_eq!(redis.pool_size, 8);
        assert_eq!(redis.timeout, Duration::from_secs(2));
        assert_eq!(redis.key_prefix, "featuretag");

        let config = CacheConfig::redis(redis);
        assert!(config.is_enabled());
        assert_eq!(config.kind, CacheKind::Redis);
    }
}
