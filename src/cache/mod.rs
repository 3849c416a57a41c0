//! Weak etag cache.
//!
//! One closed set of backends behind a single async contract, used by both the
//! request path (cache-fill on read, `If-None-Match` checks) and the change
//! listener (invalidate on delete/update, enrich on insert/update).
//!
//! ```toml
//! [cache]
//! kind = "naive"          # disabled | naive | redis
//! naive_capacity = 1000
//! # redis_url = "redis://127.0.0.1:6379"
//! ```

mod config;
mod external;
mod lock;
mod store;

use deadpool_redis::PoolError;
use metrics::counter;
use thiserror::Error;
use tracing::error;

use crate::domain::etag::{EtagError, StrongEtag, WeakEtag};

pub use config::{CacheConfig, CacheKind, RedisConfig};
pub use external::ExternalStore;
pub use store::BoundedStore;

const METRIC_CONTAINS: &str = "featuretag_cache_contains_total";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Malformed(#[from] EtagError),
    #[error("etag cache unavailable: {message}")]
    Unavailable { message: String },
    #[error("redis command failed: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("redis connection pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to encode cached etag: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache kind `redis` requires `cache.redis_url`")]
    MissingRedisConfig,
}

impl CacheError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Whether the caller sent a bad etag, as opposed to a backend failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

pub enum EtagCache {
    Disabled,
    Bounded(BoundedStore),
    External(ExternalStore),
}

impl EtagCache {
    /// Build the configured backend. The external store must answer a ping.
    pub async fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        match config.kind {
            CacheKind::Disabled => Ok(Self::Disabled),
            CacheKind::Naive => Ok(Self::Bounded(BoundedStore::new(config.naive_capacity))),
            CacheKind::Redis => {
                let redis = config.redis.as_ref().ok_or(CacheError::MissingRedisConfig)?;
                ExternalStore::connect(redis).await.map(Self::External)
            }
        }
    }

    pub fn kind(&self) -> CacheKind {
        match self {
            Self::Disabled => CacheKind::Disabled,
            Self::Bounded(_) => CacheKind::Naive,
            Self::External(_) => CacheKind::Redis,
        }
    }

    /// Decode a strong etag and look its weak version up by alternate key.
    pub async fn contains_weak_etag(&self, strong: &str) -> Result<bool, CacheError> {
        let decoded = StrongEtag::decode(strong)?;
        let key = decoded.weak_version.as_str();

        let found = match self {
            Self::Disabled => false,
            Self::Bounded(store) => store.contains(key),
            Self::External(store) => store.contains(key).await?,
        };

        let result = if found { "hit" } else { "miss" };
        counter!(METRIC_CONTAINS, "backend" => self.kind().as_str(), "result" => result)
            .increment(1);
        Ok(found)
    }

    pub async fn add_weak_etag(&self, key: &str, value: WeakEtag) -> Result<bool, CacheError> {
        match self {
            Self::Disabled => Ok(false),
            Self::Bounded(store) => Ok(store.add(key, value)),
            Self::External(store) => store.add(key, &value).await,
        }
    }

    pub async fn remove_weak_etag(&self, key: &str) -> Result<bool, CacheError> {
        match self {
            Self::Disabled => Ok(false),
            Self::Bounded(store) => Ok(store.remove(key)),
            Self::External(store) => store.remove(key).await,
        }
    }

    pub async fn get_weak_etag(&self, key: &str) -> Result<Option<WeakEtag>, CacheError> {
        match self {
            Self::Disabled => Ok(None),
            Self::Bounded(store) => Ok(store.get(key)),
            Self::External(store) => store.get(key).await,
        }
    }

    /// Number of stored etags. Backend errors are logged and reported as 0.
    pub async fn size(&self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Bounded(store) => store.len(),
            Self::External(store) => match store.len().await {
                Ok(size) => size,
                Err(err) => {
                    error!(
                        target = "featuretag::cache",
                        error = %err,
                        "Failed to read etag cache size"
                    );
                    0
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(version: &str) -> WeakEtag {
        WeakEtag::new("public.mock_a", "7", version, "Sun, 06 Nov 1994 08:49:37 GMT")
    }

    #[tokio::test]
    async fn disabled_cache_accepts_nothing() {
        let cache = EtagCache::from_config(&CacheConfig::default())
            .await
            .expect("disabled cache");
        let etag = row("1");
        let strong = etag.strong_etag(4326, "json");

        assert_eq!(cache.kind(), CacheKind::Disabled);
        assert!(!cache.add_weak_etag(&etag.cache_key(), etag.clone()).await.unwrap());
        assert!(!cache.contains_weak_etag(strong.as_str()).await.unwrap());
        assert!(!cache.remove_weak_etag(&etag.cache_key()).await.unwrap());
        assert_eq!(cache.get_weak_etag("1").await.unwrap(), None);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn disabled_cache_still_rejects_malformed_etag() {
        let cache = EtagCache::Disabled;
        let err = cache
            .contains_weak_etag("unknown_etag")
            .await
            .expect_err("malformed");
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn bounded_cache_resolves_strong_etag_by_version() {
        let cache = EtagCache::from_config(&CacheConfig::naive(8))
            .await
            .expect("naive cache");
        let etag = row("812");

        assert!(cache.add_weak_etag(&etag.cache_key(), etag.clone()).await.unwrap());
        assert!(
            cache
                .add_weak_etag(&etag.alternate_cache_key(), etag.clone())
                .await
                .unwrap()
        );
        assert_eq!(cache.size().await, 1);

        let strong = etag.strong_etag(4326, "json");
        assert!(cache.contains_weak_etag(&strong.as_header_value()).await.unwrap());

        let other = row("813").strong_etag(4326, "json");
        assert!(!cache.contains_weak_etag(other.as_str()).await.unwrap());
    }

    #[tokio::test]
    async fn bounded_cache_remove_by_version_clears_both_keys() {
        let cache = EtagCache::Bounded(BoundedStore::new(4));
        let etag = row("99");
        cache.add_weak_etag(&etag.cache_key(), etag.clone()).await.unwrap();
        cache
            .add_weak_etag(&etag.alternate_cache_key(), etag.clone())
            .await
            .unwrap();

        let alternate = WeakEtag::from_version("99").alternate_cache_key();
        assert!(cache.remove_weak_etag(&alternate).await.unwrap());

        assert_eq!(cache.get_weak_etag(&etag.cache_key()).await.unwrap(), None);
        assert_eq!(cache.size().await, 0);
        assert!(!cache.remove_weak_etag(&alternate).await.unwrap());
    }

    #[tokio::test]
    async fn redis_kind_without_url_is_rejected() {
        let config = CacheConfig {
            kind: CacheKind::Redis,
            ..CacheConfig::default()
        };
        let err = EtagCache::from_config(&config)
            .await
            .err()
            .expect("missing redis url");
        assert!(matches!(err, CacheError::MissingRedisConfig));
    }
}
