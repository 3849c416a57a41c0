use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

use crate::cache::{CacheConfig, EtagCache};
use crate::catalog::{Catalog, PgCatalog};
use crate::config::Settings;
use crate::infra::db;
use crate::listener::{ChangeListener, ListenerConfig};

use super::error::AppError;

/// Everything built once at startup and shared with request handlers and the
/// change listener.
#[derive(Clone)]
pub struct AppContext {
    pub pool: PgPool,
    pub cache: Arc<EtagCache>,
    pub catalog: Arc<dyn Catalog>,
    pub listener: ListenerConfig,
}

impl AppContext {
    /// Connect the pool, build the cache and load the catalog. An unreachable
    /// external cache fails startup.
    pub async fn build(settings: &Settings) -> Result<Self, AppError> {
        let pool = db::connect(&settings.database).await?;
        let cache = EtagCache::from_config(&CacheConfig::from(&settings.cache)).await?;
        info!(
            target = "featuretag::application::context",
            cache = cache.kind().as_str(),
            "Etag cache ready"
        );
        let catalog = PgCatalog::load(pool.clone()).await?;

        Ok(Self::from_parts(
            pool,
            cache,
            Arc::new(catalog),
            ListenerConfig::from(&settings.listener),
        ))
    }

    pub fn from_parts(
        pool: PgPool,
        cache: EtagCache,
        catalog: Arc<dyn Catalog>,
        listener: ListenerConfig,
    ) -> Self {
        Self {
            pool,
            cache: Arc::new(cache),
            catalog,
            listener,
        }
    }

    pub fn change_listener(&self) -> ChangeListener {
        ChangeListener::new(
            self.pool.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.catalog),
            self.listener.clone(),
        )
    }
}
