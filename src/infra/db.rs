//! PostgreSQL pool shared by the catalog, the listener DDL and `PgListener`.

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::DatabaseSettings;

use super::error::InfraError;

pub async fn connect(settings: &DatabaseSettings) -> Result<PgPool, InfraError> {
    let url = settings
        .url
        .as_deref()
        .ok_or(InfraError::MissingDatabaseUrl)?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections.get())
        .connect(url)
        .await
        .map_err(|source| InfraError::Connect { source })?;

    info!(
        target = "featuretag::infra::db",
        max_connections = settings.max_connections.get(),
        "Connected to PostgreSQL"
    );
    Ok(pool)
}
