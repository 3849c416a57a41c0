use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("`database.url` is not configured")]
    MissingDatabaseUrl,
    #[error("failed to connect to the database: {source}")]
    Connect {
        #[source]
        source: sqlx::Error,
    },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
