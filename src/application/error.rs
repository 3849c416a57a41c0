use thiserror::Error;

use crate::{
    cache::CacheError, catalog::CatalogError, config::LoadError, infra::error::InfraError,
    listener::ListenerError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

impl AppError {
    /// Status a request handler should answer with when this error ends a
    /// conditional request.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Cache(err) if err.is_client_error() => 400,
            AppError::Cache(_) | AppError::Infra(InfraError::Connect { .. }) => 503,
            AppError::Config(_)
            | AppError::Infra(_)
            | AppError::Catalog(_)
            | AppError::Listener(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::etag::EtagError;

    #[test]
    fn malformed_etag_maps_to_bad_request() {
        let err = AppError::from(CacheError::from(EtagError::SegmentCount {
            candidate: "x".to_string(),
            found: 1,
        }));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn backend_failures_map_to_unavailable() {
        assert_eq!(AppError::from(CacheError::unavailable("down")).http_status(), 503);
        let missing = AppError::from(InfraError::MissingDatabaseUrl);
        assert_eq!(missing.http_status(), 500);
    }
}
