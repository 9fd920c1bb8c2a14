//! Crate-level error taxonomy.
//!
//! Each subsystem defines its own error enum; this module unifies them into
//! one [`EngineError`] so the binary and the serving layer work against a
//! single type with stable status codes.

use thiserror::Error;

use crate::engine::QueryError;
use crate::index::{ArtifactError, BuildError};
use crate::resolver::ResolverError;
use crate::store::StoreError;
use crate::vector::VectorError;

/// Unified error for everything above the subsystem boundaries.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    /// Malformed request body or parameters on the serving surface.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// No artifact is loaded yet; the server is up but cannot answer.
    #[error("No index loaded\nSuggestion: Build an index with 'proxima build' and point the server at it")]
    NotReady,

    /// Whole-request deadline exceeded; work on the request is abandoned.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl EngineError {
    /// Stable string identifier for programmatic handling in JSON responses.
    pub fn status_code(&self) -> String {
        match self {
            Self::Vector(_) => "VECTOR_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Artifact(_) => "ARTIFACT_ERROR",
            Self::Build(_) => "BUILD_ERROR",
            Self::Query(_) => "INVALID_QUERY",
            Self::Resolver(ResolverError::UnknownId(_)) => "UNKNOWN_ID",
            Self::Resolver(ResolverError::Unavailable { .. }) => "RESOLVER_UNAVAILABLE",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::NotReady => "NOT_READY",
            Self::Timeout { .. } => "REQUEST_TIMEOUT",
            Self::Config { .. } => "CONFIG_ERROR",
        }
        .to_string()
    }

    /// HTTP status the serving layer maps this error to.
    ///
    /// Client-input problems are 400, missing-dependency states 503,
    /// everything else 500.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Query(_)
            | Self::InvalidRequest { .. }
            | Self::Resolver(ResolverError::UnknownId(_))
            | Self::Vector(VectorError::DimensionMismatch { .. }) => 400,
            Self::NotReady
            | Self::Timeout { .. }
            | Self::Resolver(ResolverError::Unavailable { .. }) => 503,
            _ => 500,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::ItemId;

    #[test]
    fn test_client_errors_map_to_400() {
        let err = EngineError::InvalidRequest {
            reason: "missing field".to_string(),
        };
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.status_code(), "INVALID_REQUEST");

        let err = EngineError::Resolver(ResolverError::UnknownId(ItemId::from("x")));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_unavailable_maps_to_503() {
        assert_eq!(EngineError::NotReady.http_status(), 503);
        let err = EngineError::Resolver(ResolverError::Unavailable {
            reason: "down".to_string(),
        });
        assert_eq!(err.http_status(), 503);
    }

    #[test]
    fn test_internal_errors_map_to_500() {
        let err = EngineError::Config {
            reason: "bad value".to_string(),
        };
        assert_eq!(err.http_status(), 500);
    }
}
