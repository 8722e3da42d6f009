//! Unified error handling for the LRS service.
//!
//! Every fallible operation in the crate returns [`LrsError`]. The variants
//! form the error taxonomy surfaced to callers; the transport layers map them
//! onto gRPC status codes and HTTP status codes without inspecting messages.

use std::fmt;

/// Unified error type for LRS operations.
#[derive(Debug, Clone)]
pub enum LrsError {
    /// Malformed input: missing columns, bad feature collection, empty payload.
    Validation { message: String },
    /// A referenced entity does not exist (no active catalog entry, unknown route id).
    NotFound { what: String },
    /// The upstream feature service failed or returned a non-success status.
    Upstream {
        message: String,
        status: Option<u16>,
    },
    /// Disk or stream I/O failure (spill write, temp dir creation, file read).
    Io { message: String },
    /// The analytical engine rejected or failed a query.
    Engine {
        message: String,
        /// The failing SQL fragment, when one is known.
        query: Option<String>,
    },
    /// Ambient cancellation propagated from the transport.
    Cancelled,
    /// An impossible state was observed; not recoverable.
    Invariant { message: String },
}

impl LrsError {
    pub fn validation(message: impl Into<String>) -> Self {
        LrsError::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        LrsError::NotFound { what: what.into() }
    }

    pub fn upstream(message: impl Into<String>, status: Option<u16>) -> Self {
        LrsError::Upstream {
            message: message.into(),
            status,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        LrsError::Io {
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>, query: Option<String>) -> Self {
        LrsError::Engine {
            message: message.into(),
            query,
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        LrsError::Invariant {
            message: message.into(),
        }
    }
}

impl fmt::Display for LrsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LrsError::Validation { message } => write!(f, "validation error: {}", message),
            LrsError::NotFound { what } => write!(f, "not found: {}", what),
            LrsError::Upstream { message, status } => match status {
                Some(code) => write!(f, "upstream failure ({}): {}", code, message),
                None => write!(f, "upstream failure: {}", message),
            },
            LrsError::Io { message } => write!(f, "io error: {}", message),
            LrsError::Engine { message, query } => match query {
                Some(q) => write!(f, "engine failure: {} (query: {})", message, q.trim()),
                None => write!(f, "engine failure: {}", message),
            },
            LrsError::Cancelled => write!(f, "cancelled"),
            LrsError::Invariant { message } => write!(f, "invariant violated: {}", message),
        }
    }
}

impl std::error::Error for LrsError {}

/// Result type alias for LRS operations.
pub type Result<T> = std::result::Result<T, LrsError>;

impl From<std::io::Error> for LrsError {
    fn from(err: std::io::Error) -> Self {
        LrsError::io(err.to_string())
    }
}

impl From<duckdb::Error> for LrsError {
    fn from(err: duckdb::Error) -> Self {
        LrsError::engine(err.to_string(), None)
    }
}

impl From<arrow::error::ArrowError> for LrsError {
    fn from(err: arrow::error::ArrowError) -> Self {
        LrsError::engine(err.to_string(), None)
    }
}

impl From<parquet::errors::ParquetError> for LrsError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        LrsError::io(err.to_string())
    }
}

impl From<serde_json::Error> for LrsError {
    fn from(err: serde_json::Error) -> Self {
        LrsError::validation(err.to_string())
    }
}

impl From<reqwest::Error> for LrsError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        LrsError::upstream(err.to_string(), status)
    }
}

impl From<LrsError> for tonic::Status {
    fn from(err: LrsError) -> Self {
        let message = err.to_string();
        match err {
            LrsError::Validation { .. } => tonic::Status::invalid_argument(message),
            LrsError::NotFound { .. } => tonic::Status::not_found(message),
            LrsError::Upstream { .. } => tonic::Status::unavailable(message),
            LrsError::Io { .. } => tonic::Status::internal(message),
            LrsError::Engine { .. } => tonic::Status::internal(message),
            LrsError::Cancelled => tonic::Status::cancelled(message),
            LrsError::Invariant { .. } => tonic::Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LrsError::engine("binder error", Some("SELECT nope".to_string()));
        assert!(err.to_string().contains("binder error"));
        assert!(err.to_string().contains("SELECT nope"));

        let err = LrsError::upstream("service unavailable", Some(503));
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_status_mapping() {
        let status: tonic::Status = LrsError::validation("missing column").into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: tonic::Status = LrsError::not_found("no active catalog entry").into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = LrsError::Cancelled.into();
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }
}
