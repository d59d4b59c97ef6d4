//! Persistent storage tiers.
//!
//! - `local`: SQLite key/value table, always available
//! - `remote`: HTTP storage API with retry/backoff
//! - `tiered`: routes between them, wraps values in envelopes and compresses large ones

pub mod local;
pub mod remote;
pub mod retry;
pub mod tiered;

pub use local::LocalProvider;
pub use remote::RemoteProvider;
pub use retry::RetryPolicy;
pub use tiered::{BatchItem, StoreMetrics, TierHealth, TieredStore};

use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compression::CompressionError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    #[error("storage backend offline/unavailable: {0}")]
    Offline(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock acquisition failed: {0}")]
    LockError(String),

    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("remote storage rejected request: {0}")]
    Remote(String),

    #[error("storage operation failed: {0}")]
    Failed(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl StorageError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Network(_) => true,
            StorageError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, StorageError::Offline(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    Local,
    Remote,
}

impl StorageProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageProvider::Local => "local",
            StorageProvider::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// `Some(false)` stores uncompressed regardless of size.
    pub compress: Option<bool>,
    pub priority: Priority,
    /// Stored values read as absent once this has elapsed.
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn uncompressed() -> Self {
        Self {
            compress: Some(false),
            ..Self::default()
        }
    }

    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub provider: StorageProvider,
    pub latency_ms: f64,
    pub compressed: bool,
    pub fallback_used: bool,
}

/// Uniform outcome of every public storage operation.
///
/// A successful lookup of an absent key is `success: true` with no data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageResult<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultMetadata>,
}

impl<T> StorageResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            metadata: None,
        }
    }

    pub fn failed(error: impl Display) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: ResultMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.success
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StorageResult<U> {
        StorageResult {
            success: self.success,
            data: self.data.map(f),
            error: self.error,
            metadata: self.metadata,
        }
    }

    /// Reinterprets the shape, dropping the payload.
    pub fn discard<U>(self) -> StorageResult<U> {
        StorageResult {
            success: self.success,
            data: None,
            error: self.error,
            metadata: self.metadata,
        }
    }

    pub fn from_optional(result: Result<Option<T>, StorageError>) -> Self {
        match result {
            Ok(Some(data)) => StorageResult::ok(data),
            Ok(None) => StorageResult::empty(),
            Err(err) => StorageResult::failed(err),
        }
    }

    /// Collapses a failed result back into an error for internal callers.
    pub fn into_result(self) -> Result<Option<T>, StorageError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(StorageError::Failed(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    pub fn fallback_used(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.fallback_used)
    }
}

impl<T> From<Result<T, StorageError>> for StorageResult<T> {
    fn from(result: Result<T, StorageError>) -> Self {
        match result {
            Ok(data) => StorageResult::ok(data),
            Err(err) => StorageResult::failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(StorageError::Network("reset".into()).is_retryable());
        assert!(StorageError::Http { status: 503, message: String::new() }.is_retryable());
        assert!(StorageError::Http { status: 429, message: String::new() }.is_retryable());
        assert!(!StorageError::Http { status: 404, message: String::new() }.is_retryable());
        assert!(!StorageError::NotAuthenticated.is_retryable());
    }

    #[test]
    fn result_from_option() {
        let absent = StorageResult::<u32>::from_optional(Ok(None));
        assert!(absent.success);
        assert!(absent.data.is_none());

        let failed = StorageResult::<u32>::from_optional(Err(StorageError::NotAuthenticated));
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("not authenticated"));
    }

    #[test]
    fn result_serializes_camel_case() {
        let result = StorageResult::ok(1).with_metadata(ResultMetadata {
            provider: StorageProvider::Local,
            latency_ms: 1.5,
            compressed: false,
            fallback_used: true,
        });
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["metadata"]["fallbackUsed"], true);
        assert_eq!(json["metadata"]["provider"], "local");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn priorities_order() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }
}
