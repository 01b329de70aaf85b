//! Error types for inspection-sync

use thiserror::Error;

/// Local durable store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Device storage is full")]
    StorageFull,

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref code, _) = e {
            if code.code == rusqlite::ErrorCode::DiskFull {
                return StoreError::StorageFull;
            }
        }
        StoreError::Database(e)
    }
}

/// How a failed remote call must be treated by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff
    Transient,
    /// Remote rejected the payload; never retried automatically
    Permanent,
    /// Remote record is gone or was altered incompatibly
    Conflict,
}

/// Errors returned by the remote collaborators
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Validation rejected: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            RemoteError::Timeout | RemoteError::Network(_) | RemoteError::Server { .. } => {
                FailureClass::Transient
            }
            RemoteError::Validation(_) => FailureClass::Permanent,
            RemoteError::Conflict(_) | RemoteError::NotFound(_) => FailureClass::Conflict,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.failure_class() == FailureClass::Transient
    }
}

/// Hydration failures, returned whole to the caller
#[derive(Error, Debug)]
pub enum HydrationError {
    #[error("Network error during hydration: {0}")]
    Network(RemoteError),

    #[error("Project no longer exists remotely: {0}")]
    NotFound(String),

    #[error("Remote rejected hydration request: {0}")]
    Rejected(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl HydrationError {
    /// Network failures may be retried by the caller; the rest are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HydrationError::Network(_))
    }
}

impl From<RemoteError> for HydrationError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound(id) => HydrationError::NotFound(id),
            RemoteError::Validation(msg) | RemoteError::Conflict(msg) => {
                HydrationError::Rejected(msg)
            }
            other => HydrationError::Network(other),
        }
    }
}

/// Evidence capture failures
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Audit result not found locally: {0}")]
    UnknownResult(String),

    #[error("Empty evidence binary")]
    EmptyBinary,

    #[error("Evidence storage exhausted: need {needed} bytes, {available} available")]
    StorageExhausted { needed: u64, available: u64 },

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for CaptureError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::StorageFull => CaptureError::StorageExhausted {
                needed: 0,
                available: 0,
            },
            other => CaptureError::Store(other),
        }
    }
}

/// Operator actions on the queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Mutation not found: {0}")]
    NotFound(i64),

    #[error("Mutation {0} is not dead")]
    NotDead(i64),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
