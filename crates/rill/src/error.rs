/// Low-level remote store errors (transport, wire serialization).
/// This is the error type for the `StreamStore` trait — store operations can
/// only fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Local fallback store errors (RocksDB, record serialization).
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("rocksdb error: {0}")]
    RocksDb(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rocksdb::Error> for FallbackError {
    fn from(err: rocksdb::Error) -> Self {
        FallbackError::RocksDb(err.into_string())
    }
}

impl From<serde_json::Error> for FallbackError {
    fn from(err: serde_json::Error) -> Self {
        FallbackError::Serialization(err.to_string())
    }
}

// --- Per-operation error types ---

/// Errors loading configuration from disk.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors constructing a builder.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid builder config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Fallback(#[from] FallbackError),
}

/// Errors surfaced synchronously to `publish` callers. Only validation
/// failures and (when the fallback store is disabled) broker transport
/// failures propagate; backpressure is a per-queue outcome, not an error.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid publish: {0}")]
    InvalidPublish(String),

    #[error("unknown queue: {0}")]
    InvalidQueue(String),

    #[error(transparent)]
    Broker(#[from] StoreError),

    #[error(transparent)]
    Fallback(#[from] FallbackError),
}

/// Errors that abort a single consume tick. Contained by the poll loop:
/// logged, group-ensure cache invalidated, never fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ack failed for {id} on queue {queue}: {source}")]
    Ack {
        queue: String,
        id: String,
        source: StoreError,
    },

    #[error(transparent)]
    Fallback(#[from] FallbackError),
}

/// Errors that abort a single reclaim pass.
#[derive(Debug, thiserror::Error)]
pub enum ReclaimError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fallback(#[from] FallbackError),

    #[error(transparent)]
    Consume(#[from] ConsumeError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type FallbackResult<T> = std::result::Result<T, FallbackError>;
