pub mod backoff;
pub mod builder;
pub mod config;
pub mod envelope;
pub mod error;
pub mod fallback;
pub mod handler;
pub mod store;
pub mod telemetry;

pub use builder::{Builder, WorkerHandle};
pub use config::{BuilderConfig, EngineConfig, PollMode};
pub use envelope::Envelope;
pub use error::{
    BuildError, ConfigError, ConsumeError, FallbackError, PublishError, ReclaimError, StoreError,
};
pub use fallback::{Bucket, FallbackRecord, FallbackStore};
pub use handler::{HandlerError, MessageHandler};
pub use store::{Fields, GroupInfo, MemoryStreamStore, StreamId, StreamStore};
