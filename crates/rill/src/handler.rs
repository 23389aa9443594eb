use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::store::StreamId;

/// A handler's negative outcome. This is a value, not an exception channel:
/// the consume tick converts it into a requeue-with-incremented-retry-count
/// or a dead-letter record, and it never propagates past the tick.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The user-supplied dispatch callback, one per builder type.
///
/// Implementations must be idempotent where possible: delivery is
/// at-least-once, and a message may be redispatched after a crash between
/// handling and acknowledgment.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        id: &StreamId,
        body: &str,
        envelope: &Envelope,
    ) -> Result<(), HandlerError>;
}
