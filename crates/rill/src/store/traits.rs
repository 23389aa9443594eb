use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::store::StreamId;

/// Field map of a single stream entry.
pub type Fields = HashMap<String, String>;

/// Per-group bookkeeping snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupInfo {
    /// Delivered-but-unacked entry count.
    pub pending: u64,
    /// Highest id the group has delivered.
    pub last_delivered: StreamId,
    /// Consumers the group has seen.
    pub consumers: u64,
}

/// An append-only ordered log with consumer groups, the contract the engine
/// runs against. Semantics follow the Redis Streams command family; the
/// in-memory [`crate::store::MemoryStreamStore`] is the reference backend and
/// a networked one slots in behind the same trait.
///
/// All operations are failable at the transport level; the engine treats a
/// [`crate::error::StoreError`] as "broker unreachable" and falls back to
/// local persistence where configured.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append one entry. `id` is either an explicit `{ms}-{seq}` string,
    /// which must sort above the current top entry, or `"*"` to let the
    /// store assign the next id. Returns the assigned id.
    async fn append(&self, queue: &str, id: &str, fields: Fields) -> StoreResult<StreamId>;

    /// Create a consumer group positioned at `start`. Creates the stream
    /// when it is missing and `mkstream` is set. Idempotent: an existing
    /// group is left untouched.
    async fn create_group(
        &self,
        queue: &str,
        group: &str,
        start: StreamId,
        mkstream: bool,
    ) -> StoreResult<()>;

    /// Read up to `count` never-delivered entries per queue on behalf of
    /// `consumer`, marking each as pending for the group. Blocks up to
    /// `block_ms` waiting for at least one entry across the queues;
    /// `block_ms = 0` returns immediately. Queues without new entries are
    /// absent from the result map.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        queues: &[String],
        count: usize,
        block_ms: u64,
    ) -> StoreResult<HashMap<String, Vec<(StreamId, Fields)>>>;

    /// Acknowledge delivered entries, removing them from the group's pending
    /// set. Returns how many were actually pending. Unknown ids are ignored.
    async fn ack(&self, queue: &str, group: &str, ids: &[StreamId]) -> StoreResult<u64>;

    /// Scan the group's pending set from the `start` cursor and transfer
    /// ownership of up to `count` entries idle for at least `min_idle_ms`
    /// to `consumer`, bumping their delivery counts. Pending references
    /// whose entry has been deleted from the log are dropped from the
    /// pending set and never returned. Returns the cursor for the next call
    /// ([`StreamId::ZERO`] once the scan has wrapped) and the claimed
    /// entries.
    async fn auto_claim(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start: StreamId,
        count: usize,
    ) -> StoreResult<(StreamId, Vec<(StreamId, Fields)>)>;

    /// Entries in `[start, end]`, oldest first, at most `count`.
    async fn range(
        &self,
        queue: &str,
        start: StreamId,
        end: StreamId,
        count: usize,
    ) -> StoreResult<Vec<(StreamId, Fields)>>;

    /// Remove entries from the log. Pending references are left in place and
    /// surface as deleted to a later claim. Returns how many existed.
    async fn delete(&self, queue: &str, ids: &[StreamId]) -> StoreResult<u64>;

    /// Current entry count; 0 for a missing stream.
    async fn len(&self, queue: &str) -> StoreResult<u64>;

    /// Group bookkeeping, `None` when the stream or group does not exist.
    async fn group_info(&self, queue: &str, group: &str) -> StoreResult<Option<GroupInfo>>;
}
