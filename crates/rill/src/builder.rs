use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backoff::{AdaptiveInterval, RetryBackoff};
use crate::config::{BuilderConfig, EngineConfig, PollMode};
use crate::envelope::{now_millis, now_secs, Envelope, FIELD_BODY, FIELD_HEADER};
use crate::error::{
    BuildError, ConsumeError, FallbackError, PublishError, ReclaimError, StoreResult,
};
use crate::fallback::{Bucket, FallbackRecord, FallbackStore};
use crate::handler::MessageHandler;
use crate::store::{Fields, StreamId, StreamStore};

/// Entries examined per trim batch when purging acknowledged entries.
const TRIM_BATCH: usize = 100;

/// One consumer-group worker over a set of queues: publish on the producer
/// side, a poll/dispatch/ack loop on the consumer side, stale-entry reclaim,
/// and local fallback persistence when the broker is unreachable.
///
/// A builder is cheaply shared behind an [`Arc`]; producers call
/// [`Builder::publish`] from any task while [`Builder::start`] drives the
/// consumption loop on a single spawned task, so poll, reclaim, replay and
/// trim never overlap each other.
pub struct Builder {
    config: BuilderConfig,
    engine: EngineConfig,
    store: Arc<dyn StreamStore>,
    fallback: Option<Arc<FallbackStore>>,
    handler: Arc<dyn MessageHandler>,
    /// `{group}-{worker_id}`, the name this worker claims deliveries under.
    consumer: String,
    /// Consumer groups are created lazily once per process.
    groups_ready: AtomicBool,
    /// Per-queue reclaim scan cursors. Never held across an await.
    claim_cursors: Mutex<HashMap<String, StreamId>>,
}

impl Builder {
    /// Build a worker identified by a stable numeric worker index, the
    /// usual shape under a process supervisor that numbers its workers.
    pub fn new(
        config: BuilderConfig,
        engine: EngineConfig,
        store: Arc<dyn StreamStore>,
        handler: Arc<dyn MessageHandler>,
        worker_id: u32,
    ) -> Result<Self, BuildError> {
        let consumer = format!("{}-{}", config.group, worker_id);
        Self::build(config, engine, store, handler, consumer)
    }

    /// Like [`Builder::new`] for deployments without stable worker indexes:
    /// the consumer name gets a process-unique UUIDv7 suffix instead.
    pub fn with_unique_consumer(
        config: BuilderConfig,
        engine: EngineConfig,
        store: Arc<dyn StreamStore>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, BuildError> {
        let consumer = format!("{}-{}", config.group, uuid::Uuid::now_v7());
        Self::build(config, engine, store, handler, consumer)
    }

    fn build(
        config: BuilderConfig,
        engine: EngineConfig,
        store: Arc<dyn StreamStore>,
        handler: Arc<dyn MessageHandler>,
        consumer: String,
    ) -> Result<Self, BuildError> {
        if config.group.is_empty() {
            return Err(BuildError::InvalidConfig("group name must not be empty".into()));
        }
        if config.queues.is_empty() {
            return Err(BuildError::InvalidConfig("at least one queue is required".into()));
        }
        if config.prefetch_count == 0 {
            return Err(BuildError::InvalidConfig("prefetch_count must be positive".into()));
        }
        if engine.poll.mode == PollMode::Tight && engine.poll.yield_min_ms > engine.poll.yield_max_ms
        {
            return Err(BuildError::InvalidConfig("tight-mode yield range is inverted".into()));
        }

        let fallback = match &engine.fallback.path {
            Some(path) => Some(Arc::new(FallbackStore::open(path)?)),
            None => None,
        };

        Ok(Self {
            config,
            engine,
            store,
            fallback,
            handler,
            consumer,
            groups_ready: AtomicBool::new(false),
            claim_cursors: Mutex::new(HashMap::new()),
        })
    }

    /// The local fallback store, when one is configured. Dead-lettered
    /// records live in its [`Bucket::Error`] bucket and are only drained
    /// through this handle.
    pub fn fallback(&self) -> Option<&FallbackStore> {
        self.fallback.as_deref()
    }

    /// Publish a fresh message to every configured queue, returning how many
    /// accepted it. A queue at its configured capacity skips the message
    /// without an error; the caller decides whether to retry the rejected
    /// ones. `delay_ms` must agree with the builder's mode, see
    /// [`Builder::publish_to`].
    pub async fn publish(&self, body: &str, delay_ms: u64) -> Result<usize, PublishError> {
        let envelope = Envelope::new(delay_ms);
        let mut accepted = 0;
        for queue in &self.config.queues {
            if self.publish_envelope(queue, body, envelope.clone()).await? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Publish a fresh message to one configured queue. `delay_ms` must
    /// agree with the queue's mode: a positive delay is only valid on a
    /// delayed queue, and a zero delay only on a non-delayed one.
    ///
    /// Returns `Ok(false)` when the queue is at its configured capacity; the
    /// message was not accepted and the caller decides whether to retry.
    /// With a fallback store configured, broker transport failures park the
    /// message locally and still report acceptance.
    pub async fn publish_to(
        &self,
        queue: &str,
        body: &str,
        delay_ms: u64,
    ) -> Result<bool, PublishError> {
        self.publish_envelope(queue, body, Envelope::new(delay_ms)).await
    }

    /// [`Builder::publish`] with full control of the envelope, e.g. to keep
    /// acknowledged entries in the log with `auto_delete = false`.
    pub async fn publish_envelope(
        &self,
        queue: &str,
        body: &str,
        envelope: Envelope,
    ) -> Result<bool, PublishError> {
        if !self.config.queues.iter().any(|q| q == queue) {
            return Err(PublishError::InvalidQueue(queue.to_string()));
        }
        if envelope.delay > 0 && !self.config.delayed {
            return Err(PublishError::InvalidPublish(
                "delayed publish to a non-delayed queue".into(),
            ));
        }
        if envelope.delay == 0 && self.config.delayed {
            return Err(PublishError::InvalidPublish(
                "immediate publish to a delayed queue".into(),
            ));
        }

        let fields = envelope.to_fields(body).map_err(PublishError::Broker)?;
        match self.try_append(queue, &envelope.id, fields.clone()).await {
            Ok(accepted) => Ok(accepted),
            Err(e) => match &self.fallback {
                Some(fb) => {
                    warn!(%queue, error = %e, "publish failed, parking in fallback store");
                    fb.insert(Bucket::Requeue, &FallbackRecord::new(queue, fields))?;
                    Ok(true)
                }
                None => Err(e.into()),
            },
        }
    }

    async fn try_append(&self, queue: &str, id: &str, fields: Fields) -> StoreResult<bool> {
        // Groups exist before the first entry so nothing is ever missed.
        self.ensure_groups().await?;
        if self.config.queue_size > 0 && self.store.len(queue).await? >= self.config.queue_size {
            debug!(%queue, cap = self.config.queue_size, "queue at capacity, publish rejected");
            return Ok(false);
        }
        self.store.append(queue, id, fields).await?;
        Ok(true)
    }

    /// One poll tick: read a batch for this worker and run each entry
    /// through dispatch. `del` controls whether retired entries are removed
    /// from the log (subject to each envelope's `auto_delete`); `block_ms`
    /// is handed to the group read. Returns whether any entry was delivered,
    /// which feeds the adaptive interval.
    ///
    /// An error aborts the tick and invalidates the group-ensure cache;
    /// entries already processed stay processed and the rest stay pending
    /// under this consumer, recovered only by a reclaim pass once their
    /// idle timeout elapses.
    pub async fn consume(&self, del: bool, block_ms: u64) -> Result<bool, ConsumeError> {
        match self.consume_inner(del, block_ms).await {
            Ok(busy) => Ok(busy),
            Err(e) => {
                self.groups_ready.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn consume_inner(&self, del: bool, block_ms: u64) -> Result<bool, ConsumeError> {
        self.ensure_groups().await?;
        let batch = self
            .store
            .read_group(
                &self.config.group,
                &self.consumer,
                &self.config.queues,
                self.config.prefetch_count,
                block_ms,
            )
            .await?;
        let busy = !batch.is_empty();
        for (queue, entries) in batch {
            for (id, fields) in entries {
                self.process_entry(&queue, id, &fields, del).await?;
            }
        }
        Ok(busy)
    }

    /// One reclaim pass: resume the per-queue pending scan and take over
    /// entries idle past `pending_timeout`, i.e. deliveries whose worker
    /// died or stalled before acknowledging. Each claimed entry is persisted
    /// to the fallback pending bucket first, then the stale delivery is
    /// acked (and its log entry removed when `auto_delete` is set), then the
    /// entry is re-appended to its queue; the durable copy is dropped only
    /// once the re-append is confirmed, so a crash or broker failure at any
    /// point duplicates rather than loses. Without a fallback store the
    /// re-append happens before the ack instead. Returns how many were
    /// claimed.
    pub async fn reclaim(&self, auto_delete: bool) -> Result<usize, ReclaimError> {
        if self.config.pending_timeout == 0 {
            return Ok(0);
        }
        self.ensure_groups().await.map_err(ReclaimError::Store)?;

        let mut claimed_total = 0;
        for queue in &self.config.queues {
            let cursor = {
                let cursors = self.claim_cursors.lock().unwrap();
                cursors.get(queue).copied().unwrap_or(StreamId::ZERO)
            };
            let (next_cursor, claimed) = self
                .store
                .auto_claim(
                    queue,
                    &self.config.group,
                    &self.consumer,
                    self.config.pending_timeout,
                    cursor,
                    self.config.prefetch_count,
                )
                .await
                .map_err(ReclaimError::Store)?;
            self.claim_cursors
                .lock()
                .unwrap()
                .insert(queue.clone(), next_cursor);

            if !claimed.is_empty() {
                debug!(%queue, count = claimed.len(), "reclaimed stale deliveries");
            }
            claimed_total += claimed.len();
            for (id, fields) in claimed {
                match &self.fallback {
                    Some(fb) => {
                        let key = fb
                            .insert(Bucket::Pending, &FallbackRecord::new(queue, fields.clone()))
                            .map_err(ReclaimError::Fallback)?;
                        self.ack_entry(queue, id, auto_delete).await?;
                        match self.store.append(queue, "*", fields).await {
                            Ok(_) => {
                                fb.delete(Bucket::Pending, key)
                                    .map_err(ReclaimError::Fallback)?;
                            }
                            // The durable copy stays; replay drains it once
                            // the broker is reachable again.
                            Err(e) => {
                                warn!(%queue, error = %e, "requeue of reclaimed entry failed");
                            }
                        }
                    }
                    None => {
                        self.store
                            .append(queue, "*", fields)
                            .await
                            .map_err(ReclaimError::Store)?;
                        self.ack_entry(queue, id, auto_delete).await?;
                    }
                }
            }
        }
        Ok(claimed_total)
    }

    /// One replay pass: re-append locally parked records oldest-first, up to
    /// `replay_batch` per bucket. A record is removed only after the broker
    /// confirms the append; the first transport failure defers the rest to
    /// the next pass. The error bucket is never replayed.
    pub async fn replay(&self) -> Result<usize, FallbackError> {
        let Some(fb) = &self.fallback else {
            return Ok(0);
        };
        let mut replayed = 0;
        for bucket in [Bucket::Requeue, Bucket::Pending] {
            for (key, record) in fb.oldest(bucket, self.engine.fallback.replay_batch)? {
                match self.store.append(&record.queue, "*", record.data.clone()).await {
                    Ok(_) => {
                        fb.delete(bucket, key)?;
                        replayed += 1;
                    }
                    Err(e) => {
                        debug!(error = %e, "broker still unavailable, replay deferred");
                        return Ok(replayed);
                    }
                }
            }
        }
        if replayed > 0 {
            info!(count = replayed, "replayed fallback records to the broker");
        }
        Ok(replayed)
    }

    /// Purge entries the group has already moved past, in batches. Keeps the
    /// group's last-delivered entry as the read position marker. This is the
    /// janitor for messages published with `auto_delete = false`.
    pub async fn trim(&self, queue: &str) -> StoreResult<u64> {
        let Some(info) = self.store.group_info(queue, &self.config.group).await? else {
            return Ok(0);
        };
        if info.last_delivered == StreamId::ZERO {
            return Ok(0);
        }
        let mut removed = 0;
        loop {
            let batch = self
                .store
                .range(queue, StreamId::ZERO, info.last_delivered, TRIM_BATCH)
                .await?;
            let full = batch.len() == TRIM_BATCH;
            let ids: Vec<StreamId> = batch
                .into_iter()
                .map(|(id, _)| id)
                .filter(|id| *id != info.last_delivered)
                .collect();
            if ids.is_empty() {
                break;
            }
            removed += self.store.delete(queue, &ids).await?;
            if !full {
                break;
            }
        }
        if removed > 0 {
            debug!(%queue, removed, "trimmed acknowledged entries");
        }
        Ok(removed)
    }

    /// Group bookkeeping for one of this builder's queues, `None` until the
    /// group exists there.
    pub async fn group_info(&self, queue: &str) -> StoreResult<Option<crate::store::GroupInfo>> {
        self.store.group_info(queue, &self.config.group).await
    }

    /// Spawn the worker loop. The returned handle stops it gracefully;
    /// dropping the handle detaches the worker instead.
    pub fn start(self: &Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Arc::clone(self);
        let join = tokio::spawn(worker.run_loop(shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let poll = self.engine.poll.clone();
        let mut adaptive = AdaptiveInterval::new(&self.engine.adaptive, poll.interval_ms);
        info!(
            group = %self.config.group,
            consumer = %self.consumer,
            mode = ?poll.mode,
            adaptive = adaptive.enabled(),
            "worker started"
        );

        let reclaim_enabled = self.config.pending_timeout > 0;
        let mut reclaim_timer =
            tokio::time::interval(Duration::from_millis(self.config.pending_timeout.max(1)));
        reclaim_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let replay_enabled =
            self.fallback.is_some() && self.engine.fallback.replay_interval_ms > 0;
        let mut replay_timer = tokio::time::interval(Duration::from_millis(
            self.engine.fallback.replay_interval_ms.max(1),
        ));
        replay_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let trim_enabled = poll.trim_interval_ms > 0;
        let mut trim_timer =
            tokio::time::interval(Duration::from_millis(poll.trim_interval_ms.max(1)));
        trim_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let (delay, block_ms) = match poll.mode {
                PollMode::Fixed => (Duration::from_millis(poll.interval_ms), 0),
                PollMode::Adaptive => (adaptive.current(), 0),
                PollMode::Tight => {
                    let yield_ms = rand::thread_rng()
                        .gen_range(poll.yield_min_ms..=poll.yield_max_ms);
                    (Duration::from_millis(yield_ms), poll.interval_ms)
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = reclaim_timer.tick(), if reclaim_enabled => {
                    if let Err(e) = self.reclaim(self.config.delete_on_ack).await {
                        warn!(error = %e, "reclaim pass failed");
                    }
                }
                _ = replay_timer.tick(), if replay_enabled => {
                    if let Err(e) = self.replay().await {
                        warn!(error = %e, "replay pass failed");
                    }
                }
                _ = trim_timer.tick(), if trim_enabled => {
                    for queue in &self.config.queues {
                        if let Err(e) = self.trim(queue).await {
                            warn!(%queue, error = %e, "trim pass failed");
                        }
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    match self.consume(self.config.delete_on_ack, block_ms).await {
                        Ok(true) => adaptive.on_busy(),
                        Ok(false) => adaptive.on_idle(now_millis()),
                        Err(e) => {
                            error!(error = %e, "consume tick failed");
                            adaptive.on_idle(now_millis());
                        }
                    }
                }
            }
        }
        info!(consumer = %self.consumer, "worker stopped");
    }

    async fn ensure_groups(&self) -> StoreResult<()> {
        if self.groups_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        for queue in &self.config.queues {
            self.store
                .create_group(queue, &self.config.group, StreamId::ZERO, true)
                .await?;
        }
        self.groups_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Run one delivered entry through the dispatch state machine.
    async fn process_entry(
        &self,
        queue: &str,
        id: StreamId,
        fields: &Fields,
        del: bool,
    ) -> Result<(), ConsumeError> {
        let Some(envelope) = fields.get(FIELD_HEADER).and_then(|raw| Envelope::from_json(raw))
        else {
            warn!(%queue, %id, "malformed envelope, discarding entry");
            self.ack_entry(queue, id, del).await?;
            return Ok(());
        };
        let body = fields.get(FIELD_BODY).map(String::as_str).unwrap_or("");

        if self.config.delayed && !envelope.is_due(now_secs()) {
            // Not due yet: put an untouched copy back, then retire this
            // delivery. The copy lands before the original is dropped, so a
            // crash in between duplicates rather than loses.
            self.republish(queue, &envelope, body).await?;
            self.ack_entry(queue, id, del).await?;
            return Ok(());
        }

        match self.handler.handle(&id, body, &envelope).await {
            Ok(()) => {
                self.ack_entry(queue, id, del && envelope.auto_delete).await?;
            }
            Err(err) => {
                let mut retry = envelope.clone();
                retry.id = "*".to_string();
                retry.retry_count += 1;
                retry.last_error = err.to_string();

                let exhausted = self.config.error_max_count > 0
                    && retry.retry_count >= self.config.error_max_count;
                if exhausted {
                    self.dead_letter(queue, &retry, body).await?;
                } else {
                    debug!(
                        %queue, %id,
                        retry = retry.retry_count,
                        error = %err,
                        "handler failed, republishing"
                    );
                    self.republish(queue, &retry, body).await?;
                }
                self.ack_entry(queue, id, del).await?;
            }
        }
        Ok(())
    }

    /// Re-append an envelope to its queue, parking it in the requeue bucket
    /// when the broker is unreachable and a fallback store exists.
    async fn republish(
        &self,
        queue: &str,
        envelope: &Envelope,
        body: &str,
    ) -> Result<(), ConsumeError> {
        let fields = envelope.to_fields(body)?;
        if let Err(e) = self.store.append(queue, "*", fields.clone()).await {
            match &self.fallback {
                Some(fb) => {
                    warn!(%queue, error = %e, "republish failed, parking in fallback store");
                    fb.insert(Bucket::Requeue, &FallbackRecord::new(queue, fields))?;
                }
                None => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Retire a message whose retries are exhausted. Without a fallback
    /// store there is nowhere durable to put it, so it goes back on the
    /// queue rather than being dropped.
    async fn dead_letter(
        &self,
        queue: &str,
        envelope: &Envelope,
        body: &str,
    ) -> Result<(), ConsumeError> {
        match &self.fallback {
            Some(fb) => {
                fb.insert(Bucket::Error, &FallbackRecord::new(queue, envelope.to_fields(body)?))?;
                error!(
                    %queue,
                    retries = envelope.retry_count,
                    error = %envelope.last_error,
                    "message dead-lettered"
                );
            }
            None => {
                error!(
                    %queue,
                    retries = envelope.retry_count,
                    "retries exhausted with no fallback store, republishing"
                );
                self.republish(queue, envelope, body).await?;
            }
        }
        Ok(())
    }

    /// Acknowledge one delivery, then optionally remove the entry from the
    /// log. Under the blocking ack policy transport failures are retried
    /// indefinitely with doubling backoff: an un-acked entry would come back
    /// as a duplicate once its pending timeout elapses.
    async fn ack_entry(&self, queue: &str, id: StreamId, delete: bool) -> Result<(), ConsumeError> {
        if self.engine.ack.blocking {
            let mut backoff =
                RetryBackoff::new(self.engine.ack.retry_start_ms, self.engine.ack.retry_cap_ms);
            loop {
                match self.store.ack(queue, &self.config.group, &[id]).await {
                    Ok(_) => break,
                    Err(e) => {
                        warn!(%queue, %id, error = %e, "ack failed, retrying");
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        } else {
            self.store
                .ack(queue, &self.config.group, &[id])
                .await
                .map_err(|source| ConsumeError::Ack {
                    queue: queue.to_string(),
                    id: id.to_string(),
                    source,
                })?;
        }

        if delete {
            // Entry removal is cleanup, not correctness: a leftover entry is
            // invisible to the group once acked.
            if let Err(e) = self.store.delete(queue, &[id]).await {
                warn!(%queue, %id, error = %e, "failed to delete acked entry");
            }
        }
        Ok(())
    }
}

/// Handle to a started worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for the loop to exit. The tick in flight
    /// finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::error::StoreError;
    use crate::handler::HandlerError;
    use crate::store::{GroupInfo, MemoryStreamStore};

    struct TestHandler {
        fail_first: u32,
        calls: AtomicU32,
        bodies: Mutex<Vec<String>>,
    }

    impl TestHandler {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                calls: AtomicU32::new(0),
                bodies: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn bodies(&self) -> Vec<String> {
            self.bodies.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for TestHandler {
        async fn handle(
            &self,
            _id: &StreamId,
            body: &str,
            _envelope: &Envelope,
        ) -> Result<(), HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(HandlerError::new("induced failure"));
            }
            self.bodies.lock().unwrap().push(body.to_string());
            Ok(())
        }
    }

    /// Memory store whose appends can be switched off and whose acks can be
    /// made to fail a set number of times, standing in for an unreachable or
    /// flapping broker.
    struct FlakyStore {
        inner: MemoryStreamStore,
        fail_appends: AtomicBool,
        fail_acks: AtomicU32,
    }

    impl FlakyStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStreamStore::new(),
                fail_appends: AtomicBool::new(false),
                fail_acks: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl StreamStore for FlakyStore {
        async fn append(&self, queue: &str, id: &str, fields: Fields) -> StoreResult<StreamId> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(StoreError::Transport("broker down".into()));
            }
            self.inner.append(queue, id, fields).await
        }

        async fn create_group(
            &self,
            queue: &str,
            group: &str,
            start: StreamId,
            mkstream: bool,
        ) -> StoreResult<()> {
            self.inner.create_group(queue, group, start, mkstream).await
        }

        async fn read_group(
            &self,
            group: &str,
            consumer: &str,
            queues: &[String],
            count: usize,
            block_ms: u64,
        ) -> StoreResult<HashMap<String, Vec<(StreamId, Fields)>>> {
            self.inner.read_group(group, consumer, queues, count, block_ms).await
        }

        async fn ack(&self, queue: &str, group: &str, ids: &[StreamId]) -> StoreResult<u64> {
            let remaining = self.fail_acks.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_acks.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Transport("ack refused".into()));
            }
            self.inner.ack(queue, group, ids).await
        }

        async fn auto_claim(
            &self,
            queue: &str,
            group: &str,
            consumer: &str,
            min_idle_ms: u64,
            start: StreamId,
            count: usize,
        ) -> StoreResult<(StreamId, Vec<(StreamId, Fields)>)> {
            self.inner
                .auto_claim(queue, group, consumer, min_idle_ms, start, count)
                .await
        }

        async fn range(
            &self,
            queue: &str,
            start: StreamId,
            end: StreamId,
            count: usize,
        ) -> StoreResult<Vec<(StreamId, Fields)>> {
            self.inner.range(queue, start, end, count).await
        }

        async fn delete(&self, queue: &str, ids: &[StreamId]) -> StoreResult<u64> {
            self.inner.delete(queue, ids).await
        }

        async fn len(&self, queue: &str) -> StoreResult<u64> {
            self.inner.len(queue).await
        }

        async fn group_info(&self, queue: &str, group: &str) -> StoreResult<Option<GroupInfo>> {
            self.inner.group_info(queue, group).await
        }
    }

    fn base_config() -> BuilderConfig {
        BuilderConfig {
            prefetch_count: 16,
            ..BuilderConfig::new("workers", vec!["q".to_string()])
        }
    }

    fn builder(
        store: Arc<MemoryStreamStore>,
        handler: Arc<TestHandler>,
        config: BuilderConfig,
        engine: EngineConfig,
    ) -> Builder {
        Builder::new(config, engine, store, handler, 1).unwrap()
    }

    /// The envelope currently stored at each entry of the queue, in order.
    async fn stored_envelopes(store: &MemoryStreamStore, queue: &str) -> Vec<(StreamId, Envelope)> {
        store
            .range(queue, StreamId::ZERO, StreamId::MAX, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|(id, fields)| {
                let env = Envelope::from_json(&fields[FIELD_HEADER]).expect("valid header");
                (id, env)
            })
            .collect()
    }

    #[test]
    fn new_rejects_bad_config() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);

        let no_group = BuilderConfig::new("", vec!["q".to_string()]);
        assert!(matches!(
            Builder::new(no_group, EngineConfig::default(), store.clone(), handler.clone(), 1),
            Err(BuildError::InvalidConfig(_))
        ));

        let no_queues = BuilderConfig::new("workers", vec![]);
        assert!(matches!(
            Builder::new(no_queues, EngineConfig::default(), store.clone(), handler.clone(), 1),
            Err(BuildError::InvalidConfig(_))
        ));

        let mut inverted_yield = EngineConfig::default();
        inverted_yield.poll.mode = PollMode::Tight;
        inverted_yield.poll.yield_min_ms = 10;
        inverted_yield.poll.yield_max_ms = 5;
        assert!(matches!(
            Builder::new(base_config(), inverted_yield, store, handler, 1),
            Err(BuildError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn publish_then_consume_dispatches_and_cleans_up() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);
        let b = builder(store.clone(), handler.clone(), base_config(), EngineConfig::default());

        assert!(b.publish_to("q", "hello", 0).await.unwrap());
        assert!(b.consume(true, 0).await.unwrap(), "tick with work reports busy");

        assert_eq!(handler.calls(), 1);
        assert_eq!(handler.bodies(), vec!["hello"]);
        assert_eq!(store.len("q").await.unwrap(), 0, "auto-delete purges the entry");
        let info = store.group_info("q", "workers").await.unwrap().unwrap();
        assert_eq!(info.pending, 0, "entry is acked");

        assert!(!b.consume(true, 0).await.unwrap(), "empty tick reports idle");
    }

    #[tokio::test]
    async fn publish_validates_queue_and_mode() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);
        let b = builder(store.clone(), handler.clone(), base_config(), EngineConfig::default());

        assert!(matches!(
            b.publish_to("other", "x", 0).await,
            Err(PublishError::InvalidQueue(_))
        ));
        assert!(matches!(
            b.publish_to("q", "x", 1000).await,
            Err(PublishError::InvalidPublish(_))
        ));

        let delayed = builder(
            store,
            handler,
            BuilderConfig {
                delayed: true,
                ..base_config()
            },
            EngineConfig::default(),
        );
        assert!(matches!(
            delayed.publish_to("q", "x", 0).await,
            Err(PublishError::InvalidPublish(_))
        ));
    }

    #[tokio::test]
    async fn publish_rejects_at_capacity() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);
        let b = builder(
            store.clone(),
            handler,
            BuilderConfig {
                queue_size: 2,
                ..base_config()
            },
            EngineConfig::default(),
        );

        assert!(b.publish_to("q", "a", 0).await.unwrap());
        assert!(b.publish_to("q", "b", 0).await.unwrap());
        assert!(!b.publish_to("q", "c", 0).await.unwrap(), "cap reached is a soft reject");
        assert_eq!(store.len("q").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delayed_entry_not_due_is_republished_unchanged() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);
        let b = builder(
            store.clone(),
            handler.clone(),
            BuilderConfig {
                delayed: true,
                ..base_config()
            },
            EngineConfig::default(),
        );

        assert!(b.publish_to("q", "later", 60_000).await.unwrap());
        let before = stored_envelopes(&store, "q").await;
        assert_eq!(before.len(), 1);

        assert!(b.consume(true, 0).await.unwrap());
        assert_eq!(handler.calls(), 0, "not-due message must not reach the handler");

        let after = stored_envelopes(&store, "q").await;
        assert_eq!(after.len(), 1, "original replaced by one republished copy");
        assert!(after[0].0 > before[0].0, "republished copy gets a fresh id");
        assert_eq!(
            after[0].1, before[0].1,
            "envelope unchanged: delay clock keeps counting from first publish"
        );
    }

    #[tokio::test]
    async fn handler_failure_republishes_with_incremented_count() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(1);
        let b = builder(
            store.clone(),
            handler.clone(),
            BuilderConfig {
                error_max_count: 3,
                ..base_config()
            },
            EngineConfig::default(),
        );

        assert!(b.publish_to("q", "flaky", 0).await.unwrap());
        assert!(b.consume(true, 0).await.unwrap());

        let retried = stored_envelopes(&store, "q").await;
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].1.retry_count, 1);
        assert_eq!(retried[0].1.last_error, "induced failure");

        assert!(b.consume(true, 0).await.unwrap());
        assert_eq!(handler.calls(), 2);
        assert_eq!(handler.bodies(), vec!["flaky"]);
        assert_eq!(store.len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retries_exhausted_lands_in_error_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(u32::MAX);
        let mut engine = EngineConfig::default();
        engine.fallback.path = Some(dir.path().to_path_buf());
        let b = builder(
            store.clone(),
            handler.clone(),
            BuilderConfig {
                error_max_count: 2,
                ..base_config()
            },
            engine,
        );

        assert!(b.publish_to("q", "doomed", 0).await.unwrap());
        assert!(b.consume(true, 0).await.unwrap(), "first failure republishes");
        assert!(b.consume(true, 0).await.unwrap(), "second failure dead-letters");
        assert!(!b.consume(true, 0).await.unwrap(), "nothing left to deliver");

        assert_eq!(handler.calls(), 2);
        assert_eq!(store.len("q").await.unwrap(), 0);

        let fb = b.fallback().expect("fallback configured");
        let dead = fb.oldest(Bucket::Error, 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1.queue, "q");
        let env = Envelope::from_json(&dead[0].1.data[FIELD_HEADER]).unwrap();
        assert_eq!(env.retry_count, 2);
        assert_eq!(env.last_error, "induced failure");
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_queues() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);
        let b = builder(
            store.clone(),
            handler,
            BuilderConfig {
                queue_size: 1,
                prefetch_count: 16,
                ..BuilderConfig::new("workers", vec!["a".to_string(), "b".to_string()])
            },
            EngineConfig::default(),
        );

        assert_eq!(b.publish("x", 0).await.unwrap(), 2);
        assert_eq!(store.len("a").await.unwrap(), 1);
        assert_eq!(store.len("b").await.unwrap(), 1);

        // Both queues full now: fan-out accepts nowhere, still no error.
        assert_eq!(b.publish("y", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn consume_without_del_keeps_acked_entries() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);
        let b = builder(store.clone(), handler.clone(), base_config(), EngineConfig::default());

        assert!(b.publish_to("q", "kept", 0).await.unwrap());
        assert!(b.consume(false, 0).await.unwrap());
        assert_eq!(handler.calls(), 1);
        assert_eq!(store.len("q").await.unwrap(), 1, "entry survives ack");
        let info = b.group_info("q").await.unwrap().unwrap();
        assert_eq!(info.pending, 0, "but it is acked");
    }

    #[tokio::test]
    async fn reclaim_requeues_stale_deliveries_without_fallback() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);
        let b = builder(
            store.clone(),
            handler.clone(),
            BuilderConfig {
                pending_timeout: 1,
                ..base_config()
            },
            EngineConfig::default(),
        );

        assert!(b.publish_to("q", "orphaned", 0).await.unwrap());

        // Another worker takes the delivery and dies before acking.
        let taken = store
            .read_group("workers", "workers-99", &["q".to_string()], 16, 0)
            .await
            .unwrap();
        assert_eq!(taken["q"].len(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(b.reclaim(true).await.unwrap(), 1);
        assert_eq!(handler.calls(), 0, "reclaim requeues, it does not dispatch");
        let info = store.group_info("q", "workers").await.unwrap().unwrap();
        assert_eq!(info.pending, 0, "stale delivery retired");
        assert_eq!(store.len("q").await.unwrap(), 1, "fresh copy back on the queue");

        assert!(b.consume(true, 0).await.unwrap());
        assert_eq!(handler.bodies(), vec!["orphaned"]);
    }

    #[tokio::test]
    async fn reclaim_with_fallback_requeues_and_clears_pending_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);
        let mut engine = EngineConfig::default();
        engine.fallback.path = Some(dir.path().to_path_buf());
        let b = builder(
            store.clone(),
            handler.clone(),
            BuilderConfig {
                pending_timeout: 1,
                ..base_config()
            },
            engine,
        );

        assert!(b.publish_to("q", "orphaned", 0).await.unwrap());
        store
            .read_group("workers", "workers-99", &["q".to_string()], 16, 0)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(b.reclaim(true).await.unwrap(), 1);
        assert_eq!(store.len("q").await.unwrap(), 1, "fresh copy back on the queue");
        let fb = b.fallback().unwrap();
        assert_eq!(
            fb.len(Bucket::Pending).unwrap(),
            0,
            "durable copy dropped once the requeue is confirmed"
        );

        assert!(b.consume(true, 0).await.unwrap());
        assert_eq!(handler.bodies(), vec!["orphaned"]);
    }

    #[tokio::test]
    async fn reclaim_keeps_pending_record_when_requeue_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlakyStore::new();
        let handler = TestHandler::new(0);
        let mut engine = EngineConfig::default();
        engine.fallback.path = Some(dir.path().to_path_buf());
        let b = Builder::new(
            BuilderConfig {
                pending_timeout: 1,
                ..base_config()
            },
            engine,
            store.clone(),
            handler.clone(),
            1,
        )
        .unwrap();

        assert!(b.publish_to("q", "orphaned", 0).await.unwrap());
        store
            .read_group("workers", "workers-99", &["q".to_string()], 16, 0)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.fail_appends.store(true, Ordering::SeqCst);
        assert_eq!(b.reclaim(true).await.unwrap(), 1, "claim succeeds despite the outage");
        assert_eq!(store.inner.len("q").await.unwrap(), 0);
        let fb = b.fallback().unwrap();
        assert_eq!(fb.len(Bucket::Pending).unwrap(), 1, "durable copy survives");

        store.fail_appends.store(false, Ordering::SeqCst);
        assert_eq!(b.replay().await.unwrap(), 1);
        assert_eq!(fb.len(Bucket::Pending).unwrap(), 0);
        assert!(b.consume(true, 0).await.unwrap());
        assert_eq!(handler.bodies(), vec!["orphaned"]);
    }

    #[tokio::test]
    async fn reclaim_disabled_without_pending_timeout() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);
        let b = builder(store.clone(), handler, base_config(), EngineConfig::default());
        assert!(b.publish_to("q", "x", 0).await.unwrap());
        store
            .read_group("workers", "workers-99", &["q".to_string()], 16, 0)
            .await
            .unwrap();
        assert_eq!(b.reclaim(true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ack_failure_blocks_and_retries_until_acked() {
        let store = FlakyStore::new();
        let handler = TestHandler::new(0);
        let mut engine = EngineConfig::default();
        engine.ack.retry_start_ms = 1;
        engine.ack.retry_cap_ms = 4;
        let b = Builder::new(base_config(), engine, store.clone(), handler.clone(), 1).unwrap();

        assert!(b.publish_to("q", "sticky", 0).await.unwrap());
        store.fail_acks.store(3, Ordering::SeqCst);

        assert!(b.consume(true, 0).await.unwrap(), "tick completes despite ack refusals");
        assert_eq!(store.fail_acks.load(Ordering::SeqCst), 0, "every refusal was retried");
        assert_eq!(handler.calls(), 1, "dispatch happens once, not per ack attempt");
        let info = store.inner.group_info("q", "workers").await.unwrap().unwrap();
        assert_eq!(info.pending, 0, "entry ends up acked");
        assert_eq!(store.inner.len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trim_purges_entries_behind_the_group() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);
        let b = builder(store.clone(), handler.clone(), base_config(), EngineConfig::default());

        for body in ["a", "b", "c"] {
            let keep = Envelope {
                auto_delete: false,
                ..Envelope::new(0)
            };
            assert!(b.publish_envelope("q", body, keep).await.unwrap());
        }
        assert!(b.consume(true, 0).await.unwrap());
        assert_eq!(handler.calls(), 3);
        assert_eq!(store.len("q").await.unwrap(), 3, "acked entries are kept");

        assert_eq!(b.trim("q").await.unwrap(), 2, "all but last-delivered removed");
        assert_eq!(store.len("q").await.unwrap(), 1);
        assert_eq!(b.trim("q").await.unwrap(), 0, "second pass is a no-op");
    }

    #[tokio::test]
    async fn broker_outage_parks_publish_then_replay_drains() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlakyStore::new();
        let handler = TestHandler::new(0);
        let mut engine = EngineConfig::default();
        engine.fallback.path = Some(dir.path().to_path_buf());
        let b = Builder::new(base_config(), engine, store.clone(), handler.clone(), 1).unwrap();

        store.fail_appends.store(true, Ordering::SeqCst);
        assert!(
            b.publish_to("q", "parked", 0).await.unwrap(),
            "outage publish is accepted into the fallback store"
        );
        assert_eq!(store.inner.len("q").await.unwrap(), 0);
        let fb = b.fallback().unwrap();
        assert_eq!(fb.len(Bucket::Requeue).unwrap(), 1);

        // Broker still down: nothing moves, nothing is lost.
        assert_eq!(b.replay().await.unwrap(), 0);
        assert_eq!(fb.len(Bucket::Requeue).unwrap(), 1);

        store.fail_appends.store(false, Ordering::SeqCst);
        assert_eq!(b.replay().await.unwrap(), 1);
        assert_eq!(fb.len(Bucket::Requeue).unwrap(), 0);

        assert!(b.consume(true, 0).await.unwrap());
        assert_eq!(handler.bodies(), vec!["parked"]);
    }

    #[tokio::test]
    async fn malformed_envelope_is_discarded() {
        let store = Arc::new(MemoryStreamStore::new());
        let handler = TestHandler::new(0);
        let b = builder(store.clone(), handler.clone(), base_config(), EngineConfig::default());

        // Make sure the group exists, then inject a corrupt entry directly.
        assert!(b.publish_to("q", "good", 0).await.unwrap());
        let mut bad = Fields::new();
        bad.insert(FIELD_HEADER.to_string(), "not json".to_string());
        bad.insert(FIELD_BODY.to_string(), "bad".to_string());
        store.append("q", "*", bad).await.unwrap();

        assert!(b.consume(true, 0).await.unwrap());
        assert_eq!(handler.bodies(), vec!["good"], "corrupt entry never dispatched");
        assert_eq!(store.len("q").await.unwrap(), 0, "corrupt entry purged");
        let info = store.group_info("q", "workers").await.unwrap().unwrap();
        assert_eq!(info.pending, 0);
    }
}

