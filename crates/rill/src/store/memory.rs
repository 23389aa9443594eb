use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::envelope::now_millis;
use crate::error::{StoreError, StoreResult};
use crate::store::traits::{Fields, GroupInfo, StreamStore};
use crate::store::StreamId;

/// In-memory [`StreamStore`]. The reference backend for tests and
/// single-process deployments; all state lives behind one mutex, with a
/// [`Notify`] waking blocked group reads when an append lands.
#[derive(Default)]
pub struct MemoryStreamStore {
    inner: Mutex<HashMap<String, Stream>>,
    appended: Notify,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<StreamId, Fields>,
    last_id: StreamId,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingEntry>,
    consumers: HashSet<String>,
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn do_read(
        streams: &mut HashMap<String, Stream>,
        group: &str,
        consumer: &str,
        queues: &[String],
        count: usize,
    ) -> StoreResult<HashMap<String, Vec<(StreamId, Fields)>>> {
        let mut out = HashMap::new();
        for queue in queues {
            let stream = streams.get_mut(queue).ok_or_else(|| {
                StoreError::Transport(format!("no such stream: {queue}"))
            })?;
            let grp = stream.groups.get_mut(group).ok_or_else(|| {
                StoreError::Transport(format!("no group {group} on stream {queue}"))
            })?;
            grp.consumers.insert(consumer.to_string());

            let mut batch = Vec::new();
            for (&id, fields) in stream
                .entries
                .range(grp.last_delivered.next()..)
                .take(count)
            {
                batch.push((id, fields.clone()));
            }
            if let Some((last, _)) = batch.last() {
                grp.last_delivered = *last;
            }
            let now = Instant::now();
            for (id, _) in &batch {
                grp.pending.insert(
                    *id,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        delivery_count: 1,
                    },
                );
            }
            if !batch.is_empty() {
                out.insert(queue.clone(), batch);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn append(&self, queue: &str, id: &str, fields: Fields) -> StoreResult<StreamId> {
        let assigned = {
            let mut streams = self.inner.lock().unwrap();
            let stream = streams.entry(queue.to_string()).or_default();
            let assigned = if id == "*" {
                let ms = now_millis();
                if ms <= stream.last_id.ms {
                    stream.last_id.next()
                } else {
                    StreamId::new(ms, 0)
                }
            } else {
                let explicit: StreamId = id
                    .parse()
                    .map_err(|_| StoreError::Transport(format!("invalid entry id: {id}")))?;
                if !stream.entries.is_empty() && explicit <= stream.last_id {
                    return Err(StoreError::Transport(format!(
                        "entry id {explicit} is not above the stream top {}",
                        stream.last_id
                    )));
                }
                explicit
            };
            stream.entries.insert(assigned, fields);
            stream.last_id = assigned;
            assigned
        };
        self.appended.notify_one();
        Ok(assigned)
    }

    async fn create_group(
        &self,
        queue: &str,
        group: &str,
        start: StreamId,
        mkstream: bool,
    ) -> StoreResult<()> {
        let mut streams = self.inner.lock().unwrap();
        let stream = if mkstream {
            streams.entry(queue.to_string()).or_default()
        } else {
            streams
                .get_mut(queue)
                .ok_or_else(|| StoreError::Transport(format!("no such stream: {queue}")))?
        };
        stream.groups.entry(group.to_string()).or_insert_with(|| Group {
            last_delivered: start,
            ..Default::default()
        });
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        queues: &[String],
        count: usize,
        block_ms: u64,
    ) -> StoreResult<HashMap<String, Vec<(StreamId, Fields)>>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            // Register interest before checking, so an append racing with
            // the check leaves a stored permit instead of a lost wakeup.
            let notified = self.appended.notified();
            {
                let mut streams = self.inner.lock().unwrap();
                let batch = Self::do_read(&mut streams, group, consumer, queues, count)?;
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            let now = Instant::now();
            if block_ms == 0 || now >= deadline {
                return Ok(HashMap::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, queue: &str, group: &str, ids: &[StreamId]) -> StoreResult<u64> {
        let mut streams = self.inner.lock().unwrap();
        let Some(grp) = streams.get_mut(queue).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            if grp.pending.remove(id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
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
        let mut streams = self.inner.lock().unwrap();
        let stream = streams
            .get_mut(queue)
            .ok_or_else(|| StoreError::Transport(format!("no such stream: {queue}")))?;
        let grp = stream.groups.get_mut(group).ok_or_else(|| {
            StoreError::Transport(format!("no group {group} on stream {queue}"))
        })?;
        grp.consumers.insert(consumer.to_string());

        let min_idle = Duration::from_millis(min_idle_ms);
        let now = Instant::now();
        let candidates: Vec<StreamId> = grp.pending.range(start..).map(|(&id, _)| id).collect();

        let mut claimed = Vec::new();
        let mut cursor = StreamId::ZERO;
        for id in candidates {
            if claimed.len() >= count {
                cursor = id;
                break;
            }
            let Some(entry) = grp.pending.get_mut(&id) else {
                continue;
            };
            if now.duration_since(entry.delivered_at) < min_idle {
                continue;
            }
            match stream.entries.get(&id) {
                Some(fields) => {
                    entry.consumer = consumer.to_string();
                    entry.delivered_at = now;
                    entry.delivery_count += 1;
                    claimed.push((id, fields.clone()));
                }
                // Entry deleted from the log after delivery: drop the
                // dangling pending reference instead of returning it.
                None => {
                    grp.pending.remove(&id);
                }
            }
        }
        Ok((cursor, claimed))
    }

    async fn range(
        &self,
        queue: &str,
        start: StreamId,
        end: StreamId,
        count: usize,
    ) -> StoreResult<Vec<(StreamId, Fields)>> {
        let streams = self.inner.lock().unwrap();
        let Some(stream) = streams.get(queue) else {
            return Ok(Vec::new());
        };
        Ok(stream
            .entries
            .range(start..=end)
            .take(count)
            .map(|(&id, fields)| (id, fields.clone()))
            .collect())
    }

    async fn delete(&self, queue: &str, ids: &[StreamId]) -> StoreResult<u64> {
        let mut streams = self.inner.lock().unwrap();
        let Some(stream) = streams.get_mut(queue) else {
            return Ok(0);
        };
        let mut removed = 0;
        for id in ids {
            if stream.entries.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn len(&self, queue: &str) -> StoreResult<u64> {
        let streams = self.inner.lock().unwrap();
        Ok(streams
            .get(queue)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn group_info(&self, queue: &str, group: &str) -> StoreResult<Option<GroupInfo>> {
        let streams = self.inner.lock().unwrap();
        Ok(streams
            .get(queue)
            .and_then(|s| s.groups.get(group))
            .map(|g| GroupInfo {
                pending: g.pending.len() as u64,
                last_delivered: g.last_delivered,
                consumers: g.consumers.len() as u64,
            }))
    }
}
