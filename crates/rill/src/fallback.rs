use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded, Options};
use serde::{Deserialize, Serialize};

use crate::envelope::now_millis;
use crate::error::{FallbackError, FallbackResult};
use crate::store::Fields;

const CF_REQUEUE: &str = "requeue";
const CF_PENDING: &str = "pending";
const CF_ERROR: &str = "error";

/// All column family names (excluding `default` which RocksDB creates automatically).
const COLUMN_FAMILIES: &[&str] = &[CF_REQUEUE, CF_PENDING, CF_ERROR];

type DB = DBWithThreadMode<MultiThreaded>;

/// Which fallback bucket a record lands in.
///
/// `Requeue` holds appends the broker refused (fresh publishes and
/// consume-side republishes). `Pending` holds reclaimed entries awaiting
/// their requeue. Both are drained by the replay timer; `Error` holds
/// dead-lettered messages and is only ever drained by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Requeue,
    Pending,
    Error,
}

impl Bucket {
    fn cf_name(self) -> &'static str {
        match self {
            Bucket::Requeue => CF_REQUEUE,
            Bucket::Pending => CF_PENDING,
            Bucket::Error => CF_ERROR,
        }
    }
}

/// One locally persisted message: the target queue plus the complete stream
/// entry fields, so replay is a plain re-append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub queue: String,
    pub data: Fields,
    pub created_at: u64,
}

impl FallbackRecord {
    pub fn new(queue: impl Into<String>, data: Fields) -> Self {
        Self {
            queue: queue.into(),
            data,
            created_at: now_millis(),
        }
    }
}

/// RocksDB-backed local fallback store.
///
/// Keys are 8-byte big-endian auto-increment counters, so iteration order is
/// insertion order and oldest-first replay is a forward scan from the start.
pub struct FallbackStore {
    db: DB,
    next_key: AtomicU64,
}

impl FallbackStore {
    /// Open or create the fallback database at the given path with all
    /// column families. The key counter resumes above the highest key
    /// already present in any bucket.
    pub fn open(path: impl AsRef<Path>) -> FallbackResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Options::default();
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let mut max_key = 0u64;
        for name in COLUMN_FAMILIES {
            let cf = db
                .cf_handle(name)
                .ok_or_else(|| FallbackError::RocksDb(format!("column family not found: {name}")))?;
            if let Some(item) = db.iterator_cf(&cf, IteratorMode::End).next() {
                let (key, _) = item?;
                if let Some(key) = decode_key(&key) {
                    max_key = max_key.max(key);
                }
            }
        }

        Ok(Self {
            db,
            next_key: AtomicU64::new(max_key + 1),
        })
    }

    /// Persist a record into `bucket`, returning its key.
    pub fn insert(&self, bucket: Bucket, record: &FallbackRecord) -> FallbackResult<u64> {
        let name = bucket.cf_name();
        let cf = self
            .db
            .cf_handle(name)
            .ok_or_else(|| FallbackError::RocksDb(format!("column family not found: {name}")))?;
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let value = serde_json::to_vec(record)?;
        self.db.put_cf(&cf, encode_key(key), &value)?;
        Ok(key)
    }

    /// The oldest `limit` records in `bucket`, insertion order.
    pub fn oldest(&self, bucket: Bucket, limit: usize) -> FallbackResult<Vec<(u64, FallbackRecord)>> {
        let name = bucket.cf_name();
        let cf = self
            .db
            .cf_handle(name)
            .ok_or_else(|| FallbackError::RocksDb(format!("column family not found: {name}")))?;
        let mut results = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start).take(limit) {
            let (key, value) = item?;
            let key = decode_key(&key)
                .ok_or_else(|| FallbackError::RocksDb(format!("malformed key in {name}")))?;
            let record: FallbackRecord = serde_json::from_slice(&value)?;
            results.push((key, record));
        }
        Ok(results)
    }

    /// Remove a record; a no-op for an absent key.
    pub fn delete(&self, bucket: Bucket, key: u64) -> FallbackResult<()> {
        let name = bucket.cf_name();
        let cf = self
            .db
            .cf_handle(name)
            .ok_or_else(|| FallbackError::RocksDb(format!("column family not found: {name}")))?;
        self.db.delete_cf(&cf, encode_key(key))?;
        Ok(())
    }

    /// Record count in `bucket`.
    pub fn len(&self, bucket: Bucket) -> FallbackResult<u64> {
        let name = bucket.cf_name();
        let cf = self
            .db
            .cf_handle(name)
            .ok_or_else(|| FallbackError::RocksDb(format!("column family not found: {name}")))?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

/// Encode a key as 8 big-endian bytes for correct lexicographic ordering.
fn encode_key(key: u64) -> [u8; 8] {
    key.to_be_bytes()
}

fn decode_key(bytes: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (FallbackStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FallbackStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn test_record(queue: &str, body: &str) -> FallbackRecord {
        let mut data = Fields::new();
        data.insert("_body".to_string(), body.to_string());
        FallbackRecord::new(queue, data)
    }

    #[test]
    fn open_creates_all_column_families() {
        let (store, _dir) = test_store();
        for cf_name in COLUMN_FAMILIES {
            assert!(
                store.db.cf_handle(cf_name).is_some(),
                "column family '{cf_name}' should exist"
            );
        }
    }

    #[test]
    fn insert_oldest_delete() {
        let (store, _dir) = test_store();
        let rec = test_record("orders", "a");

        let key = store.insert(Bucket::Requeue, &rec).unwrap();
        let found = store.oldest(Bucket::Requeue, 10).unwrap();
        assert_eq!(found, vec![(key, rec)]);

        store.delete(Bucket::Requeue, key).unwrap();
        assert!(store.oldest(Bucket::Requeue, 10).unwrap().is_empty());
        // Absent key deletes are fine
        store.delete(Bucket::Requeue, key).unwrap();
    }

    #[test]
    fn buckets_are_isolated() {
        let (store, _dir) = test_store();
        store.insert(Bucket::Requeue, &test_record("q", "a")).unwrap();
        store.insert(Bucket::Pending, &test_record("q", "b")).unwrap();
        store.insert(Bucket::Error, &test_record("q", "c")).unwrap();

        assert_eq!(store.len(Bucket::Requeue).unwrap(), 1);
        assert_eq!(store.len(Bucket::Pending).unwrap(), 1);
        assert_eq!(store.len(Bucket::Error).unwrap(), 1);
        assert_eq!(
            store.oldest(Bucket::Error, 10).unwrap()[0].1.data["_body"],
            "c"
        );
    }

    #[test]
    fn oldest_returns_insertion_order_and_respects_limit() {
        let (store, _dir) = test_store();
        for body in ["a", "b", "c", "d"] {
            store.insert(Bucket::Pending, &test_record("q", body)).unwrap();
        }
        let batch = store.oldest(Bucket::Pending, 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].1.data["_body"], "a");
        assert_eq!(batch[1].1.data["_body"], "b");
        assert!(batch[0].0 < batch[1].0, "keys follow insertion order");
    }

    #[test]
    fn reopen_preserves_records_and_key_counter() {
        let dir = tempfile::tempdir().unwrap();
        let last_key = {
            let store = FallbackStore::open(dir.path()).unwrap();
            store.insert(Bucket::Requeue, &test_record("q", "a")).unwrap();
            store.insert(Bucket::Error, &test_record("q", "b")).unwrap()
        };

        let store = FallbackStore::open(dir.path()).unwrap();
        assert_eq!(store.len(Bucket::Requeue).unwrap(), 1);
        assert_eq!(store.len(Bucket::Error).unwrap(), 1);
        let new_key = store.insert(Bucket::Requeue, &test_record("q", "c")).unwrap();
        assert!(
            new_key > last_key,
            "key counter must resume above persisted keys"
        );
    }
}
