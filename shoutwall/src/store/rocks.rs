//! RocksDB-backed message log.
//!
//! Layout: a single `messages` column family keyed by the message id as
//! big-endian bytes, so lexicographic key order is id order and the most
//! recent window is one reverse scan from the end. Values are bincode
//! records.
//!
//! Writes go through `WriteOptions::set_sync`, on by default: an append is
//! fsynced before it returns, which is what lets the pipeline broadcast a
//! message the moment `append` succeeds. Tests turn sync off.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteOptions,
};
use std::path::PathBuf;
use std::sync::Mutex;

use super::{now_millis, MessageLog, StoreError, StoredMessage};
use crate::protocol::{Country, Message};

const CF_MESSAGES: &str = "messages";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync every append before acknowledging (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 8MB — records are tiny)
    pub write_buffer_size: usize,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }

    /// Config for testing (no fsync, small buffers).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Serialized writer state: the log is the single point of total order.
struct WriterState {
    next_id: u64,
    last_created_at: u64,
}

/// Persistent message log.
pub struct RocksLog {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    state: Mutex<WriterState>,
}

impl RocksLog {
    /// Open (or create) the log at the configured path.
    ///
    /// Recovers the id counter and clock floor from the last record, so
    /// ids keep increasing across restarts and are never reused.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(config.write_buffer_size);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_MESSAGES, cf_opts)],
        )?;

        let state = Self::recover_head(&db)?;
        log::info!(
            "message log opened at {:?}, next id {}",
            config.path,
            state.next_id
        );

        Ok(Self {
            db,
            config,
            state: Mutex::new(state),
        })
    }

    /// Read the last record to restore `next_id` and the clock floor.
    fn recover_head(db: &DBWithThreadMode<SingleThreaded>) -> Result<WriterState, StoreError> {
        let cf = db
            .cf_handle(CF_MESSAGES)
            .ok_or_else(|| StoreError::DatabaseError("missing messages column family".into()))?;

        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, value))) => {
                if key.len() < 8 {
                    return Err(StoreError::DeserializationError(format!(
                        "message key of length {}",
                        key.len()
                    )));
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[..8]);
                let last_id = u64::from_be_bytes(buf);
                let record = StoredMessage::decode(&value)?;
                Ok(WriterState {
                    next_id: last_id + 1,
                    last_created_at: record.created_at,
                })
            }
            Some(Err(e)) => Err(StoreError::DatabaseError(e.to_string())),
            None => Ok(WriterState {
                next_id: 1,
                last_created_at: 0,
            }),
        }
    }

    fn cf(&self) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_MESSAGES)
            .ok_or_else(|| StoreError::DatabaseError("missing messages column family".into()))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WriterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MessageLog for RocksLog {
    fn append(&self, text: &str, country: Option<Country>) -> Result<Message, StoreError> {
        let cf = self.cf()?;
        let mut state = self.lock_state();

        let id = state.next_id;
        let created_at = now_millis().max(state.last_created_at);

        let record = StoredMessage {
            id,
            created_at,
            text: text.to_string(),
            country,
        };
        let encoded = record.encode()?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(&cf, id.to_be_bytes(), &encoded, &write_opts)?;

        // Advance only once the write is down; a failed append leaves the
        // id unassigned rather than burning it.
        state.next_id = id + 1;
        state.last_created_at = created_at;

        Ok(record.into_message())
    }

    fn recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let cf = self.cf()?;

        // Reverse scan from the newest key, then flip to ascending.
        let mut window = Vec::with_capacity(limit.min(512));
        for item in self.db.iterator_cf(&cf, IteratorMode::End) {
            let (_key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            window.push(StoredMessage::decode(&value)?.into_message());
            if window.len() == limit {
                break;
            }
        }
        window.reverse();
        Ok(window)
    }

    fn len(&self) -> Result<u64, StoreError> {
        Ok(self.lock_state().next_id - 1)
    }
}
