use crate::error::{HdbError, Result};
use crate::json_state::JsonState;
use crate::log_store::{
    KEY_CURRENT_TERM, KEY_VOTED_FOR, LOG_DB_FILE, LogEntry, LogStore, create_private_dir,
};
use crate::schema::Schema;
use crate::snapshot::{SNAPSHOT_DIR, SnapshotMeta, SnapshotStore};
use crate::transition::decode_batch;
use crate::update::StateUpdate;
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// State as of a committed log index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedState {
    pub index: u64,
    pub state: Vec<u8>,
}

/// Orders and commits batches for one database.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Commits a base64 batch payload. Returns once the entry is durable and applied.
    async fn dispatch(&self, payload: Vec<u8>) -> Result<CommittedState>;

    /// The commit stream. Can be taken once.
    fn take_update_stream(&self) -> Option<mpsc::UnboundedReceiver<StateUpdate>>;

    fn last_command_index(&self) -> u64;

    /// State the update stream starts from
    fn base_state(&self) -> CommittedState;

    /// Latest committed state
    fn committed_state(&self) -> CommittedState;

    async fn shutdown(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub commit_timeout: Duration,
    pub snapshot_threshold: u64,
    pub snapshot_retain: usize,
    pub trailing_logs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_secs(10),
            snapshot_threshold: 8192,
            snapshot_retain: 1000,
            trailing_logs: 10240,
        }
    }
}

struct LogInner {
    store: LogStore,
    snapshots: SnapshotStore,
    state: JsonState,
    last_index: u64,
    last_snapshot_index: u64,
}

/// Single-node log: a proposal is checked against the log head, appended,
/// committed and applied in one critical section. Every open starts a new
/// term recorded in the stable store.
pub struct LocalReplicator {
    database_id: String,
    schema_name: String,
    config: LogConfig,
    term: u64,
    restart_index: u64,
    base: CommittedState,
    inner: Mutex<LogInner>,
    head: RwLock<CommittedState>,
    last_index: AtomicU64,
    updates_tx: mpsc::UnboundedSender<StateUpdate>,
    updates_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<StateUpdate>>>,
    stopped: AtomicBool,
}

impl LocalReplicator {
    /// Opens (or creates) the log under `path`, installs the newest snapshot
    /// and queues the replay of every later entry on the update stream.
    pub fn open(
        path: impl AsRef<Path>,
        database_id: &str,
        schema: Arc<dyn Schema>,
        config: LogConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        create_private_dir(path)?;

        let store = LogStore::open(path.join(LOG_DB_FILE))?;
        let snapshots = SnapshotStore::new(path.join(SNAPSHOT_DIR), config.snapshot_retain)?;

        let term = store.get_stable_u64(KEY_CURRENT_TERM)?.unwrap_or(0) + 1;
        store.set_stable_u64(KEY_CURRENT_TERM, term)?;
        store.set_stable(KEY_VOTED_FOR, database_id)?;

        let validator = schema.validator();
        let (base_index, mut state) = match snapshots.latest()? {
            Some((meta, bytes)) => {
                tracing::info!(
                    "Installing snapshot at index {} for database {}",
                    meta.index,
                    database_id
                );
                (meta.index, JsonState::new(validator, &bytes)?)
            }
            None => (0, JsonState::new(validator, &schema.empty_state()?)?),
        };
        let base = CommittedState {
            index: base_index,
            state: state.bytes().to_vec(),
        };

        let entries = store.entries_after(base_index)?;
        if let Some(first) = entries.first() {
            if first.index != base_index + 1 {
                return Err(HdbError::LogIo(format!(
                    "log for database {} starts at {} but the newest snapshot ends at {}",
                    database_id, first.index, base_index
                )));
            }
        }
        let restart_index = entries.last().map(|entry| entry.index).unwrap_or(base_index);

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let schema_name = schema.name().to_string();
        for entry in &entries {
            let updates = apply_entry(&mut state, entry, &schema_name, database_id, restart_index)
                .map_err(|error| {
                    HdbError::LogIo(format!(
                        "failed to replay entry {} of database {}: {}",
                        entry.index, database_id, error
                    ))
                })?;
            for update in updates {
                let _ = updates_tx.send(update);
            }
        }

        if !entries.is_empty() {
            tracing::info!(
                "Replayed {} log entries for database {} (term {})",
                entries.len(),
                database_id,
                term
            );
        }

        let head = CommittedState {
            index: restart_index,
            state: state.bytes().to_vec(),
        };

        Ok(Self {
            database_id: database_id.to_string(),
            schema_name,
            config,
            term,
            restart_index,
            base,
            inner: Mutex::new(LogInner {
                store,
                snapshots,
                state,
                last_index: restart_index,
                last_snapshot_index: base_index,
            }),
            head: RwLock::new(head),
            last_index: AtomicU64::new(restart_index),
            updates_tx,
            updates_rx: std::sync::Mutex::new(Some(updates_rx)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    fn commit(&self, inner: &mut LogInner, payload: Vec<u8>) -> Result<CommittedState> {
        let entry = LogEntry {
            index: inner.last_index + 1,
            term: self.term,
            payload,
            appended_at: Utc::now(),
        };

        // Apply to a scratch copy first so a batch that does not fit the head
        // is rejected before it reaches the log.
        let mut next = inner.state.copy();
        let updates = apply_entry(
            &mut next,
            &entry,
            &self.schema_name,
            &self.database_id,
            self.restart_index,
        )?;

        inner.store.append(&entry)?;
        inner.state = next;
        inner.last_index = entry.index;
        self.last_index.store(entry.index, Ordering::SeqCst);

        let committed = CommittedState {
            index: entry.index,
            state: inner.state.bytes().to_vec(),
        };
        *self
            .head
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = committed.clone();

        for update in updates {
            if self.updates_tx.send(update).is_err() {
                tracing::debug!(
                    "Update stream for database {} is closed; dropping update",
                    self.database_id
                );
            }
        }

        if entry.index - inner.last_snapshot_index >= self.config.snapshot_threshold {
            if let Err(error) = self.snapshot(inner) {
                tracing::warn!(
                    "Failed to snapshot database {} at index {}: {}",
                    self.database_id,
                    entry.index,
                    error
                );
            }
        }

        Ok(committed)
    }

    fn snapshot(&self, inner: &mut LogInner) -> Result<()> {
        let meta = SnapshotMeta {
            term: self.term,
            index: inner.last_index,
            created_at: Utc::now(),
        };
        inner.snapshots.create(meta, inner.state.bytes())?;
        inner.last_snapshot_index = inner.last_index;

        if inner.last_index > self.config.trailing_logs {
            let removed = inner
                .store
                .compact_until(inner.last_index - self.config.trailing_logs)?;
            tracing::debug!(
                "Compacted {} log entries of database {}",
                removed,
                self.database_id
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Replicator for LocalReplicator {
    async fn dispatch(&self, payload: Vec<u8>) -> Result<CommittedState> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(HdbError::LogIo(format!(
                "log for database {} is shut down",
                self.database_id
            )));
        }

        let commit = async {
            let mut inner = self.inner.lock().await;
            self.commit(&mut inner, payload)
        };

        tokio::time::timeout(self.config.commit_timeout, commit)
            .await
            .map_err(|_| {
                HdbError::Timeout(format!(
                    "commit to database {} did not finish within {:?}",
                    self.database_id, self.config.commit_timeout
                ))
            })?
    }

    fn take_update_stream(&self) -> Option<mpsc::UnboundedReceiver<StateUpdate>> {
        self.updates_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn last_command_index(&self) -> u64 {
        self.last_index.load(Ordering::SeqCst)
    }

    fn base_state(&self) -> CommittedState {
        self.base.clone()
    }

    fn committed_state(&self) -> CommittedState {
        self.head
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn shutdown(&self) -> Result<()> {
        // Waits for an in-flight commit before refusing new ones.
        let _inner = self.inner.lock().await;
        self.stopped.store(true, Ordering::SeqCst);
        tracing::info!("Log for database {} shut down", self.database_id);
        Ok(())
    }
}

/// Applies every wrapper of `entry` to `state` in order, returning one update
/// per wrapper. On error `state` may hold a partial batch; callers pass a copy.
fn apply_entry(
    state: &mut JsonState,
    entry: &LogEntry,
    schema_name: &str,
    database_id: &str,
    restart_index: u64,
) -> Result<Vec<StateUpdate>> {
    let wrappers = decode_batch(&entry.payload)?;
    let batch_len = wrappers.len();

    let mut updates = Vec::with_capacity(batch_len);
    for (batch_offset, wrapper) in wrappers.into_iter().enumerate() {
        state.apply_patch(&wrapper.patch)?;
        updates.push(StateUpdate {
            schema_name: schema_name.to_string(),
            database_id: database_id.to_string(),
            new_state: state.bytes().to_vec(),
            transition_type: wrapper.transition_type,
            transition: wrapper.transition,
            log_index: entry.index,
            batch_offset,
            batch_len,
            is_restore: entry.index <= restart_index,
        });
    }
    Ok(updates)
}
