use crate::error::{HdbError, Result};
use crate::json_state::{JsonState, StateValidator};
use crate::pubsub::Publisher;
use crate::replicator::Replicator;
use crate::schema::Schema;
use crate::transition::{Transition, encode_batch, prepare_batch};
use crate::update::StateUpdate;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

/// Owns a database's canonical state and its apply loop.
pub struct StateMachineController {
    database_id: String,
    schema_name: String,
    validator: Arc<StateValidator>,
    restart_index: u64,
    state: Arc<RwLock<JsonState>>,
    replicator: Arc<dyn Replicator>,
    propose_lock: Mutex<()>,
    applied: watch::Receiver<u64>,
    shutdown: watch::Sender<bool>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct ApplyLoop {
    database_id: String,
    schema_name: String,
    validator: Arc<StateValidator>,
    restart_index: u64,
    emit_restore: bool,
    restored: bool,
    state: Arc<RwLock<JsonState>>,
    publisher: Arc<Publisher<StateUpdate>>,
    applied: watch::Sender<u64>,
}

impl StateMachineController {
    /// Starts the apply loop. With `emit_restore`, a synthetic restore update
    /// is published once everything up to the restart index has been applied.
    pub fn start(
        database_id: &str,
        schema: Arc<dyn Schema>,
        replicator: Arc<dyn Replicator>,
        publisher: Arc<Publisher<StateUpdate>>,
        emit_restore: bool,
    ) -> Result<Self> {
        let restart_index = replicator.last_command_index();
        let validator = schema.validator();
        let base = replicator.base_state();
        let state = Arc::new(RwLock::new(JsonState::new(validator.clone(), &base.state)?));

        let updates = replicator.take_update_stream().ok_or_else(|| {
            HdbError::Internal(format!(
                "update stream of database {} is already taken",
                database_id
            ))
        })?;

        let (applied_tx, applied_rx) = watch::channel(base.index);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let apply_loop = ApplyLoop {
            database_id: database_id.to_string(),
            schema_name: schema.name().to_string(),
            validator: validator.clone(),
            restart_index,
            emit_restore,
            restored: false,
            state: state.clone(),
            publisher,
            applied: applied_tx,
        };
        let listener = tokio::spawn(apply_loop.run(base.index, updates, shutdown_rx));

        tracing::debug!(
            "State machine for database {} started at restart index {}",
            database_id,
            restart_index
        );

        Ok(Self {
            database_id: database_id.to_string(),
            schema_name: schema.name().to_string(),
            validator,
            restart_index,
            state,
            replicator,
            propose_lock: Mutex::new(()),
            applied: applied_rx,
            shutdown: shutdown_tx,
            listener: std::sync::Mutex::new(Some(listener)),
        })
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn restart_index(&self) -> u64 {
        self.restart_index
    }

    /// Enriches, validates and patches `transitions` as one batch, commits it
    /// and returns the hypothetical post-batch state.
    ///
    /// Proposals are serialised and checked against the latest committed state,
    /// which may be ahead of the canonical state the apply loop has published.
    pub async fn propose_transitions(
        &self,
        mut transitions: Vec<Box<dyn Transition>>,
    ) -> Result<JsonState> {
        let _guard = self.propose_lock.lock().await;

        let head = self.replicator.committed_state();
        let base = JsonState::new(self.validator.clone(), &head.state)?;
        let (wrappers, hypothetical) = prepare_batch(&base, &mut transitions)?;

        let types: Vec<&str> = wrappers
            .iter()
            .map(|wrapper| wrapper.transition_type.as_str())
            .collect();
        tracing::debug!(
            "Proposing [{}] to database {}",
            types.join(", "),
            self.database_id
        );

        let payload = encode_batch(&wrappers)?;
        self.replicator.dispatch(payload).await?;
        Ok(hypothetical)
    }

    /// Canonical state bytes as last applied by the apply loop
    pub fn bytes(&self) -> Vec<u8> {
        self.state().bytes().to_vec()
    }

    pub fn state(&self) -> JsonState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .copy()
    }

    /// Waits until the apply loop has applied the entry at `index`.
    pub async fn wait_applied(&self, index: u64) -> Result<()> {
        let mut applied = self.applied.clone();
        applied
            .wait_for(|current| *current >= index)
            .await
            .map(|_| ())
            .map_err(|_| {
                HdbError::Internal(format!(
                    "apply loop of database {} stopped before index {}",
                    self.database_id, index
                ))
            })
    }

    pub fn committed_index(&self) -> u64 {
        self.replicator.last_command_index()
    }

    /// Stops the apply loop once every update already committed has been
    /// applied and published, then stops the log.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(listener) = listener {
            if let Err(error) = listener.await {
                tracing::warn!(
                    "Apply loop of database {} ended abnormally: {}",
                    self.database_id,
                    error
                );
            }
        }
        self.replicator.shutdown().await
    }
}

impl ApplyLoop {
    async fn run(
        mut self,
        base_index: u64,
        mut updates: mpsc::UnboundedReceiver<StateUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if base_index >= self.restart_index {
            self.publish_restore(base_index);
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    while let Ok(update) = updates.try_recv() {
                        self.apply(update);
                    }
                    break;
                }
                update = updates.recv() => match update {
                    Some(update) => self.apply(update),
                    None => break,
                },
            }
        }

        tracing::debug!("Apply loop of database {} stopped", self.database_id);
    }

    fn apply(&mut self, update: StateUpdate) {
        let next = match JsonState::new(self.validator.clone(), &update.new_state) {
            Ok(next) => next,
            Err(error) => {
                tracing::error!(
                    "Dropping update {} of database {}: {}",
                    update.log_index,
                    self.database_id,
                    error
                );
                return;
            }
        };
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;

        if update.log_index > self.restart_index {
            self.publisher.publish(&update);
        } else if update.log_index == self.restart_index && update.is_last_in_batch() {
            self.publish_restore(update.log_index);
        }

        if update.is_last_in_batch() {
            self.applied.send_replace(update.log_index);
        }
    }

    fn publish_restore(&mut self, index: u64) {
        if !self.emit_restore || self.restored {
            return;
        }
        self.restored = true;

        let state = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .bytes()
            .to_vec();
        tracing::info!(
            "Publishing restore event for database {} at index {}",
            self.database_id,
            index
        );
        self.publisher.publish(&StateUpdate::restore(
            self.schema_name.clone(),
            self.database_id.clone(),
            state,
            index,
        ));
    }
}
