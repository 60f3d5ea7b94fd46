//! Idempotent executors driven by committed state updates.
//!
//! A [`Reconciler`] subscribes to the HDB publisher and forwards matching
//! updates to a worker task of its own, so executors may propose follow-up
//! transitions without stalling the apply loop.

use crate::error::{HabitatError, Result};
use async_trait::async_trait;
use habitat_meta::{HdbError, StateUpdate, Subscriber};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Handles one transition type.
#[async_trait]
pub trait Executor: Send + Sync {
    fn transition_type(&self) -> &str;

    /// Returns false when the real world already matches `update`.
    async fn should_execute(&self, update: &StateUpdate) -> Result<bool>;

    async fn execute(&self, update: &StateUpdate) -> Result<()>;

    async fn post_hook(&self, _update: &StateUpdate) -> Result<()> {
        Ok(())
    }
}

/// Rebuilds in-memory collaborators from the post-replay state.
#[async_trait]
pub trait Restorer: Send + Sync {
    async fn restore(&self, update: &StateUpdate) -> Result<()>;
}

pub struct ReconcilerBuilder {
    name: String,
    schema_name: String,
    executors: HashMap<String, Arc<dyn Executor>>,
    restorer: Option<Arc<dyn Restorer>>,
}

impl ReconcilerBuilder {
    pub fn new(name: impl Into<String>, schema_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_name: schema_name.into(),
            executors: HashMap::new(),
            restorer: None,
        }
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Result<Self> {
        let transition_type = executor.transition_type().to_string();
        if self.executors.contains_key(&transition_type) {
            return Err(HabitatError::AlreadyExists(format!(
                "reconciler {} already has an executor for {}",
                self.name, transition_type
            )));
        }
        self.executors.insert(transition_type, executor);
        Ok(self)
    }

    pub fn restorer(mut self, restorer: Arc<dyn Restorer>) -> Self {
        self.restorer = Some(restorer);
        self
    }

    /// Spawns the worker task; must be called inside a tokio runtime.
    pub fn build(self) -> Arc<Reconciler> {
        let (queue, receiver) = mpsc::unbounded_channel();
        let (pending_tx, pending_rx) = watch::channel(0usize);
        let handled: HashSet<String> = self.executors.keys().cloned().collect();
        let has_restorer = self.restorer.is_some();

        let worker = Worker {
            name: self.name.clone(),
            executors: self.executors,
            restorer: self.restorer,
            pending: pending_tx.clone(),
        };
        tokio::spawn(worker.run(receiver));

        Arc::new(Reconciler {
            name: self.name,
            schema_name: self.schema_name,
            handled,
            has_restorer,
            queue,
            pending: pending_tx,
            idle: pending_rx,
        })
    }
}

pub struct Reconciler {
    name: String,
    schema_name: String,
    handled: HashSet<String>,
    has_restorer: bool,
    queue: mpsc::UnboundedSender<StateUpdate>,
    pending: watch::Sender<usize>,
    idle: watch::Receiver<usize>,
}

impl Reconciler {
    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    fn wants(&self, update: &StateUpdate) -> bool {
        if update.schema_name != self.schema_name {
            return false;
        }
        if update.is_restore {
            self.has_restorer
        } else {
            self.handled.contains(&update.transition_type)
        }
    }

    /// Waits until every queued update has been handled.
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.clone();
        let _ = idle.wait_for(|pending| *pending == 0).await;
    }
}

impl Subscriber<StateUpdate> for Reconciler {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, update: &StateUpdate) -> habitat_meta::Result<()> {
        if !self.wants(update) {
            return Ok(());
        }
        self.pending.send_modify(|pending| *pending += 1);
        self.queue.send(update.clone()).map_err(|_| {
            self.pending.send_modify(|pending| *pending = pending.saturating_sub(1));
            HdbError::Internal(format!("reconciler {} worker has stopped", self.name))
        })
    }
}

struct Worker {
    name: String,
    executors: HashMap<String, Arc<dyn Executor>>,
    restorer: Option<Arc<dyn Restorer>>,
    pending: watch::Sender<usize>,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<StateUpdate>) {
        while let Some(update) = receiver.recv().await {
            self.dispatch(&update).await;
            self.pending
                .send_modify(|pending| *pending = pending.saturating_sub(1));
        }
        tracing::debug!("Reconciler {} worker stopped", self.name);
    }

    async fn dispatch(&self, update: &StateUpdate) {
        if update.is_restore {
            if let Some(restorer) = &self.restorer {
                tracing::info!(
                    "Reconciler {} restoring database {} at index {}",
                    self.name,
                    update.database_id,
                    update.log_index
                );
                if let Err(error) = restorer.restore(update).await {
                    tracing::error!(
                        "Reconciler {} failed to restore database {}: {}",
                        self.name,
                        update.database_id,
                        error
                    );
                }
            }
            return;
        }

        let Some(executor) = self.executors.get(&update.transition_type) else {
            return;
        };

        match executor.should_execute(update).await {
            Ok(true) => {
                if let Err(error) = executor.execute(update).await {
                    tracing::warn!(
                        "Executor {} of {} failed at index {}: {}",
                        update.transition_type,
                        self.name,
                        update.log_index,
                        error
                    );
                    return;
                }
            }
            Ok(false) => {
                tracing::info!(
                    "Desired state achieved idempotently for {} at index {}",
                    update.transition_type,
                    update.log_index
                );
            }
            Err(error) => {
                tracing::warn!(
                    "Executor {} of {} could not inspect state at index {}: {}",
                    update.transition_type,
                    self.name,
                    update.log_index,
                    error
                );
                return;
            }
        }

        if let Err(error) = executor.post_hook(update).await {
            tracing::warn!(
                "Post hook of {} in {} failed at index {}: {}",
                update.transition_type,
                self.name,
                update.log_index,
                error
            );
        }
    }
}
