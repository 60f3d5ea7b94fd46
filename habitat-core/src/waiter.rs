use crate::error::{HabitatError, Result};
use habitat_meta::{Database, Publisher, StateUpdate, Subscriber, SubscriptionId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocks a caller until a predicate over one database's state holds.
#[derive(Clone)]
pub struct Waiter {
    publisher: Arc<Publisher<StateUpdate>>,
    timeout: Duration,
}

struct StateForwarder {
    database_id: String,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl Subscriber<StateUpdate> for StateForwarder {
    fn name(&self) -> &str {
        "waiter"
    }

    fn consume(&self, update: &StateUpdate) -> habitat_meta::Result<()> {
        if update.database_id == self.database_id {
            // The waiter may already have returned.
            let _ = self.sender.send(update.new_state.clone());
        }
        Ok(())
    }
}

struct Subscription {
    publisher: Arc<Publisher<StateUpdate>>,
    id: SubscriptionId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.publisher.remove_subscriber(self.id);
    }
}

impl Waiter {
    pub fn new(publisher: Arc<Publisher<StateUpdate>>) -> Self {
        Self::with_timeout(publisher, DEFAULT_WAIT_TIMEOUT)
    }

    pub fn with_timeout(publisher: Arc<Publisher<StateUpdate>>, timeout: Duration) -> Self {
        Self { publisher, timeout }
    }

    /// Returns once `predicate` accepts the database state, or its first error.
    ///
    /// The subscription is registered before the current state is checked so
    /// an update landing in between is not missed.
    pub async fn wait<F>(&self, database: &Database, mut predicate: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<bool>,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let forwarder = Arc::new(StateForwarder {
            database_id: database.id().to_string(),
            sender,
        });
        let _subscription = Subscription {
            publisher: self.publisher.clone(),
            id: self.publisher.add_subscriber(forwarder),
        };

        if predicate(&database.bytes())? {
            return Ok(());
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(state)) => {
                    if predicate(&state)? {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    return Err(HabitatError::Internal(
                        "state update stream closed while waiting".to_string(),
                    ));
                }
                Err(_) => {
                    return Err(HabitatError::Timeout(format!(
                        "condition on database {} not met within {:?}",
                        database.name(),
                        self.timeout
                    )));
                }
            }
        }
    }
}
