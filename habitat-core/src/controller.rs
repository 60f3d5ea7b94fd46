use crate::error::Result;
use crate::node::state::{NODE_DB_DEFAULT_NAME, NodeState, SCHEMA_NAME};
use crate::node::transitions::InitializeTransition;
use crate::waiter::Waiter;
use habitat_meta::{Database, DatabaseManager, Transition};
use std::sync::Arc;

/// Typed access to the node database for operations and executors.
#[derive(Clone)]
pub struct NodeController {
    manager: Arc<DatabaseManager>,
    waiter: Waiter,
    database_name: String,
}

impl NodeController {
    pub fn new(manager: Arc<DatabaseManager>, waiter: Waiter) -> Self {
        Self {
            manager,
            waiter,
            database_name: NODE_DB_DEFAULT_NAME.to_string(),
        }
    }

    pub fn manager(&self) -> Arc<DatabaseManager> {
        self.manager.clone()
    }

    pub async fn database(&self) -> Result<Arc<Database>> {
        Ok(self.manager.get_by_name(&self.database_name).await?)
    }

    pub async fn is_initialized(&self) -> bool {
        self.database().await.is_ok()
    }

    /// Creates the node database with `init_state` as its first commit.
    pub async fn initialize(&self, init_state: NodeState) -> Result<Arc<Database>> {
        let database = self
            .manager
            .create_database(
                &self.database_name,
                SCHEMA_NAME,
                vec![Box::new(InitializeTransition { init_state })],
            )
            .await?;
        tracing::info!("Initialized node database {}", database.id());
        Ok(database)
    }

    pub async fn node_state(&self) -> Result<NodeState> {
        Ok(self.database().await?.unmarshal()?)
    }

    /// Commits `transitions` as one batch and waits until the canonical state
    /// includes it. Returns the state right after the batch.
    pub async fn propose(&self, transitions: Vec<Box<dyn Transition>>) -> Result<NodeState> {
        let database = self.database().await?;
        let next = database.propose_transitions(transitions).await?;
        database.wait_applied(database.committed_index()).await?;
        Ok(next.unmarshal()?)
    }

    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<()>
    where
        F: FnMut(&NodeState) -> Result<bool>,
    {
        let database = self.database().await?;
        self.waiter
            .wait(&database, |bytes| predicate(&NodeState::from_bytes(bytes)?))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HabitatError;
    use crate::node::state::{ROOT_USERNAME, User, init_root_state};
    use crate::node::transitions::AddUserTransition;
    use crate::testing::node_manager;
    use std::time::Duration;

    fn add_user(username: &str) -> Box<dyn Transition> {
        Box::new(AddUserTransition {
            user: User {
                id: String::new(),
                username: username.to_string(),
                certificate: String::new(),
                atproto_did: None,
            },
        })
    }

    #[tokio::test]
    async fn test_initialize_and_add_user() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (manager, publisher) = node_manager(temp_dir.path());
        let controller = NodeController::new(manager, Waiter::new(publisher));
        assert!(!controller.is_initialized().await);

        controller.initialize(init_root_state("abc", "n1", "")).await.unwrap();
        let state = controller.propose(vec![add_user("alice")]).await.unwrap();
        let alice = state.user_by_name("alice").unwrap();
        let current = controller.node_state().await.unwrap();
        assert_eq!(current.user(&alice.id).unwrap().username, "alice");
        assert!(current.user_by_name(ROOT_USERNAME).is_some());

        let error = controller.propose(vec![add_user("alice")]).await.unwrap_err();
        assert!(matches!(error, HabitatError::Hdb(habitat_meta::HdbError::Conflict(_))));

        let error = controller.initialize(init_root_state("abc", "n1", "")).await.unwrap_err();
        assert!(matches!(error, HabitatError::Hdb(habitat_meta::HdbError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_wait_for_sees_later_commit() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (manager, publisher) = node_manager(temp_dir.path());
        let controller = NodeController::new(manager, Waiter::new(publisher.clone()));
        controller.initialize(init_root_state("abc", "n1", "")).await.unwrap();

        let proposer = controller.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            proposer.propose(vec![add_user("bob")]).await.unwrap();
        });

        controller
            .wait_for(|state| Ok(state.user_by_name("bob").is_some()))
            .await
            .unwrap();
        handle.await.unwrap();

        // the waiter's subscription is gone once it returns
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_times_out_and_propagates_errors() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (manager, publisher) = node_manager(temp_dir.path());
        let controller = NodeController::new(
            manager,
            Waiter::with_timeout(publisher.clone(), Duration::from_millis(100)),
        );
        controller.initialize(init_root_state("abc", "n1", "")).await.unwrap();

        let error = controller.wait_for(|_| Ok(false)).await.unwrap_err();
        assert!(matches!(error, HabitatError::Timeout(_)));

        let error = controller
            .wait_for(|_| Err(HabitatError::InvalidInput("bad predicate".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(error, HabitatError::InvalidInput(_)));
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
