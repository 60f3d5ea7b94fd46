use crate::controller::NodeController;
use crate::error::Result;
use crate::node::state::{NodeState, init_root_state};
use ulid::Ulid;

#[derive(Clone)]
pub struct InitNodeOperation {
    controller: NodeController,
}

#[derive(Debug, Clone, Default)]
pub struct InitNodeOperationRequest {
    pub node_id: Option<String>,
    pub name: String,
    pub root_user_certificate: String,
}

#[derive(Debug, Clone)]
pub enum InitNodeOperationOutcome {
    Initialized(NodeState),
    AlreadyInitialized(NodeState),
}

impl InitNodeOperation {
    pub fn new(controller: NodeController) -> Self {
        Self { controller }
    }

    /// Creates the node database unless it already exists.
    pub async fn run(&self, request: InitNodeOperationRequest) -> Result<InitNodeOperationOutcome> {
        if self.controller.is_initialized().await {
            let state = self.controller.node_state().await?;
            return Ok(InitNodeOperationOutcome::AlreadyInitialized(state));
        }

        let node_id = request
            .node_id
            .filter(|node_id| !node_id.is_empty())
            .unwrap_or_else(|| Ulid::new().to_string());
        let init_state = init_root_state(&node_id, &request.name, &request.root_user_certificate);
        let database = self.controller.initialize(init_state).await?;
        database.wait_applied(database.committed_index()).await?;

        tracing::info!("Node {} initialized", node_id);
        Ok(InitNodeOperationOutcome::Initialized(database.unmarshal()?))
    }
}
