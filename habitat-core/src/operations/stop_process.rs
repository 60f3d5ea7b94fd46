use crate::controller::NodeController;
use crate::error::Result;
use crate::node::state::{NodeState, ProcessLifecycleState};
use crate::node::transitions::ProcessStopTransition;

#[derive(Clone)]
pub struct StopProcessOperation {
    controller: NodeController,
}

#[derive(Debug, Clone)]
pub struct StopProcessOperationRequest {
    pub process_id: String,
    pub wait_until_stopped: bool,
}

impl StopProcessOperation {
    pub fn new(controller: NodeController) -> Self {
        Self { controller }
    }

    pub async fn run(&self, request: StopProcessOperationRequest) -> Result<()> {
        let process_id = request.process_id;
        self.controller
            .propose(vec![Box::new(ProcessStopTransition {
                process_id: process_id.clone(),
            })])
            .await?;
        tracing::info!("Stop of process {} requested", process_id);

        if request.wait_until_stopped {
            self.controller
                .wait_for(|state| Ok(is_stopped(state, &process_id)))
                .await?;
        }
        Ok(())
    }
}

/// A process counts as stopped once marked so or already removed.
pub(crate) fn is_stopped(state: &NodeState, process_id: &str) -> bool {
    state
        .processes
        .get(process_id)
        .is_none_or(|process| process.state == ProcessLifecycleState::Stopped)
}
