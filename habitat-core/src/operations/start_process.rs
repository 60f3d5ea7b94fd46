use crate::controller::NodeController;
use crate::error::{HabitatError, Result};
use crate::node::state::ProcessLifecycleState;
use crate::node::transitions::ProcessStartTransition;

#[derive(Clone)]
pub struct StartProcessOperation {
    controller: NodeController,
}

#[derive(Debug, Clone)]
pub struct StartProcessOperationRequest {
    pub app_id: String,
    pub wait_until_running: bool,
}

#[derive(Debug, Clone)]
pub struct StartProcessOperationResult {
    pub process_id: String,
    pub ext_driver_id: Option<String>,
}

impl StartProcessOperation {
    pub fn new(controller: NodeController) -> Self {
        Self { controller }
    }

    pub async fn run(
        &self,
        request: StartProcessOperationRequest,
    ) -> Result<StartProcessOperationResult> {
        let app_id = request.app_id;
        let state = self
            .controller
            .propose(vec![Box::new(ProcessStartTransition::new(app_id.clone()))])
            .await?;
        let process_id = state
            .live_process_for_app(&app_id)
            .map(|process| process.id.clone())
            .ok_or_else(|| {
                HabitatError::Internal(format!("process for app {} missing after commit", app_id))
            })?;
        tracing::info!("Process {} of app {} declared", process_id, app_id);

        if !request.wait_until_running {
            return Ok(StartProcessOperationResult {
                process_id,
                ext_driver_id: None,
            });
        }

        self.controller
            .wait_for(|state| {
                Ok(state.process(&process_id)?.state == ProcessLifecycleState::Running)
            })
            .await?;
        let state = self.controller.node_state().await?;
        Ok(StartProcessOperationResult {
            ext_driver_id: state.process(&process_id)?.ext_driver_id.clone(),
            process_id,
        })
    }
}
