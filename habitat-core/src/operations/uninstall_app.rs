use crate::controller::NodeController;
use crate::error::Result;
use crate::node::transitions::{ProcessStopTransition, StartUninstallationTransition};
use crate::operations::stop_process::is_stopped;

#[derive(Clone)]
pub struct UninstallAppOperation {
    controller: NodeController,
}

#[derive(Debug, Clone)]
pub struct UninstallAppOperationRequest {
    pub app_id: String,
}

#[derive(Debug, Clone)]
pub struct UninstallAppOperationResult {
    pub stopped_process_id: Option<String>,
}

impl UninstallAppOperation {
    pub fn new(controller: NodeController) -> Self {
        Self { controller }
    }

    pub async fn run(
        &self,
        request: UninstallAppOperationRequest,
    ) -> Result<UninstallAppOperationResult> {
        let app_id = request.app_id;
        let state = self.controller.node_state().await?;
        state.app(&app_id)?;

        let stopped_process_id = state
            .live_process_for_app(&app_id)
            .map(|process| process.id.clone());
        if let Some(process_id) = &stopped_process_id {
            self.controller
                .propose(vec![Box::new(ProcessStopTransition {
                    process_id: process_id.clone(),
                })])
                .await?;
            self.controller
                .wait_for(|state| Ok(is_stopped(state, process_id)))
                .await?;
        }

        self.controller
            .propose(vec![Box::new(StartUninstallationTransition {
                app_id: app_id.clone(),
            })])
            .await?;
        tracing::info!("Uninstallation of app {} started", app_id);
        Ok(UninstallAppOperationResult { stopped_process_id })
    }
}
