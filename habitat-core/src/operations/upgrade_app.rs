use crate::controller::NodeController;
use crate::error::{HabitatError, Result};
use crate::node::state::{AppLifecycleState, NodeState, Package, ReverseProxyRule};
use crate::node::transitions::{
    ProcessStartTransition, ProcessStopTransition, StartAppUpgradeTransition,
};
use crate::operations::stop_process::is_stopped;

/// Moves an installed app to a new version.
///
/// The steps are separate commits: stop the running process, start the
/// upgrade, wait for the executor to finish it, start the process again.
#[derive(Clone)]
pub struct UpgradeAppOperation {
    controller: NodeController,
}

#[derive(Debug, Clone)]
pub struct UpgradeAppOperationRequest {
    pub app_id: String,
    pub version: String,
    pub package: Package,
    pub proxy_rules: Vec<ReverseProxyRule>,
}

#[derive(Debug, Clone)]
pub struct UpgradeAppOperationResult {
    pub previously_running: bool,
    pub stopped_process_id: Option<String>,
    pub new_process_id: Option<String>,
}

impl UpgradeAppOperation {
    pub fn new(controller: NodeController) -> Self {
        Self { controller }
    }

    pub async fn run(
        &self,
        request: UpgradeAppOperationRequest,
    ) -> Result<UpgradeAppOperationResult> {
        let UpgradeAppOperationRequest {
            app_id,
            version,
            package,
            proxy_rules,
        } = request;

        let state = self.controller.node_state().await?;
        let app = state.app(&app_id)?;
        if app.state != AppLifecycleState::Installed {
            return Err(HabitatError::PreconditionFailed(format!(
                "app {} is {:?}, not installed",
                app_id, app.state
            )));
        }

        let stopped_process_id = state
            .live_process_for_app(&app_id)
            .map(|process| process.id.clone());
        if let Some(process_id) = &stopped_process_id {
            tracing::info!("Stopping process {} before upgrading app {}", process_id, app_id);
            self.controller
                .propose(vec![Box::new(ProcessStopTransition {
                    process_id: process_id.clone(),
                })])
                .await?;
            self.controller
                .wait_for(|state| Ok(is_stopped(state, process_id)))
                .await?;
        }
        let previously_running = stopped_process_id.is_some();

        self.controller
            .propose(vec![Box::new(StartAppUpgradeTransition {
                app_id: app_id.clone(),
                version: version.clone(),
                package,
                new_proxy_rules: proxy_rules,
                start_after_upgrade: !previously_running,
            })])
            .await?;

        // The executor may finish before the first wait subscribes.
        self.controller
            .wait_for(|state| {
                let app = state.app(&app_id)?;
                Ok(app.state == AppLifecycleState::Upgrading || upgraded(state, &app_id, &version))
            })
            .await?;
        self.controller
            .wait_for(|state| Ok(upgraded(state, &app_id, &version)))
            .await?;
        tracing::info!("App {} upgraded to {}", app_id, version);

        let new_process_id = if previously_running {
            let state = self
                .controller
                .propose(vec![Box::new(ProcessStartTransition::new(app_id.clone()))])
                .await?;
            state
                .live_process_for_app(&app_id)
                .map(|process| process.id.clone())
        } else {
            None
        };

        Ok(UpgradeAppOperationResult {
            previously_running,
            stopped_process_id,
            new_process_id,
        })
    }
}

fn upgraded(state: &NodeState, app_id: &str, version: &str) -> bool {
    state
        .app_installations
        .get(app_id)
        .is_some_and(|app| app.state == AppLifecycleState::Installed && app.version == version)
}
