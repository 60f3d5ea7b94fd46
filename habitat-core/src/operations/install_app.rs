use crate::controller::NodeController;
use crate::error::Result;
use crate::node::state::{AppInstallation, AppLifecycleState, Package, ReverseProxyRule};
use crate::node::transitions::StartInstallationTransition;
use ulid::Ulid;

#[derive(Clone)]
pub struct InstallAppOperation {
    controller: NodeController,
}

#[derive(Debug, Clone)]
pub struct InstallAppOperationRequest {
    pub user_id: String,
    pub name: String,
    pub version: String,
    pub package: Package,
    pub proxy_rules: Vec<ReverseProxyRule>,
    /// Block until the package manager has finished.
    pub wait_until_installed: bool,
}

#[derive(Debug, Clone)]
pub struct InstallAppOperationResult {
    pub app_id: String,
    pub state: AppLifecycleState,
}

impl InstallAppOperation {
    pub fn new(controller: NodeController) -> Self {
        Self { controller }
    }

    pub async fn run(
        &self,
        request: InstallAppOperationRequest,
    ) -> Result<InstallAppOperationResult> {
        let app_id = Ulid::new().to_string();
        let transition = StartInstallationTransition {
            app: AppInstallation {
                id: app_id.clone(),
                user_id: request.user_id,
                name: request.name,
                version: request.version,
                state: AppLifecycleState::Installing,
                package: request.package,
            },
            new_proxy_rules: request.proxy_rules,
        };
        self.controller.propose(vec![Box::new(transition)]).await?;
        tracing::info!("Installation of app {} started", app_id);

        if !request.wait_until_installed {
            return Ok(InstallAppOperationResult {
                app_id,
                state: AppLifecycleState::Installing,
            });
        }

        self.controller
            .wait_for(|state| Ok(state.app(&app_id)?.state == AppLifecycleState::Installed))
            .await?;
        Ok(InstallAppOperationResult {
            app_id,
            state: AppLifecycleState::Installed,
        })
    }
}
