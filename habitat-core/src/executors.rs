//! Node reconciler: executors that drive packages and processes toward the
//! declared node state, and the restorer that rebuilds them after a restart.

use crate::controller::NodeController;
use crate::error::Result;
use crate::node::state::{AppLifecycleState, NodeState, ProcessLifecycleState, SCHEMA_NAME};
use crate::node::transitions::{
    FINISH_PROCESS_STOP, FinishAppUpgradeTransition, FinishInstallationTransition,
    FinishProcessStopTransition, PROCESS_START, PROCESS_STOP, ProcessRunningTransition,
    ProcessStartTransition, ProcessStopTransition, START_APP_UPGRADE, START_INSTALLATION,
    START_UNINSTALLATION, StartAppUpgradeTransition, StartInstallationTransition,
    StartUninstallationTransition,
};
use crate::package::PackageManagers;
use crate::process::ProcessManager;
use crate::reconciler::{Executor, Reconciler, ReconcilerBuilder, Restorer};
use async_trait::async_trait;
use habitat_meta::{StateUpdate, Transition};
use std::sync::Arc;

pub const NODE_RECONCILER: &str = "node";

/// Wires the node executors and restorer into one reconciler.
pub fn node_reconciler(
    controller: NodeController,
    packages: PackageManagers,
    processes: Arc<ProcessManager>,
) -> Result<Arc<Reconciler>> {
    let reconciler = ReconcilerBuilder::new(NODE_RECONCILER, SCHEMA_NAME)
        .executor(Arc::new(InstallAppExecutor {
            controller: controller.clone(),
            packages: packages.clone(),
        }))?
        .executor(Arc::new(UpgradeAppExecutor {
            controller: controller.clone(),
            packages: packages.clone(),
        }))?
        .executor(Arc::new(UninstallAppExecutor {
            packages: packages.clone(),
        }))?
        .executor(Arc::new(StartProcessExecutor {
            controller: controller.clone(),
            processes: processes.clone(),
        }))?
        .executor(Arc::new(StopProcessExecutor {
            controller: controller.clone(),
            processes: processes.clone(),
        }))?
        .restorer(Arc::new(NodeRestorer {
            controller,
            packages,
            processes,
        }))
        .build();
    Ok(reconciler)
}

fn update_state(update: &StateUpdate) -> Result<NodeState> {
    NodeState::from_bytes(&update.new_state)
}

pub struct InstallAppExecutor {
    controller: NodeController,
    packages: PackageManagers,
}

#[async_trait]
impl Executor for InstallAppExecutor {
    fn transition_type(&self) -> &str {
        START_INSTALLATION
    }

    async fn should_execute(&self, update: &StateUpdate) -> Result<bool> {
        let transition: StartInstallationTransition = update.decode_transition()?;
        let app = &transition.app;
        let manager = self.packages.for_package(&app.package)?;
        Ok(!manager.is_installed(&app.package, &app.version).await?)
    }

    async fn execute(&self, update: &StateUpdate) -> Result<()> {
        let transition: StartInstallationTransition = update.decode_transition()?;
        let app = &transition.app;
        tracing::info!("Installing app {} ({}) version {}", app.name, app.id, app.version);
        self.packages
            .for_package(&app.package)?
            .install(&app.package, &app.version)
            .await
    }

    async fn post_hook(&self, update: &StateUpdate) -> Result<()> {
        let transition: StartInstallationTransition = update.decode_transition()?;
        let app_id = transition.app.id;
        let current = self.controller.node_state().await?;
        if current.app(&app_id)?.state != AppLifecycleState::Installing {
            return Ok(());
        }
        self.controller
            .propose(vec![Box::new(FinishInstallationTransition { app_id })])
            .await?;
        Ok(())
    }
}

pub struct UpgradeAppExecutor {
    controller: NodeController,
    packages: PackageManagers,
}

#[async_trait]
impl Executor for UpgradeAppExecutor {
    fn transition_type(&self) -> &str {
        START_APP_UPGRADE
    }

    async fn should_execute(&self, update: &StateUpdate) -> Result<bool> {
        let transition: StartAppUpgradeTransition = update.decode_transition()?;
        let manager = self.packages.for_package(&transition.package)?;
        Ok(!manager.is_installed(&transition.package, &transition.version).await?)
    }

    async fn execute(&self, update: &StateUpdate) -> Result<()> {
        let transition: StartAppUpgradeTransition = update.decode_transition()?;
        tracing::info!(
            "Upgrading app {} to version {}",
            transition.app_id,
            transition.version
        );
        self.packages
            .for_package(&transition.package)?
            .install(&transition.package, &transition.version)
            .await
    }

    async fn post_hook(&self, update: &StateUpdate) -> Result<()> {
        let transition: StartAppUpgradeTransition = update.decode_transition()?;
        let current = self.controller.node_state().await?;
        if current.app(&transition.app_id)?.state != AppLifecycleState::Upgrading {
            return Ok(());
        }

        let mut batch: Vec<Box<dyn Transition>> = vec![Box::new(FinishAppUpgradeTransition {
            app_id: transition.app_id.clone(),
        })];
        if transition.start_after_upgrade {
            batch.push(Box::new(ProcessStartTransition::new(transition.app_id)));
        }
        self.controller.propose(batch).await?;
        Ok(())
    }
}

pub struct UninstallAppExecutor {
    packages: PackageManagers,
}

#[async_trait]
impl Executor for UninstallAppExecutor {
    fn transition_type(&self) -> &str {
        START_UNINSTALLATION
    }

    async fn should_execute(&self, update: &StateUpdate) -> Result<bool> {
        let transition: StartUninstallationTransition = update.decode_transition()?;
        let state = update_state(update)?;
        let app = state.app(&transition.app_id)?;
        let manager = self.packages.for_package(&app.package)?;
        manager.is_installed(&app.package, &app.version).await
    }

    async fn execute(&self, update: &StateUpdate) -> Result<()> {
        let transition: StartUninstallationTransition = update.decode_transition()?;
        let state = update_state(update)?;
        let app = state.app(&transition.app_id)?;
        tracing::info!("Uninstalling app {} ({})", app.name, app.id);
        self.packages
            .for_package(&app.package)?
            .uninstall(&app.package, &app.version)
            .await
    }
}

pub struct StartProcessExecutor {
    controller: NodeController,
    processes: Arc<ProcessManager>,
}

#[async_trait]
impl Executor for StartProcessExecutor {
    fn transition_type(&self) -> &str {
        PROCESS_START
    }

    async fn should_execute(&self, update: &StateUpdate) -> Result<bool> {
        let transition: ProcessStartTransition = update.decode_transition()?;
        let Some(process) = transition.process else {
            return Ok(false);
        };
        let state = update_state(update)?;
        let declared = state
            .processes
            .get(&process.id)
            .is_some_and(|declared| declared.is_live());
        Ok(declared && self.processes.get(&process.id).await.is_none())
    }

    async fn execute(&self, update: &StateUpdate) -> Result<()> {
        let transition: ProcessStartTransition = update.decode_transition()?;
        let state = update_state(update)?;
        let process = state.process(&process_id(&transition)?)?;
        let app = state.app(&process.app_id)?;
        self.processes.start(process, app).await?;
        Ok(())
    }

    async fn post_hook(&self, update: &StateUpdate) -> Result<()> {
        let transition: ProcessStartTransition = update.decode_transition()?;
        let process_id = process_id(&transition)?;
        let Some(managed) = self.processes.get(&process_id).await else {
            return Ok(());
        };

        let current = self.controller.node_state().await?;
        let needs_update = current.processes.get(&process_id).is_some_and(|process| {
            process.state == ProcessLifecycleState::Starting
                || process.ext_driver_id.as_deref() != Some(managed.ext_driver_id.as_str())
        });
        if needs_update {
            self.controller
                .propose(vec![Box::new(ProcessRunningTransition {
                    process_id,
                    ext_driver_id: managed.ext_driver_id,
                })])
                .await?;
        }
        Ok(())
    }
}

fn process_id(transition: &ProcessStartTransition) -> Result<String> {
    transition
        .process
        .as_ref()
        .map(|process| process.id.clone())
        .ok_or_else(|| {
            crate::error::HabitatError::InvalidInput(format!(
                "{} for app {} carries no process",
                PROCESS_START, transition.app_id
            ))
        })
}

pub struct StopProcessExecutor {
    controller: NodeController,
    processes: Arc<ProcessManager>,
}

#[async_trait]
impl Executor for StopProcessExecutor {
    fn transition_type(&self) -> &str {
        PROCESS_STOP
    }

    async fn should_execute(&self, update: &StateUpdate) -> Result<bool> {
        let transition: ProcessStopTransition = update.decode_transition()?;
        Ok(self.processes.get(&transition.process_id).await.is_some())
    }

    async fn execute(&self, update: &StateUpdate) -> Result<()> {
        let transition: ProcessStopTransition = update.decode_transition()?;
        self.processes.stop(&transition.process_id).await
    }

    async fn post_hook(&self, update: &StateUpdate) -> Result<()> {
        let transition: ProcessStopTransition = update.decode_transition()?;
        let current = self.controller.node_state().await?;
        let stopped = current
            .processes
            .get(&transition.process_id)
            .is_some_and(|process| process.state == ProcessLifecycleState::Stopped);
        if stopped {
            tracing::debug!("Proposing {} for {}", FINISH_PROCESS_STOP, transition.process_id);
            self.controller
                .propose(vec![Box::new(FinishProcessStopTransition {
                    process_id: transition.process_id,
                })])
                .await?;
        }
        Ok(())
    }
}

/// Reinstalls missing packages, finishes interrupted lifecycle steps and
/// restarts declared processes.
pub struct NodeRestorer {
    controller: NodeController,
    packages: PackageManagers,
    processes: Arc<ProcessManager>,
}

impl NodeRestorer {
    async fn restore_app(&self, state: &NodeState, app_id: &str) -> Result<()> {
        let app = state.app(app_id)?;
        if app.state == AppLifecycleState::Uninstalled {
            return Ok(());
        }

        let manager = self.packages.for_package(&app.package)?;
        if !manager.is_installed(&app.package, &app.version).await? {
            tracing::info!("Reinstalling app {} version {}", app.name, app.version);
            manager.install(&app.package, &app.version).await?;
        }

        let completion: Option<Box<dyn Transition>> = match app.state {
            AppLifecycleState::Installing => Some(Box::new(FinishInstallationTransition {
                app_id: app.id.clone(),
            })),
            AppLifecycleState::Upgrading => Some(Box::new(FinishAppUpgradeTransition {
                app_id: app.id.clone(),
            })),
            _ => None,
        };
        if let Some(completion) = completion {
            self.controller.propose(vec![completion]).await?;
        }
        Ok(())
    }

    async fn restore_process(&self, state: &NodeState, process_id: &str) -> Result<()> {
        let process = state.process(process_id)?;
        if process.state == ProcessLifecycleState::Stopped {
            self.processes.stop_untracked(process).await?;
            self.controller
                .propose(vec![Box::new(FinishProcessStopTransition {
                    process_id: process.id.clone(),
                })])
                .await?;
            return Ok(());
        }

        let ext_driver_id = match self.processes.get(&process.id).await {
            Some(managed) => managed.ext_driver_id,
            None => {
                let app = state.app(&process.app_id)?;
                self.processes.start(process, app).await?
            }
        };

        if process.state == ProcessLifecycleState::Starting
            || process.ext_driver_id.as_deref() != Some(ext_driver_id.as_str())
        {
            self.controller
                .propose(vec![Box::new(ProcessRunningTransition {
                    process_id: process.id.clone(),
                    ext_driver_id,
                })])
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Restorer for NodeRestorer {
    async fn restore(&self, update: &StateUpdate) -> Result<()> {
        let state = update_state(update)?;

        for app_id in state.app_installations.keys() {
            if let Err(error) = self.restore_app(&state, app_id).await {
                tracing::warn!("Failed to restore app {}: {}", app_id, error);
            }
        }

        // Apps finished above may have changed state; processes only need the
        // declared records from the restored snapshot.
        for process_id in state.processes.keys() {
            if let Err(error) = self.restore_process(&state, process_id).await {
                tracing::warn!("Failed to restore process {}: {}", process_id, error);
            }
        }

        tracing::info!(
            "Restored {} apps and {} processes",
            state.app_installations.len(),
            state.processes.len()
        );
        Ok(())
    }
}
