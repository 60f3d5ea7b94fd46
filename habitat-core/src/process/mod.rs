//! Process supervisor: tracks declared processes and the external resources
//! their drivers created for them.

pub mod docker;
pub mod noop;
pub mod web;

pub use docker::DockerProcessDriver;
pub use noop::NoopProcessDriver;
pub use web::WebProcessDriver;

use crate::error::{HabitatError, Result};
use crate::node::state::{AppInstallation, DriverType, Process};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait ProcessDriver: Send + Sync {
    fn driver_type(&self) -> DriverType;

    /// Starts (or adopts) the external resource for `process` and returns its id.
    async fn start_process(&self, process: &Process, app: &AppInstallation) -> Result<String>;

    /// Stops the external resource. Already-gone resources are not an error.
    async fn stop_process(&self, ext_driver_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagedProcess {
    pub process: Process,
    pub ext_driver_id: String,
}

pub struct ProcessManager {
    drivers: HashMap<DriverType, Arc<dyn ProcessDriver>>,
    processes: RwLock<BTreeMap<String, ManagedProcess>>,
}

impl ProcessManager {
    pub fn new(drivers: Vec<Arc<dyn ProcessDriver>>) -> Self {
        let drivers = drivers
            .into_iter()
            .map(|driver| (driver.driver_type(), driver))
            .collect();
        Self {
            drivers,
            processes: RwLock::new(BTreeMap::new()),
        }
    }

    fn driver(&self, driver_type: DriverType) -> Result<Arc<dyn ProcessDriver>> {
        self.drivers.get(&driver_type).cloned().ok_or_else(|| {
            HabitatError::InvalidInput(format!("no process driver registered for {}", driver_type))
        })
    }

    /// Starts `process` with the driver of the app's package and tracks it.
    pub async fn start(&self, process: &Process, app: &AppInstallation) -> Result<String> {
        let driver = self.driver(app.package.driver)?;

        // Held across the driver call so two starts of one process cannot race.
        let mut processes = self.processes.write().await;
        if processes.contains_key(&process.id) {
            return Err(HabitatError::AlreadyExists(format!(
                "process {} is already running",
                process.id
            )));
        }

        let ext_driver_id = driver.start_process(process, app).await?;
        tracing::info!(
            "Started process {} of app {} with {} ({})",
            process.id,
            app.id,
            driver.driver_type(),
            ext_driver_id
        );
        processes.insert(
            process.id.clone(),
            ManagedProcess {
                process: process.clone(),
                ext_driver_id: ext_driver_id.clone(),
            },
        );
        Ok(ext_driver_id)
    }

    pub async fn stop(&self, process_id: &str) -> Result<()> {
        let mut processes = self.processes.write().await;
        let managed = processes
            .get(process_id)
            .ok_or_else(|| {
                HabitatError::NotFound(format!("process {} is not running", process_id))
            })?;

        let driver = self.driver(managed.process.driver)?;
        driver.stop_process(&managed.ext_driver_id).await?;
        processes.remove(process_id);
        tracing::info!("Stopped process {}", process_id);
        Ok(())
    }

    /// Stops an external resource recorded in state but not tracked here,
    /// e.g. one left behind by a previous run.
    pub async fn stop_untracked(&self, process: &Process) -> Result<()> {
        if self.processes.read().await.contains_key(&process.id) {
            return self.stop(&process.id).await;
        }
        match &process.ext_driver_id {
            Some(ext_driver_id) => self.driver(process.driver)?.stop_process(ext_driver_id).await,
            None => Ok(()),
        }
    }

    pub async fn get(&self, process_id: &str) -> Option<ManagedProcess> {
        self.processes.read().await.get(process_id).cloned()
    }

    pub async fn list(&self) -> Vec<ManagedProcess> {
        self.processes.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::state::{AppLifecycleState, Package, ProcessLifecycleState};
    use serde_json::Map;

    fn app(driver: DriverType) -> AppInstallation {
        AppInstallation {
            id: "app1".to_string(),
            user_id: "0".to_string(),
            name: "pds".to_string(),
            version: "1".to_string(),
            state: AppLifecycleState::Installed,
            package: Package {
                driver,
                driver_config: Map::new(),
                registry_url_base: "r.io".to_string(),
                registry_app_id: "pds".to_string(),
                registry_tag: "latest".to_string(),
            },
        }
    }

    fn process(id: &str, driver: DriverType) -> Process {
        Process {
            id: id.to_string(),
            app_id: "app1".to_string(),
            user_id: "0".to_string(),
            driver,
            created: "2024-01-01T00:00:00+00:00".to_string(),
            state: ProcessLifecycleState::Starting,
            ext_driver_id: None,
        }
    }

    #[tokio::test]
    async fn test_list_tracks_started_and_not_stopped() {
        let manager = ProcessManager::new(vec![
            Arc::new(NoopProcessDriver::default()),
            Arc::new(WebProcessDriver),
        ]);

        let ext = manager
            .start(&process("p1", DriverType::Noop), &app(DriverType::Noop))
            .await
            .unwrap();
        assert!(!ext.is_empty());
        let ext = manager
            .start(&process("p2", DriverType::Web), &app(DriverType::Web))
            .await
            .unwrap();
        assert_eq!(ext, "p2");

        let error = manager
            .start(&process("p1", DriverType::Noop), &app(DriverType::Noop))
            .await
            .unwrap_err();
        assert!(matches!(error, HabitatError::AlreadyExists(_)));

        manager.stop("p1").await.unwrap();
        let listed: Vec<String> = manager.list().await.into_iter().map(|m| m.process.id).collect();
        assert_eq!(listed, vec!["p2"]);
        assert!(manager.get("p1").await.is_none());

        let error = manager.stop("p1").await.unwrap_err();
        assert!(matches!(error, HabitatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_driver_rejected() {
        let manager = ProcessManager::new(vec![Arc::new(WebProcessDriver)]);
        let error = manager
            .start(&process("p1", DriverType::Docker), &app(DriverType::Docker))
            .await
            .unwrap_err();
        assert!(matches!(error, HabitatError::InvalidInput(_)));
        assert!(manager.list().await.is_empty());
    }
}
