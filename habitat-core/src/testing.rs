//! Shared fixtures for the node tests: an HDB manager over a temp dir and
//! fake drivers that stand in for docker.

use crate::controller::NodeController;
use crate::error::Result;
use crate::executors::node_reconciler;
use crate::node::schema::NodeSchema;
use crate::node::state::{AppInstallation, DriverType, Package, Process};
use crate::package::{PackageManager, PackageManagers};
use crate::process::{ProcessDriver, ProcessManager};
use crate::reconciler::Reconciler;
use crate::waiter::Waiter;
use async_trait::async_trait;
use habitat_meta::{
    DatabaseManager, LogConfig, Publisher, SchemaRegistry, StateUpdate, Subscriber,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub fn node_manager(path: &Path) -> (Arc<DatabaseManager>, Arc<Publisher<StateUpdate>>) {
    let mut schemas = SchemaRegistry::new();
    schemas.register(Arc::new(NodeSchema::new().unwrap())).unwrap();
    let publisher = Arc::new(Publisher::new());
    let manager = DatabaseManager::new(
        path.join("hdb"),
        schemas,
        publisher.clone(),
        LogConfig::default(),
    )
    .unwrap();
    (Arc::new(manager), publisher)
}

/// Docker stand-in: containers are keyed by process id, ids count up from `ctr-1`.
#[derive(Default)]
pub struct FakeDocker {
    containers: Mutex<HashMap<String, String>>,
    running: Mutex<HashSet<String>>,
    pub start_calls: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
}

impl FakeDocker {
    pub fn is_running(&self, ext_driver_id: &str) -> bool {
        self.running.lock().unwrap().contains(ext_driver_id)
    }
}

#[async_trait]
impl ProcessDriver for FakeDocker {
    fn driver_type(&self) -> DriverType {
        DriverType::Docker
    }

    async fn start_process(&self, process: &Process, _app: &AppInstallation) -> Result<String> {
        self.start_calls.lock().unwrap().push(process.id.clone());
        let mut containers = self.containers.lock().unwrap();
        let next = containers.len() + 1;
        let container = containers
            .entry(process.id.clone())
            .or_insert_with(|| format!("ctr-{}", next))
            .clone();
        self.running.lock().unwrap().insert(container.clone());
        Ok(container)
    }

    async fn stop_process(&self, ext_driver_id: &str) -> Result<()> {
        self.running.lock().unwrap().remove(ext_driver_id);
        self.stopped.lock().unwrap().push(ext_driver_id.to_string());
        Ok(())
    }
}

/// Package manager reporting a package installed only after `install`.
#[derive(Default)]
pub struct ScriptedPackages {
    installed: Mutex<HashSet<(String, String)>>,
    pub installs: Mutex<Vec<(String, String)>>,
}

fn package_key(package: &Package, version: &str) -> (String, String) {
    (
        format!("{}:{}", package.registry_app_id, package.registry_tag),
        version.to_string(),
    )
}

#[async_trait]
impl PackageManager for ScriptedPackages {
    fn driver_type(&self) -> DriverType {
        DriverType::Docker
    }

    async fn is_installed(&self, package: &Package, version: &str) -> Result<bool> {
        Ok(self.installed.lock().unwrap().contains(&package_key(package, version)))
    }

    async fn install(&self, package: &Package, version: &str) -> Result<()> {
        let key = package_key(package, version);
        self.installs.lock().unwrap().push(key.clone());
        self.installed.lock().unwrap().insert(key);
        Ok(())
    }

    async fn uninstall(&self, package: &Package, version: &str) -> Result<()> {
        self.installed.lock().unwrap().remove(&package_key(package, version));
        Ok(())
    }
}

/// Records every update the bus delivers.
#[derive(Default)]
pub struct Recorder {
    pub updates: Mutex<Vec<StateUpdate>>,
}

impl Recorder {
    pub fn transition_types(&self) -> Vec<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|update| update.transition_type.clone())
            .collect()
    }
}

impl Subscriber<StateUpdate> for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn consume(&self, update: &StateUpdate) -> habitat_meta::Result<()> {
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }
}

/// One node "process lifetime": manager, reconciler and in-memory state
/// over a persistent directory and a persistent fake outside world.
pub struct NodeHarness {
    pub manager: Arc<DatabaseManager>,
    pub controller: NodeController,
    pub reconciler: Arc<Reconciler>,
    pub processes: Arc<ProcessManager>,
    pub recorder: Arc<Recorder>,
}

impl NodeHarness {
    pub async fn open(
        path: &Path,
        docker: Arc<FakeDocker>,
        packages: Arc<ScriptedPackages>,
    ) -> Self {
        let (manager, publisher) = node_manager(path);
        let controller = NodeController::new(manager.clone(), Waiter::new(publisher.clone()));
        let processes = Arc::new(ProcessManager::new(vec![docker]));
        let reconciler = node_reconciler(
            controller.clone(),
            PackageManagers::new(vec![packages]),
            processes.clone(),
        )
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        publisher.add_subscriber(reconciler.clone());
        publisher.add_subscriber(recorder.clone());

        for database in manager.restart().await.unwrap() {
            database.wait_applied(database.committed_index()).await.unwrap();
        }

        Self {
            manager,
            controller,
            reconciler,
            processes,
            recorder,
        }
    }

    pub async fn settle(&self) {
        self.reconciler.wait_idle().await;
    }

    pub async fn close(self) {
        self.settle().await;
        self.manager.stop().await.unwrap();
    }
}
