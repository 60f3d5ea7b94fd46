use crate::error::Result;
use crate::node::state::{AppInstallation, DriverType, Process};
use crate::process::ProcessDriver;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

/// Records started processes in memory without touching the host.
#[derive(Default)]
pub struct NoopProcessDriver {
    running: Mutex<HashSet<String>>,
}

impl NoopProcessDriver {
    pub fn is_running(&self, ext_driver_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(ext_driver_id)
    }
}

#[async_trait]
impl ProcessDriver for NoopProcessDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Noop
    }

    async fn start_process(&self, process: &Process, _app: &AppInstallation) -> Result<String> {
        let ext_driver_id = format!("noop-{}", process.id);
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(ext_driver_id.clone());
        Ok(ext_driver_id)
    }

    async fn stop_process(&self, ext_driver_id: &str) -> Result<()> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(ext_driver_id);
        Ok(())
    }
}
