use crate::error::Result;
use crate::node::state::{AppInstallation, DriverType, Process};
use crate::process::ProcessDriver;
use async_trait::async_trait;

/// Web bundles are served by the reverse proxy; there is nothing to run.
pub struct WebProcessDriver;

#[async_trait]
impl ProcessDriver for WebProcessDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Web
    }

    async fn start_process(&self, process: &Process, _app: &AppInstallation) -> Result<String> {
        Ok(process.id.clone())
    }

    async fn stop_process(&self, _ext_driver_id: &str) -> Result<()> {
        Ok(())
    }
}
