use crate::docker::{ContainerSpec, DockerCli, image_reference};
use crate::error::Result;
use crate::node::state::{AppInstallation, DriverType, Process};
use crate::process::ProcessDriver;
use async_trait::async_trait;

/// Runs a process as a labelled docker container.
pub struct DockerProcessDriver {
    docker: DockerCli,
}

impl DockerProcessDriver {
    pub fn new(docker: DockerCli) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ProcessDriver for DockerProcessDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Docker
    }

    async fn start_process(&self, process: &Process, app: &AppInstallation) -> Result<String> {
        let container_id = match self.docker.find_container(&process.id).await? {
            Some(existing) => {
                tracing::info!("Adopting container {} for process {}", existing, process.id);
                existing
            }
            None => {
                let package = &app.package;
                let spec = ContainerSpec {
                    image: image_reference(
                        &package.registry_url_base,
                        &package.registry_app_id,
                        &package.registry_tag,
                    ),
                    process_id: process.id.clone(),
                    env: package.config_list("env"),
                    mounts: package.config_list("mounts"),
                    exposed_ports: package.config_list("exposed_ports"),
                };
                self.docker.create(&spec).await?
            }
        };

        if !self.docker.is_running(&container_id).await? {
            self.docker.start(&container_id).await?;
        }
        Ok(container_id)
    }

    async fn stop_process(&self, ext_driver_id: &str) -> Result<()> {
        self.docker.stop_and_remove(ext_driver_id).await
    }
}
