use crate::docker::{DockerCli, image_reference};
use crate::error::Result;
use crate::node::state::{DriverType, Package};
use crate::package::PackageManager;
use async_trait::async_trait;

/// Installs docker apps by pulling their image.
pub struct DockerPackageManager {
    docker: DockerCli,
}

impl DockerPackageManager {
    pub fn new(docker: DockerCli) -> Self {
        Self { docker }
    }
}

fn image(package: &Package) -> String {
    image_reference(
        &package.registry_url_base,
        &package.registry_app_id,
        &package.registry_tag,
    )
}

#[async_trait]
impl PackageManager for DockerPackageManager {
    fn driver_type(&self) -> DriverType {
        DriverType::Docker
    }

    async fn is_installed(&self, package: &Package, _version: &str) -> Result<bool> {
        self.docker.image_exists(&image(package)).await
    }

    async fn install(&self, package: &Package, _version: &str) -> Result<()> {
        self.docker.pull(&image(package)).await
    }

    async fn uninstall(&self, package: &Package, _version: &str) -> Result<()> {
        self.docker.remove_image(&image(package)).await
    }
}
