use crate::error::Result;
use crate::node::state::{DriverType, Package};
use crate::package::PackageManager;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
pub struct NoopPackageManager {
    installed: Mutex<HashSet<(String, String)>>,
}

fn key(package: &Package, version: &str) -> (String, String) {
    (
        format!("{}/{}", package.registry_url_base, package.registry_app_id),
        version.to_string(),
    )
}

#[async_trait]
impl PackageManager for NoopPackageManager {
    fn driver_type(&self) -> DriverType {
        DriverType::Noop
    }

    async fn is_installed(&self, package: &Package, version: &str) -> Result<bool> {
        Ok(self
            .installed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&key(package, version)))
    }

    async fn install(&self, package: &Package, version: &str) -> Result<()> {
        self.installed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key(package, version));
        Ok(())
    }

    async fn uninstall(&self, package: &Package, version: &str) -> Result<()> {
        self.installed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key(package, version));
        Ok(())
    }
}
