//! Package installation keyed by driver type.

pub mod docker;
pub mod noop;
pub mod web;

pub use docker::DockerPackageManager;
pub use noop::NoopPackageManager;
pub use web::{WebPackageManager, extract_bundle};

use crate::error::{HabitatError, Result};
use crate::node::state::{DriverType, Package};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait PackageManager: Send + Sync {
    fn driver_type(&self) -> DriverType;

    async fn is_installed(&self, package: &Package, version: &str) -> Result<bool>;

    async fn install(&self, package: &Package, version: &str) -> Result<()>;

    async fn uninstall(&self, package: &Package, version: &str) -> Result<()>;
}

/// Package managers by driver type.
#[derive(Clone, Default)]
pub struct PackageManagers {
    managers: HashMap<DriverType, Arc<dyn PackageManager>>,
}

impl PackageManagers {
    pub fn new(managers: Vec<Arc<dyn PackageManager>>) -> Self {
        Self {
            managers: managers
                .into_iter()
                .map(|manager| (manager.driver_type(), manager))
                .collect(),
        }
    }

    pub fn get(&self, driver_type: DriverType) -> Result<Arc<dyn PackageManager>> {
        self.managers.get(&driver_type).cloned().ok_or_else(|| {
            HabitatError::InvalidInput(format!("no package manager registered for {}", driver_type))
        })
    }

    pub fn for_package(&self, package: &Package) -> Result<Arc<dyn PackageManager>> {
        self.get(package.driver)
    }
}
