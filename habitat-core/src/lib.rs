//! Habitat Core - node state and the reconcilers that act on it
//!
//! - the `node` schema, its transitions and migrations
//! - an idempotent executor framework fed by HDB state updates
//! - process drivers (docker, web, noop) and package managers
//! - node operations composed from transitions and waits

pub mod controller;
pub mod docker;
pub mod error;
pub mod executors;
pub mod node;
pub mod operations;
pub mod package;
pub mod process;
pub mod reconciler;
pub mod waiter;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub(crate) mod testing;

pub use controller::NodeController;
pub use docker::{ContainerSpec, DockerCli, PROCESS_LABEL, image_reference};
pub use error::{ErrorKind, HabitatError, Result};
pub use executors::{NODE_RECONCILER, NodeRestorer, node_reconciler};
pub use node::{
    AppInstallation, AppLifecycleState, DriverType, NodeSchema, NodeState, Package, Process,
    ProcessLifecycleState, ReverseProxyRule, ReverseProxyRuleType, User,
};
pub use package::{
    DockerPackageManager, NoopPackageManager, PackageManager, PackageManagers, WebPackageManager,
};
pub use process::{
    DockerProcessDriver, ManagedProcess, NoopProcessDriver, ProcessDriver, ProcessManager,
    WebProcessDriver,
};
pub use reconciler::{Executor, Reconciler, ReconcilerBuilder, Restorer};
pub use waiter::{DEFAULT_WAIT_TIMEOUT, Waiter};
