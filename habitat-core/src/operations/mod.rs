pub mod add_user;
pub mod init_node;
pub mod install_app;
pub mod start_process;
pub mod stop_process;
pub mod uninstall_app;
pub mod upgrade_app;

pub use add_user::{AddUserOperation, AddUserOperationRequest, AddUserOperationResult};
pub use init_node::{InitNodeOperation, InitNodeOperationOutcome, InitNodeOperationRequest};
pub use install_app::{InstallAppOperation, InstallAppOperationRequest, InstallAppOperationResult};
pub use start_process::{
    StartProcessOperation, StartProcessOperationRequest, StartProcessOperationResult,
};
pub use stop_process::{StopProcessOperation, StopProcessOperationRequest};
pub use uninstall_app::{
    UninstallAppOperation, UninstallAppOperationRequest, UninstallAppOperationResult,
};
pub use upgrade_app::{UpgradeAppOperation, UpgradeAppOperationRequest, UpgradeAppOperationResult};

