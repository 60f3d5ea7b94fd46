pub mod migrations;
pub mod schema;
pub mod state;
pub mod transitions;

pub use schema::NodeSchema;
pub use state::{
    AppInstallation, AppLifecycleState, CURRENT_VERSION, DriverType, NODE_DB_DEFAULT_NAME,
    NodeState, Package, Process, ProcessLifecycleState, ROOT_USER_ID, ROOT_USERNAME,
    ReverseProxyRule, ReverseProxyRuleType, SCHEMA_NAME, User, init_root_state,
};
