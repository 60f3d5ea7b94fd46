use crate::error::{HabitatError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const SCHEMA_NAME: &str = "node";
pub const NODE_DB_DEFAULT_NAME: &str = "node";
pub const ROOT_USER_ID: &str = "0";
pub const ROOT_USERNAME: &str = "root";
pub const CURRENT_VERSION: &str = "v0.0.4";

/// Declared state of one node. This is the document held by the `node` database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub certificate: String,
    pub schema_version: String,
    #[serde(default)]
    pub users: BTreeMap<String, User>,
    #[serde(default)]
    pub processes: BTreeMap<String, Process>,
    #[serde(default)]
    pub app_installations: BTreeMap<String, AppInstallation>,
    #[serde(default)]
    pub reverse_proxy_rules: BTreeMap<String, ReverseProxyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub certificate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atproto_did: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    Docker,
    Web,
    Noop,
}

impl DriverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverType::Docker => "docker",
            DriverType::Web => "web",
            DriverType::Noop => "noop",
        }
    }
}

impl std::fmt::Display for DriverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an app comes from and which driver runs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub driver: DriverType,
    #[serde(default)]
    pub driver_config: Map<String, Value>,
    #[serde(default)]
    pub registry_url_base: String,
    #[serde(default)]
    pub registry_app_id: String,
    #[serde(default)]
    pub registry_tag: String,
}

impl Package {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.driver_config.get(key).and_then(Value::as_str)
    }

    /// String list from `driver_config`, empty when absent.
    pub fn config_list(&self, key: &str) -> Vec<String> {
        self.driver_config
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppLifecycleState {
    Installing,
    Installed,
    Upgrading,
    Uninstalled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInstallation {
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub version: String,
    pub state: AppLifecycleState,
    pub package: Package,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessLifecycleState {
    Starting,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    pub app_id: String,
    pub user_id: String,
    pub driver: DriverType,
    pub created: String,
    pub state: ProcessLifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_driver_id: Option<String>,
}

impl Process {
    /// A process counts as live until it has been asked to stop.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            ProcessLifecycleState::Starting | ProcessLifecycleState::Running
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReverseProxyRuleType {
    Redirect,
    File,
    Embedded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseProxyRule {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub rule_type: ReverseProxyRuleType,
    pub matcher: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Routing precedence; lower positions are matched first.
    #[serde(default)]
    pub position: u64,
}

impl NodeState {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn user(&self, user_id: &str) -> Result<&User> {
        self.users
            .get(user_id)
            .ok_or_else(|| HabitatError::NotFound(format!("user {}", user_id)))
    }

    pub fn user_by_name(&self, username: &str) -> Option<&User> {
        self.users.values().find(|user| user.username == username)
    }

    pub fn app(&self, app_id: &str) -> Result<&AppInstallation> {
        self.app_installations
            .get(app_id)
            .ok_or_else(|| HabitatError::NotFound(format!("app installation {}", app_id)))
    }

    pub fn process(&self, process_id: &str) -> Result<&Process> {
        self.processes
            .get(process_id)
            .ok_or_else(|| HabitatError::NotFound(format!("process {}", process_id)))
    }

    pub fn live_process_for_app(&self, app_id: &str) -> Option<&Process> {
        self.processes
            .values()
            .find(|process| process.app_id == app_id && process.is_live())
    }

    /// Rules in routing order. Ties, as in documents written before
    /// positions existed, fall back to id order.
    pub fn ordered_rules(&self) -> Vec<&ReverseProxyRule> {
        let mut rules: Vec<&ReverseProxyRule> = self.reverse_proxy_rules.values().collect();
        rules.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        rules
    }

    pub fn rules_for_app<'a>(
        &'a self,
        app_id: &'a str,
    ) -> impl Iterator<Item = &'a ReverseProxyRule> {
        self.ordered_rules()
            .into_iter()
            .filter(move |rule| rule.app_id.as_deref() == Some(app_id))
    }

    /// Position for the next rule added to this document.
    pub fn next_rule_position(&self) -> u64 {
        self.reverse_proxy_rules
            .values()
            .map(|rule| rule.position + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Initial node document: root user only, no apps.
pub fn init_root_state(node_id: &str, name: &str, root_certificate: &str) -> NodeState {
    let mut users = BTreeMap::new();
    users.insert(
        ROOT_USER_ID.to_string(),
        User {
            id: ROOT_USER_ID.to_string(),
            username: ROOT_USERNAME.to_string(),
            certificate: root_certificate.to_string(),
            atproto_did: None,
        },
    );

    NodeState {
        node_id: node_id.to_string(),
        name: name.to_string(),
        certificate: String::new(),
        schema_version: CURRENT_VERSION.to_string(),
        users,
        processes: BTreeMap::new(),
        app_installations: BTreeMap::new(),
        reverse_proxy_rules: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_package_config_helpers() {
        let package: Package = serde_json::from_value(json!({
            "driver": "docker",
            "driver_config": {"env": ["A=1", 2, "B=2"], "download_url": "http://x"},
            "registry_url_base": "r.io",
            "registry_app_id": "pds",
            "registry_tag": "latest"
        }))
        .unwrap();

        assert_eq!(package.driver, DriverType::Docker);
        assert_eq!(package.config_list("env"), vec!["A=1", "B=2"]);
        assert!(package.config_list("mounts").is_empty());
        assert_eq!(package.config_str("download_url"), Some("http://x"));
    }

    #[test]
    fn test_root_state_lookups() {
        let state = init_root_state("abc", "n1", "");
        assert_eq!(state.user(ROOT_USER_ID).unwrap().username, ROOT_USERNAME);
        assert!(state.user_by_name("root").is_some());
        assert!(matches!(state.app("missing"), Err(HabitatError::NotFound(_))));

        let bytes = serde_json::to_vec(&state).unwrap();
        assert_eq!(NodeState::from_bytes(&bytes).unwrap(), state);
    }

    #[test]
    fn test_rules_ordered_by_position() {
        let mut state = init_root_state("abc", "n1", "");
        assert_eq!(state.next_rule_position(), 0);
        for (id, position) in [("zz", 0), ("aa", 1), ("mm", 1)] {
            state.reverse_proxy_rules.insert(
                id.to_string(),
                ReverseProxyRule {
                    id: id.to_string(),
                    rule_type: ReverseProxyRuleType::Redirect,
                    matcher: format!("/{}", id),
                    target: "http://localhost".to_string(),
                    app_id: Some("app1".to_string()),
                    position,
                },
            );
        }

        let ids: Vec<&str> = state.ordered_rules().iter().map(|rule| rule.id.as_str()).collect();
        assert_eq!(ids, vec!["zz", "aa", "mm"]);
        let app_ids: Vec<&str> = state.rules_for_app("app1").map(|rule| rule.id.as_str()).collect();
        assert_eq!(app_ids, ids);
        assert_eq!(state.next_rule_position(), 2);
    }
}
