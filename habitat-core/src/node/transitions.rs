//! Node state transitions.
//!
//! Every transition parses the old document into [`NodeState`], checks its
//! preconditions there, and emits an explicit RFC 6902 patch. Identifiers and
//! timestamps are assigned in `enrich` so replays reproduce them exactly.

use crate::node::state::{
    AppInstallation, AppLifecycleState, CURRENT_VERSION, NodeState, Package, Process,
    ProcessLifecycleState, ReverseProxyRule, User,
};
use chrono::Utc;
use habitat_meta::{HdbError, Result, Transition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use ulid::Ulid;

pub const INITIALIZE: &str = "initialize";
pub const ADD_USER: &str = "add_user";
pub const START_INSTALLATION: &str = "start_installation";
pub const FINISH_INSTALLATION: &str = "finish_installation";
pub const START_UNINSTALLATION: &str = "start_uninstallation";
pub const PROCESS_START: &str = "process_start";
pub const PROCESS_RUNNING: &str = "process_running";
pub const PROCESS_STOP: &str = "process_stop";
pub const FINISH_PROCESS_STOP: &str = "finish_process_stop";
pub const START_APP_UPGRADE: &str = "start_app_upgrade";
pub const FINISH_APP_UPGRADE: &str = "finish_app_upgrade";
pub const ADD_REVERSE_PROXY_RULE: &str = "add_reverse_proxy_rule";
pub const REMOVE_REVERSE_PROXY_RULE: &str = "remove_reverse_proxy_rule";

/// Rebuilds a node transition from its wire tag.
pub fn decode_node_transition(
    transition_type: &str,
    transition: &[u8],
) -> Result<Box<dyn Transition>> {
    let decoded = match transition_type {
        INITIALIZE => decode::<InitializeTransition>(transition)?,
        ADD_USER => decode::<AddUserTransition>(transition)?,
        START_INSTALLATION => decode::<StartInstallationTransition>(transition)?,
        FINISH_INSTALLATION => decode::<FinishInstallationTransition>(transition)?,
        START_UNINSTALLATION => decode::<StartUninstallationTransition>(transition)?,
        PROCESS_START => decode::<ProcessStartTransition>(transition)?,
        PROCESS_RUNNING => decode::<ProcessRunningTransition>(transition)?,
        PROCESS_STOP => decode::<ProcessStopTransition>(transition)?,
        FINISH_PROCESS_STOP => decode::<FinishProcessStopTransition>(transition)?,
        START_APP_UPGRADE => decode::<StartAppUpgradeTransition>(transition)?,
        FINISH_APP_UPGRADE => decode::<FinishAppUpgradeTransition>(transition)?,
        ADD_REVERSE_PROXY_RULE => decode::<AddReverseProxyRuleTransition>(transition)?,
        REMOVE_REVERSE_PROXY_RULE => decode::<RemoveReverseProxyRuleTransition>(transition)?,
        other => {
            return Err(HdbError::InvalidInput(format!("unknown node transition {}", other)));
        }
    };
    Ok(decoded)
}

fn decode<T>(transition: &[u8]) -> Result<Box<dyn Transition>>
where
    T: Transition + DeserializeOwned + 'static,
{
    Ok(Box::new(serde_json::from_slice::<T>(transition)?))
}

fn load(old_state: &[u8]) -> Result<NodeState> {
    Ok(serde_json::from_slice(old_state)?)
}

fn encode<T: Serialize>(transition: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(transition)?)
}

fn ops(operations: Vec<Value>) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&Value::Array(operations))?)
}

/// JSON pointer from raw path segments (RFC 6901 escaping).
fn pointer(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}

fn new_id() -> String {
    Ulid::new().to_string()
}

fn find_app<'a>(state: &'a NodeState, app_id: &str) -> Result<&'a AppInstallation> {
    state
        .app_installations
        .get(app_id)
        .ok_or_else(|| HdbError::NotFound(format!("app installation {}", app_id)))
}

fn find_process<'a>(state: &'a NodeState, process_id: &str) -> Result<&'a Process> {
    state
        .processes
        .get(process_id)
        .ok_or_else(|| HdbError::NotFound(format!("process {}", process_id)))
}

fn require_non_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(HdbError::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Checks new rules against existing ones (ignoring rules owned by
/// `replacing_app`) and against each other.
fn check_new_rules(
    state: &NodeState,
    rules: &[ReverseProxyRule],
    replacing_app: Option<&str>,
) -> Result<()> {
    let kept: Vec<&ReverseProxyRule> = state
        .reverse_proxy_rules
        .values()
        .filter(|rule| replacing_app.is_none() || rule.app_id.as_deref() != replacing_app)
        .collect();

    for (position, rule) in rules.iter().enumerate() {
        require_non_empty(&rule.id, "rule id")?;
        require_non_empty(&rule.matcher, "rule matcher")?;
        let earlier = &rules[..position];
        if kept.iter().any(|existing| existing.id == rule.id)
            || earlier.iter().any(|other| other.id == rule.id)
        {
            return Err(HdbError::Conflict(format!(
                "reverse proxy rule {} already exists",
                rule.id
            )));
        }
        if kept.iter().any(|existing| existing.matcher == rule.matcher)
            || earlier.iter().any(|other| other.matcher == rule.matcher)
        {
            return Err(HdbError::Conflict(format!(
                "matcher {} is already used by another rule",
                rule.matcher
            )));
        }
    }
    Ok(())
}

fn check_registry_unique(
    state: &NodeState,
    user_id: &str,
    package: &Package,
    except_app: Option<&str>,
) -> Result<()> {
    let duplicate = state.app_installations.values().any(|app| {
        Some(app.id.as_str()) != except_app
            && app.user_id == user_id
            && app.state != AppLifecycleState::Uninstalled
            && app.package.registry_url_base == package.registry_url_base
            && app.package.registry_app_id == package.registry_app_id
    });
    if duplicate {
        return Err(HdbError::Conflict(format!(
            "user {} already has {}/{} installed",
            user_id, package.registry_url_base, package.registry_app_id
        )));
    }
    Ok(())
}

/// Gives app rules their ids, owner and positions after every rule in `state`,
/// keeping the order they were declared in.
fn assign_app_rules(state: &NodeState, rules: &mut [ReverseProxyRule], app_id: &str) {
    let first = state.next_rule_position();
    for (offset, rule) in rules.iter_mut().enumerate() {
        if rule.id.is_empty() {
            rule.id = new_id();
        }
        rule.app_id = Some(app_id.to_string());
        rule.position = first + offset as u64;
    }
}

/// Replaces the whole (empty) document with the initial node state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeTransition {
    pub init_state: NodeState,
}

impl Transition for InitializeTransition {
    fn transition_type(&self) -> &str {
        INITIALIZE
    }

    fn enrich(&mut self, _old_state: &[u8]) -> Result<()> {
        if self.init_state.node_id.is_empty() {
            self.init_state.node_id = new_id();
        }
        self.init_state.schema_version = CURRENT_VERSION.to_string();
        Ok(())
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        let old = load(old_state)?;
        if !old.node_id.is_empty() {
            return Err(HdbError::PreconditionFailed(format!(
                "node {} is already initialized",
                old.node_id
            )));
        }
        require_non_empty(&self.init_state.node_id, "node_id")
    }

    fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
        ops(vec![json!({"op": "add", "path": "", "value": self.init_state})])
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddUserTransition {
    pub user: User,
}

impl Transition for AddUserTransition {
    fn transition_type(&self) -> &str {
        ADD_USER
    }

    fn enrich(&mut self, _old_state: &[u8]) -> Result<()> {
        if self.user.id.is_empty() {
            self.user.id = new_id();
        }
        Ok(())
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        require_non_empty(&self.user.username, "username")?;
        let old = load(old_state)?;
        if old.users.contains_key(&self.user.id) {
            return Err(HdbError::Conflict(format!("user id {} already exists", self.user.id)));
        }
        if old.user_by_name(&self.user.username).is_some() {
            return Err(HdbError::Conflict(format!(
                "username {} is already taken",
                self.user.username
            )));
        }
        Ok(())
    }

    fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
        ops(vec![json!({
            "op": "add",
            "path": pointer(&["users", &self.user.id]),
            "value": self.user
        })])
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartInstallationTransition {
    pub app: AppInstallation,
    #[serde(default)]
    pub new_proxy_rules: Vec<ReverseProxyRule>,
}

impl Transition for StartInstallationTransition {
    fn transition_type(&self) -> &str {
        START_INSTALLATION
    }

    fn enrich(&mut self, old_state: &[u8]) -> Result<()> {
        if self.app.id.is_empty() {
            self.app.id = new_id();
        }
        self.app.state = AppLifecycleState::Installing;
        let old = load(old_state)?;
        assign_app_rules(&old, &mut self.new_proxy_rules, &self.app.id);
        Ok(())
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        require_non_empty(&self.app.name, "app name")?;
        require_non_empty(&self.app.version, "app version")?;

        let old = load(old_state)?;
        if !old.users.contains_key(&self.app.user_id) {
            return Err(HdbError::NotFound(format!("user {}", self.app.user_id)));
        }
        if old.app_installations.contains_key(&self.app.id) {
            return Err(HdbError::Conflict(format!(
                "app installation {} already exists",
                self.app.id
            )));
        }
        check_registry_unique(&old, &self.app.user_id, &self.app.package, None)?;
        check_new_rules(&old, &self.new_proxy_rules, None)
    }

    fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
        let mut operations = vec![json!({
            "op": "add",
            "path": pointer(&["app_installations", &self.app.id]),
            "value": self.app
        })];
        for rule in &self.new_proxy_rules {
            operations.push(json!({
                "op": "add",
                "path": pointer(&["reverse_proxy_rules", &rule.id]),
                "value": rule
            }));
        }
        ops(operations)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishInstallationTransition {
    pub app_id: String,
}

impl Transition for FinishInstallationTransition {
    fn transition_type(&self) -> &str {
        FINISH_INSTALLATION
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        let old = load(old_state)?;
        let app = find_app(&old, &self.app_id)?;
        if app.state != AppLifecycleState::Installing {
            return Err(HdbError::PreconditionFailed(format!(
                "app {} is {:?}, not installing",
                self.app_id, app.state
            )));
        }
        Ok(())
    }

    fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
        ops(vec![json!({
            "op": "replace",
            "path": pointer(&["app_installations", &self.app_id, "state"]),
            "value": AppLifecycleState::Installed
        })])
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartUninstallationTransition {
    pub app_id: String,
}

impl Transition for StartUninstallationTransition {
    fn transition_type(&self) -> &str {
        START_UNINSTALLATION
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        let old = load(old_state)?;
        let app = find_app(&old, &self.app_id)?;
        if app.state == AppLifecycleState::Uninstalled {
            return Err(HdbError::PreconditionFailed(format!(
                "app {} is already uninstalled",
                self.app_id
            )));
        }
        if let Some(process) = old.live_process_for_app(&self.app_id) {
            return Err(HdbError::PreconditionFailed(format!(
                "app {} still has live process {}",
                self.app_id, process.id
            )));
        }
        Ok(())
    }

    fn patch(&self, old_state: &[u8]) -> Result<Vec<u8>> {
        let old = load(old_state)?;
        let mut operations = vec![json!({
            "op": "replace",
            "path": pointer(&["app_installations", &self.app_id, "state"]),
            "value": AppLifecycleState::Uninstalled
        })];
        for rule in old.rules_for_app(&self.app_id) {
            operations.push(json!({
                "op": "remove",
                "path": pointer(&["reverse_proxy_rules", &rule.id])
            }));
        }
        ops(operations)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

/// Declares a new process for an installed app. The process record itself
/// is created during enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStartTransition {
    pub app_id: String,
    #[serde(default)]
    pub process: Option<Process>,
}

impl ProcessStartTransition {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            process: None,
        }
    }
}

impl Transition for ProcessStartTransition {
    fn transition_type(&self) -> &str {
        PROCESS_START
    }

    fn enrich(&mut self, old_state: &[u8]) -> Result<()> {
        if self.process.is_some() {
            return Ok(());
        }
        let old = load(old_state)?;
        // Missing apps are reported by validate.
        if let Some(app) = old.app_installations.get(&self.app_id) {
            self.process = Some(Process {
                id: new_id(),
                app_id: app.id.clone(),
                user_id: app.user_id.clone(),
                driver: app.package.driver,
                created: Utc::now().to_rfc3339(),
                state: ProcessLifecycleState::Starting,
                ext_driver_id: None,
            });
        }
        Ok(())
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        let old = load(old_state)?;
        let app = find_app(&old, &self.app_id)?;
        if app.state != AppLifecycleState::Installed {
            return Err(HdbError::PreconditionFailed(format!(
                "app {} is {:?}, not installed",
                self.app_id, app.state
            )));
        }
        if !old.users.contains_key(&app.user_id) {
            return Err(HdbError::NotFound(format!("user {}", app.user_id)));
        }
        if let Some(existing) = old.live_process_for_app(&self.app_id) {
            return Err(HdbError::Conflict(format!(
                "app {} already has process {}",
                self.app_id, existing.id
            )));
        }

        let process = self
            .process
            .as_ref()
            .ok_or_else(|| HdbError::InvalidInput("process_start was not enriched".to_string()))?;
        if process.app_id != self.app_id {
            return Err(HdbError::InvalidInput(format!(
                "process {} belongs to app {}",
                process.id, process.app_id
            )));
        }
        if old.processes.contains_key(&process.id) {
            return Err(HdbError::Conflict(format!("process {} already exists", process.id)));
        }
        Ok(())
    }

    fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
        let process = self
            .process
            .as_ref()
            .ok_or_else(|| HdbError::InvalidInput("process_start was not enriched".to_string()))?;
        ops(vec![json!({
            "op": "add",
            "path": pointer(&["processes", &process.id]),
            "value": process
        })])
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRunningTransition {
    pub process_id: String,
    pub ext_driver_id: String,
}

impl Transition for ProcessRunningTransition {
    fn transition_type(&self) -> &str {
        PROCESS_RUNNING
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        let old = load(old_state)?;
        let process = find_process(&old, &self.process_id)?;
        if process.state == ProcessLifecycleState::Stopped {
            return Err(HdbError::PreconditionFailed(format!(
                "process {} has been stopped",
                self.process_id
            )));
        }
        Ok(())
    }

    fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
        ops(vec![
            json!({
                "op": "replace",
                "path": pointer(&["processes", &self.process_id, "state"]),
                "value": ProcessLifecycleState::Running
            }),
            json!({
                "op": "add",
                "path": pointer(&["processes", &self.process_id, "ext_driver_id"]),
                "value": self.ext_driver_id
            }),
        ])
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStopTransition {
    pub process_id: String,
}

impl Transition for ProcessStopTransition {
    fn transition_type(&self) -> &str {
        PROCESS_STOP
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        let old = load(old_state)?;
        let process = find_process(&old, &self.process_id)?;
        if process.state == ProcessLifecycleState::Stopped {
            return Err(HdbError::PreconditionFailed(format!(
                "process {} is already stopped",
                self.process_id
            )));
        }
        Ok(())
    }

    fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
        ops(vec![json!({
            "op": "replace",
            "path": pointer(&["processes", &self.process_id, "state"]),
            "value": ProcessLifecycleState::Stopped
        })])
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishProcessStopTransition {
    pub process_id: String,
}

impl Transition for FinishProcessStopTransition {
    fn transition_type(&self) -> &str {
        FINISH_PROCESS_STOP
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        let old = load(old_state)?;
        let process = find_process(&old, &self.process_id)?;
        if process.state != ProcessLifecycleState::Stopped {
            return Err(HdbError::PreconditionFailed(format!(
                "process {} has not been stopped",
                self.process_id
            )));
        }
        Ok(())
    }

    fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
        ops(vec![json!({
            "op": "remove",
            "path": pointer(&["processes", &self.process_id])
        })])
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

/// Moves an installed app to a new version and package, swapping its proxy
/// rules in the same patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartAppUpgradeTransition {
    pub app_id: String,
    pub version: String,
    pub package: Package,
    #[serde(default)]
    pub new_proxy_rules: Vec<ReverseProxyRule>,
    #[serde(default)]
    pub start_after_upgrade: bool,
}

impl Transition for StartAppUpgradeTransition {
    fn transition_type(&self) -> &str {
        START_APP_UPGRADE
    }

    fn enrich(&mut self, old_state: &[u8]) -> Result<()> {
        let old = load(old_state)?;
        assign_app_rules(&old, &mut self.new_proxy_rules, &self.app_id);
        Ok(())
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        require_non_empty(&self.version, "app version")?;
        let old = load(old_state)?;
        let app = find_app(&old, &self.app_id)?;
        if app.state != AppLifecycleState::Installed {
            return Err(HdbError::PreconditionFailed(format!(
                "app {} is {:?}, not installed",
                self.app_id, app.state
            )));
        }
        if let Some(process) = old.live_process_for_app(&self.app_id) {
            return Err(HdbError::PreconditionFailed(format!(
                "app {} still has live process {}",
                self.app_id, process.id
            )));
        }
        check_registry_unique(&old, &app.user_id, &self.package, Some(&self.app_id))?;
        check_new_rules(&old, &self.new_proxy_rules, Some(&self.app_id))
    }

    fn patch(&self, old_state: &[u8]) -> Result<Vec<u8>> {
        let old = load(old_state)?;
        let mut operations = vec![
            json!({
                "op": "replace",
                "path": pointer(&["app_installations", &self.app_id, "version"]),
                "value": self.version
            }),
            json!({
                "op": "replace",
                "path": pointer(&["app_installations", &self.app_id, "package"]),
                "value": self.package
            }),
            json!({
                "op": "replace",
                "path": pointer(&["app_installations", &self.app_id, "state"]),
                "value": AppLifecycleState::Upgrading
            }),
        ];
        for rule in old.rules_for_app(&self.app_id) {
            operations.push(json!({
                "op": "remove",
                "path": pointer(&["reverse_proxy_rules", &rule.id])
            }));
        }
        for rule in &self.new_proxy_rules {
            operations.push(json!({
                "op": "add",
                "path": pointer(&["reverse_proxy_rules", &rule.id]),
                "value": rule
            }));
        }
        ops(operations)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishAppUpgradeTransition {
    pub app_id: String,
}

impl Transition for FinishAppUpgradeTransition {
    fn transition_type(&self) -> &str {
        FINISH_APP_UPGRADE
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        let old = load(old_state)?;
        let app = find_app(&old, &self.app_id)?;
        if app.state != AppLifecycleState::Upgrading {
            return Err(HdbError::PreconditionFailed(format!(
                "app {} is {:?}, not upgrading",
                self.app_id, app.state
            )));
        }
        Ok(())
    }

    fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
        ops(vec![json!({
            "op": "replace",
            "path": pointer(&["app_installations", &self.app_id, "state"]),
            "value": AppLifecycleState::Installed
        })])
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddReverseProxyRuleTransition {
    pub rule: ReverseProxyRule,
}

impl Transition for AddReverseProxyRuleTransition {
    fn transition_type(&self) -> &str {
        ADD_REVERSE_PROXY_RULE
    }

    fn enrich(&mut self, old_state: &[u8]) -> Result<()> {
        if self.rule.id.is_empty() {
            self.rule.id = new_id();
        }
        self.rule.position = load(old_state)?.next_rule_position();
        Ok(())
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        let old = load(old_state)?;
        if let Some(app_id) = &self.rule.app_id {
            find_app(&old, app_id)?;
        }
        check_new_rules(&old, std::slice::from_ref(&self.rule), None)
    }

    fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
        ops(vec![json!({
            "op": "add",
            "path": pointer(&["reverse_proxy_rules", &self.rule.id]),
            "value": self.rule
        })])
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveReverseProxyRuleTransition {
    pub rule_id: String,
}

impl Transition for RemoveReverseProxyRuleTransition {
    fn transition_type(&self) -> &str {
        REMOVE_REVERSE_PROXY_RULE
    }

    fn validate(&self, old_state: &[u8]) -> Result<()> {
        let old = load(old_state)?;
        if !old.reverse_proxy_rules.contains_key(&self.rule_id) {
            return Err(HdbError::NotFound(format!("reverse proxy rule {}", self.rule_id)));
        }
        Ok(())
    }

    fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
        ops(vec![json!({
            "op": "remove",
            "path": pointer(&["reverse_proxy_rules", &self.rule_id])
        })])
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }
}
