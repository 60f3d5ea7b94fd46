//! Keeps the in-memory [`RuleSet`] in line with the rules declared in node
//! state.

use crate::rules::{RuleEntry, RuleFactory, RuleSet};
use async_trait::async_trait;
use habitat_core::node::transitions::{
    ADD_REVERSE_PROXY_RULE, AddReverseProxyRuleTransition, REMOVE_REVERSE_PROXY_RULE,
    RemoveReverseProxyRuleTransition, START_APP_UPGRADE, START_INSTALLATION,
    START_UNINSTALLATION, StartAppUpgradeTransition, StartInstallationTransition,
    StartUninstallationTransition,
};
use habitat_core::node::SCHEMA_NAME;
use habitat_core::{
    Executor, NodeState, Reconciler, ReconcilerBuilder, Restorer, Result, ReverseProxyRule,
};
use habitat_meta::StateUpdate;
use std::sync::Arc;

pub const PROXY_RECONCILER: &str = "reverse_proxy";

pub fn proxy_reconciler(rules: Arc<RuleSet>, factory: RuleFactory) -> Result<Arc<Reconciler>> {
    let installer = RuleInstaller {
        rules,
        factory: Arc::new(factory),
    };
    let reconciler = ReconcilerBuilder::new(PROXY_RECONCILER, SCHEMA_NAME)
        .executor(Arc::new(AddRuleExecutor(installer.clone())))?
        .executor(Arc::new(RemoveRuleExecutor(installer.clone())))?
        .executor(Arc::new(InstallAppRulesExecutor(installer.clone())))?
        .executor(Arc::new(UpgradeAppRulesExecutor(installer.clone())))?
        .executor(Arc::new(UninstallAppRulesExecutor(installer.clone())))?
        .restorer(Arc::new(RuleRestorer(installer)))
        .build();
    Ok(reconciler)
}

#[derive(Clone)]
struct RuleInstaller {
    rules: Arc<RuleSet>,
    factory: Arc<RuleFactory>,
}

impl RuleInstaller {
    async fn install(&self, declared: &ReverseProxyRule) -> Result<()> {
        let rule = self.factory.build(declared)?;
        tracing::info!(
            "Adding reverse proxy rule {} ({} -> {})",
            declared.id,
            declared.matcher,
            declared.target
        );
        self.rules
            .insert(declared.id.clone(), declared.app_id.clone(), rule)
            .await;
        Ok(())
    }

    async fn any_missing(&self, declared: &[ReverseProxyRule]) -> bool {
        for rule in declared {
            if !self.rules.contains(&rule.id).await {
                return true;
            }
        }
        false
    }

    /// True when the rules held for `app_id` are exactly those `state` declares.
    async fn app_in_sync(&self, state: &NodeState, app_id: &str) -> bool {
        let declared: Vec<String> = state
            .rules_for_app(app_id)
            .map(|rule| rule.id.clone())
            .collect();
        self.rules.ids_for_app(app_id).await == declared
    }

    /// Replaces every rule owned by `app_id` with the ones in `state`.
    async fn sync_app(&self, state: &NodeState, app_id: &str) -> Result<()> {
        let removed = self.rules.remove_app(app_id).await;
        if !removed.is_empty() {
            tracing::info!("Removed reverse proxy rules {:?} of app {}", removed, app_id);
        }
        for declared in state.rules_for_app(app_id) {
            self.install(declared).await?;
        }
        Ok(())
    }
}

struct AddRuleExecutor(RuleInstaller);

#[async_trait]
impl Executor for AddRuleExecutor {
    fn transition_type(&self) -> &str {
        ADD_REVERSE_PROXY_RULE
    }

    async fn should_execute(&self, update: &StateUpdate) -> Result<bool> {
        let transition: AddReverseProxyRuleTransition = update.decode_transition()?;
        Ok(!self.0.rules.contains(&transition.rule.id).await)
    }

    async fn execute(&self, update: &StateUpdate) -> Result<()> {
        let transition: AddReverseProxyRuleTransition = update.decode_transition()?;
        self.0.install(&transition.rule).await
    }
}

struct RemoveRuleExecutor(RuleInstaller);

#[async_trait]
impl Executor for RemoveRuleExecutor {
    fn transition_type(&self) -> &str {
        REMOVE_REVERSE_PROXY_RULE
    }

    async fn should_execute(&self, update: &StateUpdate) -> Result<bool> {
        let transition: RemoveReverseProxyRuleTransition = update.decode_transition()?;
        Ok(self.0.rules.contains(&transition.rule_id).await)
    }

    async fn execute(&self, update: &StateUpdate) -> Result<()> {
        let transition: RemoveReverseProxyRuleTransition = update.decode_transition()?;
        tracing::info!("Removing reverse proxy rule {}", transition.rule_id);
        self.0.rules.remove(&transition.rule_id).await;
        Ok(())
    }
}

struct InstallAppRulesExecutor(RuleInstaller);

#[async_trait]
impl Executor for InstallAppRulesExecutor {
    fn transition_type(&self) -> &str {
        START_INSTALLATION
    }

    async fn should_execute(&self, update: &StateUpdate) -> Result<bool> {
        let transition: StartInstallationTransition = update.decode_transition()?;
        Ok(self.0.any_missing(&transition.new_proxy_rules).await)
    }

    async fn execute(&self, update: &StateUpdate) -> Result<()> {
        let transition: StartInstallationTransition = update.decode_transition()?;
        for declared in &transition.new_proxy_rules {
            self.0.install(declared).await?;
        }
        Ok(())
    }
}

struct UpgradeAppRulesExecutor(RuleInstaller);

#[async_trait]
impl Executor for UpgradeAppRulesExecutor {
    fn transition_type(&self) -> &str {
        START_APP_UPGRADE
    }

    async fn should_execute(&self, update: &StateUpdate) -> Result<bool> {
        let transition: StartAppUpgradeTransition = update.decode_transition()?;
        let state = NodeState::from_bytes(&update.new_state)?;
        Ok(!self.0.app_in_sync(&state, &transition.app_id).await)
    }

    async fn execute(&self, update: &StateUpdate) -> Result<()> {
        let transition: StartAppUpgradeTransition = update.decode_transition()?;
        let state = NodeState::from_bytes(&update.new_state)?;
        self.0.sync_app(&state, &transition.app_id).await
    }
}

struct UninstallAppRulesExecutor(RuleInstaller);

#[async_trait]
impl Executor for UninstallAppRulesExecutor {
    fn transition_type(&self) -> &str {
        START_UNINSTALLATION
    }

    async fn should_execute(&self, update: &StateUpdate) -> Result<bool> {
        let transition: StartUninstallationTransition = update.decode_transition()?;
        let state = NodeState::from_bytes(&update.new_state)?;
        Ok(!self.0.app_in_sync(&state, &transition.app_id).await)
    }

    async fn execute(&self, update: &StateUpdate) -> Result<()> {
        let transition: StartUninstallationTransition = update.decode_transition()?;
        let state = NodeState::from_bytes(&update.new_state)?;
        self.0.sync_app(&state, &transition.app_id).await
    }
}

struct RuleRestorer(RuleInstaller);

#[async_trait]
impl Restorer for RuleRestorer {
    async fn restore(&self, update: &StateUpdate) -> Result<()> {
        let state = NodeState::from_bytes(&update.new_state)?;
        let mut entries = Vec::with_capacity(state.reverse_proxy_rules.len());
        for declared in state.ordered_rules() {
            match self.0.factory.build(declared) {
                Ok(rule) => entries.push(RuleEntry {
                    id: declared.id.clone(),
                    app_id: declared.app_id.clone(),
                    rule: Arc::new(rule),
                }),
                Err(e) => {
                    tracing::warn!("Failed to restore reverse proxy rule {}: {}", declared.id, e);
                }
            }
        }
        tracing::info!("Restored {} reverse proxy rules", entries.len());
        self.0.rules.replace_all(entries).await;
        Ok(())
    }
}
