use crate::node::migrations::{node_migrations, node_schema_document};
use crate::node::state::{CURRENT_VERSION, NodeState, SCHEMA_NAME};
use crate::node::transitions::{INITIALIZE, InitializeTransition, decode_node_transition};
use habitat_meta::{HdbError, Result, Schema, SchemaMigration, StateValidator, Transition};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The `node` schema: one document per node describing users, apps,
/// processes and proxy rules.
pub struct NodeSchema {
    validator: Arc<StateValidator>,
    migrations: Vec<SchemaMigration>,
}

impl NodeSchema {
    pub fn new() -> Result<Self> {
        Ok(Self {
            validator: Arc::new(StateValidator::new(node_schema_document()?)?),
            migrations: node_migrations()?,
        })
    }
}

impl Schema for NodeSchema {
    fn name(&self) -> &str {
        SCHEMA_NAME
    }

    fn current_version(&self) -> &str {
        CURRENT_VERSION
    }

    fn validator(&self) -> Arc<StateValidator> {
        self.validator.clone()
    }

    /// Placeholder document held until `initialize` commits: valid, with an
    /// empty `node_id`.
    fn empty_state(&self) -> Result<Vec<u8>> {
        let empty = NodeState {
            node_id: String::new(),
            name: String::new(),
            certificate: String::new(),
            schema_version: CURRENT_VERSION.to_string(),
            users: BTreeMap::new(),
            processes: BTreeMap::new(),
            app_installations: BTreeMap::new(),
            reverse_proxy_rules: BTreeMap::new(),
        };
        Ok(serde_json::to_vec(&empty)?)
    }

    fn initialization_type(&self) -> &str {
        INITIALIZE
    }

    fn initialization_transition(&self, init_state: &[u8]) -> Result<Box<dyn Transition>> {
        let init_state: NodeState = serde_json::from_slice(init_state).map_err(|error| {
            HdbError::InvalidInput(format!("invalid initial node state: {}", error))
        })?;
        Ok(Box::new(InitializeTransition { init_state }))
    }

    fn decode_transition(
        &self,
        transition_type: &str,
        transition: &[u8],
    ) -> Result<Box<dyn Transition>> {
        decode_node_transition(transition_type, transition)
    }

    fn migrations(&self) -> &[SchemaMigration] {
        &self.migrations
    }
}
