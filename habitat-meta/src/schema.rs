use crate::error::{HdbError, Result};
use crate::json_state::StateValidator;
use crate::transition::Transition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A named state shape: its JSON schema, empty state, and transition constructors.
pub trait Schema: Send + Sync {
    fn name(&self) -> &str;

    /// Semver of the schema document (a leading `v` is allowed)
    fn current_version(&self) -> &str;

    fn validator(&self) -> Arc<StateValidator>;

    fn empty_state(&self) -> Result<Vec<u8>>;

    /// Tag of the transition that must open every new database
    fn initialization_type(&self) -> &str;

    fn initialization_transition(&self, init_state: &[u8]) -> Result<Box<dyn Transition>>;

    /// Rebuilds a typed transition from its tag and serialized form.
    fn decode_transition(&self, transition_type: &str, transition: &[u8])
    -> Result<Box<dyn Transition>>;

    fn migrations(&self) -> &[SchemaMigration];
}

/// One step of the schema document's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaMigration {
    pub old_version: String,
    pub new_version: String,
    pub up: Vec<Value>,
    pub down: Vec<Value>,
}

pub fn parse_version(version: &str) -> Result<semver::Version> {
    let trimmed = version.strip_prefix('v').unwrap_or(version);
    semver::Version::parse(trimmed).map_err(|error| {
        HdbError::InvalidInput(format!("invalid schema version {}: {}", version, error))
    })
}

fn apply_steps(document: &mut Value, steps: &[Value]) -> Result<()> {
    let patch: json_patch::Patch = serde_json::from_value(Value::Array(steps.to_vec()))
        .map_err(|error| HdbError::InvalidPatch(format!("invalid migration patch: {}", error)))?;
    json_patch::patch(document, &patch).map_err(|error| HdbError::InvalidPatch(error.to_string()))
}

/// Folds the `up` patches from `{}` until `target_version` is reached.
pub fn schema_for_version(migrations: &[SchemaMigration], target_version: &str) -> Result<Value> {
    let target = parse_version(target_version)?;
    let mut document = Value::Object(Default::default());

    for migration in migrations {
        let version = parse_version(&migration.new_version)?;
        if version > target {
            break;
        }
        apply_steps(&mut document, &migration.up)?;
        if version == target {
            return Ok(document);
        }
    }

    Err(HdbError::NotFound(format!(
        "schema version {} not found in migrations",
        target_version
    )))
}

/// Checks that the migration list is ordered, that every `up` step applied
/// to `{}` yields `current`, and that the `down` steps in reverse lead back
/// to `{}`.
pub fn verify_migrations(migrations: &[SchemaMigration], current: &Value) -> Result<()> {
    let mut previous: Option<semver::Version> = None;
    for migration in migrations {
        let old_version = parse_version(&migration.old_version)?;
        let new_version = parse_version(&migration.new_version)?;
        if new_version <= old_version {
            return Err(HdbError::InvalidInput(format!(
                "migration {} -> {} does not move forward",
                migration.old_version, migration.new_version
            )));
        }
        if let Some(previous) = &previous {
            if *previous != old_version {
                return Err(HdbError::InvalidInput(format!(
                    "migration {} does not continue from {}",
                    migration.old_version, previous
                )));
            }
        }
        previous = Some(new_version);
    }

    let mut document = Value::Object(Default::default());
    for migration in migrations {
        apply_steps(&mut document, &migration.up)?;
    }
    if &document != current {
        return Err(HdbError::SchemaViolation(
            "applying every up migration does not produce the current schema".to_string(),
        ));
    }

    for migration in migrations.iter().rev() {
        apply_steps(&mut document, &migration.down)?;
    }
    if document != Value::Object(Default::default()) {
        return Err(HdbError::SchemaViolation(
            "down migrations do not result in {}".to_string(),
        ));
    }

    Ok(())
}

/// Maps schema names to their definitions.
#[derive(Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<dyn Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: Arc<dyn Schema>) -> Result<()> {
        let name = schema.name().to_string();
        if self.schemas.contains_key(&name) {
            return Err(HdbError::AlreadyExists(format!("schema {} already registered", name)));
        }
        self.schemas.insert(name, schema);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Schema>> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| HdbError::UnknownSchema(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transition::tests::{IncrementCounter, SetCounter, counter_schema};
    use serde_json::json;

    /// Counter schema used across the HDB tests.
    pub struct CounterSchema {
        validator: Arc<StateValidator>,
        migrations: Vec<SchemaMigration>,
    }

    impl CounterSchema {
        pub fn new() -> Self {
            Self {
                validator: Arc::new(StateValidator::new(counter_schema()).unwrap()),
                migrations: counter_migrations(),
            }
        }
    }

    impl Schema for CounterSchema {
        fn name(&self) -> &str {
            "counter"
        }

        fn current_version(&self) -> &str {
            "v0.0.2"
        }

        fn validator(&self) -> Arc<StateValidator> {
            self.validator.clone()
        }

        fn empty_state(&self) -> Result<Vec<u8>> {
            Ok(br#"{"count":0}"#.to_vec())
        }

        fn initialization_type(&self) -> &str {
            "set_counter"
        }

        fn initialization_transition(&self, init_state: &[u8]) -> Result<Box<dyn Transition>> {
            let state: Value = serde_json::from_slice(init_state)?;
            let value = state["count"].as_i64().unwrap_or_default();
            Ok(Box::new(SetCounter { value }))
        }

        fn decode_transition(
            &self,
            transition_type: &str,
            transition: &[u8],
        ) -> Result<Box<dyn Transition>> {
            match transition_type {
                "set_counter" => Ok(Box::new(serde_json::from_slice::<SetCounter>(transition)?)),
                "increment_counter" => Ok(Box::new(serde_json::from_slice::<IncrementCounter>(
                    transition,
                )?)),
                other => Err(HdbError::InvalidInput(format!("unknown transition {}", other))),
            }
        }

        fn migrations(&self) -> &[SchemaMigration] {
            &self.migrations
        }
    }

    fn counter_migrations() -> Vec<SchemaMigration> {
        vec![
            SchemaMigration {
                old_version: "v0.0.0".to_string(),
                new_version: "v0.0.1".to_string(),
                up: vec![
                    json!({"op": "add", "path": "/type", "value": "object"}),
                    json!({
                        "op": "add",
                        "path": "/properties",
                        "value": {"count": {"type": "integer"}}
                    }),
                ],
                down: vec![
                    json!({"op": "remove", "path": "/properties"}),
                    json!({"op": "remove", "path": "/type"}),
                ],
            },
            SchemaMigration {
                old_version: "v0.0.1".to_string(),
                new_version: "v0.0.2".to_string(),
                up: vec![
                    json!({"op": "add", "path": "/properties/count/minimum", "value": 0}),
                    json!({"op": "add", "path": "/required", "value": ["count"]}),
                ],
                down: vec![
                    json!({"op": "remove", "path": "/required"}),
                    json!({"op": "remove", "path": "/properties/count/minimum"}),
                ],
            },
        ]
    }

    #[test]
    fn test_counter_migrations_round_trip() {
        let schema = CounterSchema::new();
        verify_migrations(schema.migrations(), &counter_schema()).unwrap();
    }

    #[test]
    fn test_schema_for_version() {
        let migrations = counter_migrations();
        let first = schema_for_version(&migrations, "v0.0.1").unwrap();
        assert_eq!(first, json!({"type": "object", "properties": {"count": {"type": "integer"}}}));

        let latest = schema_for_version(&migrations, "0.0.2").unwrap();
        assert_eq!(latest, counter_schema());

        assert!(matches!(
            schema_for_version(&migrations, "v0.1.0"),
            Err(HdbError::NotFound(_))
        ));
    }

    #[test]
    fn test_verify_rejects_broken_down_steps() {
        let mut migrations = counter_migrations();
        migrations[1].down.pop();
        assert!(verify_migrations(&migrations, &counter_schema()).is_err());
    }

    #[test]
    fn test_registry() {
        let mut registry = SchemaRegistry::new();
        registry.register(Arc::new(CounterSchema::new())).unwrap();
        assert!(matches!(
            registry.register(Arc::new(CounterSchema::new())),
            Err(HdbError::AlreadyExists(_))
        ));

        let schema = registry.get("counter").unwrap();
        let transition = schema
            .decode_transition("set_counter", br#"{"value":3}"#)
            .unwrap();
        assert_eq!(transition.transition_type(), "set_counter");
        assert!(matches!(registry.get("missing"), Err(HdbError::UnknownSchema(_))));
        assert_eq!(registry.names(), vec!["counter".to_string()]);
    }
}
