use habitat_meta::{Result, SchemaMigration};
use serde_json::Value;

const NODE_SCHEMA_DOCUMENT: &str = include_str!("schema/node.schema.json");
const NODE_MIGRATIONS_DOCUMENT: &str = include_str!("schema/migrations.json");

/// The node JSON schema shipped in the binary.
pub fn node_schema_document() -> Result<Value> {
    Ok(serde_json::from_str(NODE_SCHEMA_DOCUMENT)?)
}

/// Ordered migration steps from `{}` to the shipped schema.
pub fn node_migrations() -> Result<Vec<SchemaMigration>> {
    Ok(serde_json::from_str(NODE_MIGRATIONS_DOCUMENT)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::state::CURRENT_VERSION;
    use habitat_meta::{schema_for_version, verify_migrations};

    #[test]
    fn test_migrations_rebuild_current_schema() {
        let migrations = node_migrations().unwrap();
        let current = node_schema_document().unwrap();
        verify_migrations(&migrations, &current).unwrap();

        assert_eq!(migrations.last().unwrap().new_version, CURRENT_VERSION);
        assert_eq!(schema_for_version(&migrations, CURRENT_VERSION).unwrap(), current);
    }

    #[test]
    fn test_legacy_schema_has_inline_package_fields() {
        let migrations = node_migrations().unwrap();
        let legacy = schema_for_version(&migrations, "v0.0.3").unwrap();
        let app = &legacy["definitions"]["app_installation"]["properties"];
        assert!(app.get("registry_app_id").is_some());
        assert!(app.get("package").is_none());

        let first = schema_for_version(&migrations, "v0.0.1").unwrap();
        assert!(first["properties"].get("processes").is_none());
    }
}
