use crate::error::{HdbError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Compiled JSON schema shared by every copy of a database's state.
pub struct StateValidator {
    raw: Value,
    validator: jsonschema::Validator,
}

impl StateValidator {
    pub fn new(raw: Value) -> Result<Self> {
        let validator = jsonschema::validator_for(&raw)
            .map_err(|error| HdbError::InvalidInput(format!("invalid JSON schema: {}", error)))?;
        Ok(Self { raw, validator })
    }

    /// The schema document this validator was compiled from
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        self.validator
            .validate(value)
            .map_err(|error| HdbError::SchemaViolation(error.to_string()))
    }
}

impl fmt::Debug for StateValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateValidator").field("raw", &self.raw).finish()
    }
}

/// A schema-valid JSON document.
///
/// Mutations go through a working copy that is validated before it replaces
/// the current document, so a failed patch never leaves the state half applied.
#[derive(Debug, Clone)]
pub struct JsonState {
    validator: Arc<StateValidator>,
    value: Value,
    bytes: Vec<u8>,
}

impl JsonState {
    pub fn new(validator: Arc<StateValidator>, bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        validator.validate(&value)?;
        let bytes = serde_json::to_vec(&value)?;
        Ok(Self {
            validator,
            value,
            bytes,
        })
    }

    pub fn apply_patch(&mut self, patch: &[u8]) -> Result<()> {
        let (value, bytes) = self.candidate(patch)?;
        self.value = value;
        self.bytes = bytes;
        Ok(())
    }

    /// Returns the bytes `apply_patch` would produce without touching the state
    pub fn validate_patch(&self, patch: &[u8]) -> Result<Vec<u8>> {
        let (_, bytes) = self.candidate(patch)?;
        Ok(bytes)
    }

    pub fn copy(&self) -> JsonState {
        self.clone()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn validator(&self) -> Arc<StateValidator> {
        self.validator.clone()
    }

    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }

    fn candidate(&self, patch: &[u8]) -> Result<(Value, Vec<u8>)> {
        let patch: json_patch::Patch = serde_json::from_slice(patch)
            .map_err(|error| HdbError::InvalidPatch(format!("failed to decode patch: {}", error)))?;

        let mut working = self.value.clone();
        json_patch::patch(&mut working, &patch)
            .map_err(|error| HdbError::InvalidPatch(error.to_string()))?;
        self.validator.validate(&working)?;

        let bytes = serde_json::to_vec(&working)?;
        Ok((working, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter_validator() -> Arc<StateValidator> {
        let schema = json!({
            "type": "object",
            "properties": {
                "count": { "type": "integer", "minimum": 0 },
                "label": { "type": "string" }
            },
            "required": ["count"]
        });
        Arc::new(StateValidator::new(schema).unwrap())
    }

    #[test]
    fn test_new_rejects_invalid_state() {
        let validator = counter_validator();
        let result = JsonState::new(validator.clone(), br#"{"count": -1}"#);
        assert!(matches!(result, Err(HdbError::SchemaViolation(_))));

        let result = JsonState::new(validator, b"not json");
        assert!(matches!(result, Err(HdbError::Serialization(_))));
    }

    #[test]
    fn test_apply_patch() {
        let mut state = JsonState::new(counter_validator(), br#"{"count": 1}"#).unwrap();
        state
            .apply_patch(br#"[{"op": "replace", "path": "/count", "value": 2}]"#)
            .unwrap();
        assert_eq!(state.value(), &json!({"count": 2}));
    }

    #[test]
    fn test_failed_patch_leaves_state_unchanged() {
        let mut state = JsonState::new(counter_validator(), br#"{"count": 1}"#).unwrap();
        let before = state.bytes().to_vec();

        let result = state.apply_patch(br#"[{"op": "replace", "path": "/count", "value": -5}]"#);
        assert!(matches!(result, Err(HdbError::SchemaViolation(_))));
        assert_eq!(state.bytes(), before.as_slice());

        let result = state.apply_patch(br#"[{"op": "remove", "path": "/missing"}]"#);
        assert!(matches!(result, Err(HdbError::InvalidPatch(_))));
        assert_eq!(state.bytes(), before.as_slice());
    }

    #[test]
    fn test_validate_patch_matches_apply() {
        let mut state = JsonState::new(counter_validator(), br#"{"count": 1}"#).unwrap();
        let patch = br#"[{"op": "add", "path": "/label", "value": "x"}]"#;

        let candidate = state.validate_patch(patch).unwrap();
        assert_eq!(state.value(), &json!({"count": 1}));

        state.apply_patch(patch).unwrap();
        assert_eq!(state.bytes(), candidate.as_slice());
    }

    #[test]
    fn test_whole_document_replace() {
        let mut state = JsonState::new(counter_validator(), br#"{"count": 0}"#).unwrap();
        state
            .apply_patch(br#"[{"op": "add", "path": "", "value": {"count": 7, "label": "n1"}}]"#)
            .unwrap();
        assert_eq!(state.value(), &json!({"count": 7, "label": "n1"}));
    }

    #[test]
    fn test_copy_is_independent() {
        let state = JsonState::new(counter_validator(), br#"{"count": 1}"#).unwrap();
        let mut copy = state.copy();
        copy.apply_patch(br#"[{"op": "replace", "path": "/count", "value": 3}]"#)
            .unwrap();
        assert_eq!(state.value(), &json!({"count": 1}));
        assert_eq!(copy.value(), &json!({"count": 3}));
    }
}
