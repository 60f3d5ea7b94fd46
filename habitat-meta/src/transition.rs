use crate::error::{HdbError, Result};
use crate::json_state::JsonState;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed, patch-producing change to a database's state.
///
/// `enrich` runs once on the proposer before `validate` and `patch`, and its
/// result is what gets persisted. Replays apply the stored patch and never
/// call back into the transition.
pub trait Transition: Send + Sync + fmt::Debug {
    fn transition_type(&self) -> &str;

    fn enrich(&mut self, _old_state: &[u8]) -> Result<()> {
        Ok(())
    }

    fn validate(&self, old_state: &[u8]) -> Result<()>;

    /// RFC 6902 patch taking `old_state` to the new state
    fn patch(&self, old_state: &[u8]) -> Result<Vec<u8>>;

    /// Serialized form of the (enriched) transition
    fn encode(&self) -> Result<Vec<u8>>;
}

/// One element of a log entry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionWrapper {
    #[serde(rename = "type")]
    pub transition_type: String,
    #[serde(with = "base64_bytes")]
    pub patch: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub transition: Vec<u8>,
}

/// Runs the proposer side of a batch against a scratch copy of `state`.
///
/// Returns the wrappers to commit and the hypothetical post-batch state. Any
/// failure aborts the whole batch and leaves `state` untouched.
pub fn prepare_batch(
    state: &JsonState,
    transitions: &mut [Box<dyn Transition>],
) -> Result<(Vec<TransitionWrapper>, JsonState)> {
    if transitions.is_empty() {
        return Err(HdbError::InvalidInput(
            "a batch must contain at least one transition".to_string(),
        ));
    }

    let mut scratch = state.copy();
    let mut wrappers = Vec::with_capacity(transitions.len());

    for transition in transitions.iter_mut() {
        transition.enrich(scratch.bytes())?;
        transition.validate(scratch.bytes())?;

        let patch = transition.patch(scratch.bytes())?;
        scratch.apply_patch(&patch)?;

        wrappers.push(TransitionWrapper {
            transition_type: transition.transition_type().to_string(),
            patch,
            transition: transition.encode()?,
        });
    }

    Ok((wrappers, scratch))
}

/// Encodes a batch the way it is handed to the log: a JSON array, base64-encoded.
pub fn encode_batch(wrappers: &[TransitionWrapper]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(wrappers)?;
    Ok(STANDARD.encode(json).into_bytes())
}

pub fn decode_batch(payload: &[u8]) -> Result<Vec<TransitionWrapper>> {
    let json = STANDARD.decode(payload)?;
    let wrappers: Vec<TransitionWrapper> = serde_json::from_slice(&json)?;
    if wrappers.is_empty() {
        return Err(HdbError::Serialization("log entry holds an empty batch".to_string()));
    }
    Ok(wrappers)
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::json_state::StateValidator;
    use serde_json::{Value, json};
    use std::sync::Arc;

    /// Minimal counter transitions shared by the HDB tests.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SetCounter {
        pub value: i64,
    }

    impl Transition for SetCounter {
        fn transition_type(&self) -> &str {
            "set_counter"
        }

        fn validate(&self, _old_state: &[u8]) -> Result<()> {
            if self.value < 0 {
                return Err(HdbError::InvalidInput("counter cannot be negative".to_string()));
            }
            Ok(())
        }

        fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
            Ok(serde_json::to_vec(&json!([
                {"op": "replace", "path": "/count", "value": self.value}
            ]))?)
        }

        fn encode(&self) -> Result<Vec<u8>> {
            Ok(serde_json::to_vec(self)?)
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct IncrementCounter {
        pub observed: Option<i64>,
    }

    impl Transition for IncrementCounter {
        fn transition_type(&self) -> &str {
            "increment_counter"
        }

        fn enrich(&mut self, old_state: &[u8]) -> Result<()> {
            let state: Value = serde_json::from_slice(old_state)?;
            self.observed = state["count"].as_i64();
            Ok(())
        }

        fn validate(&self, _old_state: &[u8]) -> Result<()> {
            match self.observed {
                Some(_) => Ok(()),
                None => Err(HdbError::PreconditionFailed("counter is missing".to_string())),
            }
        }

        fn patch(&self, _old_state: &[u8]) -> Result<Vec<u8>> {
            let next = self.observed.unwrap_or_default() + 1;
            Ok(serde_json::to_vec(&json!([
                {"op": "replace", "path": "/count", "value": next}
            ]))?)
        }

        fn encode(&self) -> Result<Vec<u8>> {
            Ok(serde_json::to_vec(self)?)
        }
    }

    pub fn counter_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "count": { "type": "integer", "minimum": 0 } },
            "required": ["count"]
        })
    }

    fn counter_state(count: i64) -> JsonState {
        let validator = Arc::new(StateValidator::new(counter_schema()).unwrap());
        JsonState::new(validator, json!({ "count": count }).to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_prepare_batch_applies_in_order() {
        let state = counter_state(1);
        let mut batch: Vec<Box<dyn Transition>> = vec![
            Box::new(IncrementCounter::default()),
            Box::new(IncrementCounter::default()),
        ];

        let (wrappers, next) = prepare_batch(&state, &mut batch).unwrap();
        assert_eq!(wrappers.len(), 2);
        assert_eq!(next.value(), &json!({ "count": 3 }));
        assert_eq!(state.value(), &json!({ "count": 1 }));

        // enrichment is captured in the wrapper, not recomputed later
        let second: IncrementCounter = serde_json::from_slice(&wrappers[1].transition).unwrap();
        assert_eq!(second.observed, Some(2));
    }

    #[test]
    fn test_prepare_batch_rejects_whole_batch() {
        let state = counter_state(1);
        let mut batch: Vec<Box<dyn Transition>> = vec![
            Box::new(SetCounter { value: 4 }),
            Box::new(SetCounter { value: -1 }),
        ];
        let result = prepare_batch(&state, &mut batch);
        assert!(matches!(result, Err(HdbError::InvalidInput(_))));

        let mut empty: Vec<Box<dyn Transition>> = Vec::new();
        let result = prepare_batch(&state, &mut empty);
        assert!(matches!(result, Err(HdbError::InvalidInput(_))));
    }

    #[test]
    fn test_batch_payload_format() {
        let wrappers = vec![TransitionWrapper {
            transition_type: "set_counter".to_string(),
            patch: br#"[{"op":"replace","path":"/count","value":2}]"#.to_vec(),
            transition: br#"{"value":2}"#.to_vec(),
        }];

        let payload = encode_batch(&wrappers).unwrap();
        let json = STANDARD.decode(&payload).unwrap();
        let raw: Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(raw[0]["type"], "set_counter");
        assert!(raw[0]["patch"].is_string());

        assert_eq!(decode_batch(&payload).unwrap(), wrappers);
        assert!(decode_batch(b"!!!").is_err());
    }
}
