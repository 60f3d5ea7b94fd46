use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Transition tag carried by the synthetic update published after a restart.
pub const RESTORE_TRANSITION_TYPE: &str = "restore";

/// A committed change to one database, as seen by subscribers.
///
/// All wrappers of one batch share `log_index`; `batch_offset` orders them
/// within the entry.
#[derive(Debug, Clone, Serialize)]
pub struct StateUpdate {
    pub schema_name: String,
    pub database_id: String,
    pub new_state: Vec<u8>,
    pub transition_type: String,
    pub transition: Vec<u8>,
    pub log_index: u64,
    pub batch_offset: usize,
    pub batch_len: usize,
    pub is_restore: bool,
}

impl StateUpdate {
    pub fn restore(
        schema_name: impl Into<String>,
        database_id: impl Into<String>,
        new_state: Vec<u8>,
        log_index: u64,
    ) -> Self {
        Self {
            schema_name: schema_name.into(),
            database_id: database_id.into(),
            new_state,
            transition_type: RESTORE_TRANSITION_TYPE.to_string(),
            transition: Vec::new(),
            log_index,
            batch_offset: 0,
            batch_len: 1,
            is_restore: true,
        }
    }

    pub fn is_last_in_batch(&self) -> bool {
        self.batch_offset + 1 >= self.batch_len
    }

    pub fn state<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.new_state)?)
    }

    pub fn decode_transition<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.transition)?)
    }
}
