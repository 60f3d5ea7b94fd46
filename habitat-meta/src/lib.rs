//! Habitat Meta - embedded replicated JSON state store (HDB)
//!
//! Every database is a schema-validated JSON document driven by a durable log:
//! - typed transitions are enriched and turned into RFC 6902 patches on the proposer
//! - batches of patches are committed to a per-database log (SQLite + snapshots)
//! - the state machine re-applies committed batches and publishes state updates
//! - restarts replay the log silently up to the restart index

pub mod error;
pub mod json_state;
pub mod log_store;
pub mod manager;
pub mod pubsub;
pub mod replicator;
pub mod schema;
pub mod snapshot;
pub mod state_machine;
pub mod transition;
pub mod update;

pub use error::{HdbError, Result};
pub use json_state::{JsonState, StateValidator};
pub use log_store::{LogEntry, LogStore};
pub use manager::{Database, DatabaseManager};
pub use pubsub::{Publisher, Subscriber, SubscriptionId};
pub use replicator::{CommittedState, LocalReplicator, LogConfig, Replicator};
pub use schema::{
    Schema, SchemaMigration, SchemaRegistry, parse_version, schema_for_version, verify_migrations,
};
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use state_machine::StateMachineController;
pub use transition::{Transition, TransitionWrapper, decode_batch, encode_batch, prepare_batch};
pub use update::{RESTORE_TRANSITION_TYPE, StateUpdate};
