//! Habitat Proxy - the node's HTTP front door
//!
//! Requests are routed by the first rule whose matcher prefixes the path:
//! redirect rules forward upstream, file rules serve a host directory and
//! embedded rules serve files compiled into the binary. The rule set is
//! maintained by a reconciler subscribed to node state.

pub mod embedded;
pub mod file_server;
pub mod reconcile;
pub mod redirect;
pub mod rules;
pub mod server;

pub use embedded::EmbeddedFs;
pub use reconcile::{PROXY_RECONCILER, proxy_reconciler};
pub use rules::{Rule, RuleEntry, RuleFactory, RuleSet};
pub use server::{ProxyServer, ProxyState};
