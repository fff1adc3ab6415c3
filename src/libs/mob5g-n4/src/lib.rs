//! Mob5G N4 Engine
//!
//! PFCP association and session engine shared by the SMF and UPF daemons.
//!
//! # Components
//!
//! - [`transport`]: UDP socket, one task per received datagram
//! - [`xact`]: sequence-number request correlator with retransmission
//! - [`assoc`]: per-peer association state machine
//! - [`sess`]: control plane session manager
//! - [`upf`]: user plane session table and usage reporting
//! - [`heartbeat`]: per-association liveness supervision
//! - [`dispatch`]: routing of decoded messages
//! - [`node`]: wiring of all of the above into one endpoint
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mob5g_n4::{config::N4Config, node::{N4Node, Role}, store::MemoryStore, upstream::LogSink};
//!
//! # async fn run() -> mob5g_n4::N4Result<()> {
//! let config = N4Config::from_yaml("node_id: upf-1").expect("valid config");
//! let node = N4Node::start(config, Role::UserPlane, Arc::new(MemoryStore::new()), Arc::new(LogSink)).await?;
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod assoc;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod node;
pub mod sess;
pub mod store;
pub mod transport;
pub mod upf;
pub mod upstream;
pub mod xact;

#[cfg(test)]
mod testing;

pub use assoc::{Association, AssociationManager, AssociationState, ReleaseReason};
pub use config::{ConfigError, N4Config};
pub use error::{N4Error, N4Result};
pub use node::{N4Node, Role};
pub use sess::{RuleSet, Session, SessionChanges, SessionManager, SessionState};
pub use store::{open_store, KeyedStore, MemoryStore, MongoStore, StoreError};
pub use upstream::{UpstreamEvent, UpstreamSink, UsageRecord};
