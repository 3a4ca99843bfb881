//! OfficePal Core Library
//!
//! Peer mesh for LAN chat: mDNS discovery, a TCP publish/subscribe bus
//! and a replicated, seqno-indexed state log reconciled by timestamp rank.

pub mod types;
pub mod error;
pub mod config;
pub mod queue;
pub mod wire;
pub mod discovery;
pub mod transport;
pub mod bus;
pub mod reconcile;
pub mod storage;
pub mod node;

pub use types::*;
pub use error::{MeshError, Result};
pub use config::{ConfigError, MeshConfig};
pub use queue::{EventQueue, QueueClosed};
pub use wire::{ChatMessage, StateChange, StateEntry, StateEvent, WireMessage};
pub use discovery::PeerDirectory;
pub use bus::{MessageBus, Publish};
pub use reconcile::{reconcile, ReconcileError, Reconciliation, ReconciliationEngine, ReplicaLog};
pub use storage::LogStore;
pub use node::{MeshEvent, Node};
