//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-peer (locks, timers, transport), persisted via raft-storage
//! what: state machine, election logic, log management, message types, timing

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod state;
pub mod timer;

pub use config::RaftConfig;
pub use error::CoreError;
pub use log::LogEntry;
pub use message::RaftMessage;
pub use node::{NodeId, NodeState, RaftNode};
pub use state::PersistentState;
pub use timer::ElectionTimer;
