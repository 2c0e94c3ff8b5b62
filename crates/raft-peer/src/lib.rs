//! # raft-peer
//!
//! why: run a raft-core state machine as a live cluster member
//! relations: drives raft-core, persists through raft-storage, talks through a caller-supplied Transport
//! what: Raft handle, election and replication loops, inbound dispatch, apply channel
//!
//! A peer is created with [`Raft::new`] inside a tokio runtime. It restores
//! its saved state, spawns its two background loops and returns at once.
//! Commands go in through [`Raft::start`]; committed commands come out of the
//! apply channel as [`ApplyMsg`]s. Inbound requests from other peers are fed
//! to [`Raft::handle_message`].

mod apply;
mod election;
mod error;
mod peer;
mod replication;
mod transport;

pub use apply::ApplyMsg;
pub use error::RaftError;
pub use peer::{Proposal, Raft, RaftStatus};
pub use transport::Transport;

pub use raft_core::{LogEntry, NodeId, NodeState, RaftConfig, RaftMessage};
