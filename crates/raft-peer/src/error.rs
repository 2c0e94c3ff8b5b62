//! # error
//!
//! why: surface the few failures a running peer cannot resolve inside the protocol
//! relations: wraps raft-core and raft-storage errors for callers of peer.rs
//! what: RaftError

use raft_core::{CoreError, NodeId};
use raft_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("raft storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("node {id} is not a member of the cluster")]
    NotAMember { id: NodeId },
}
