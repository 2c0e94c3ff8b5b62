//! # error
//!
//! why: report invalid configuration and corrupt restored state
//! relations: returned by config.rs and node.rs, wrapped by raft-peer
//! what: CoreError

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid raft config: {0}")]
    InvalidConfig(String),

    #[error("log entry at position {position} has index {found}, expected {expected}")]
    NonContiguousLog {
        position: usize,
        expected: u64,
        found: u64,
    },
}
