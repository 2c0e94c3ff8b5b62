//! # state
//!
//! why: name the exact slice of node state that must survive a crash
//! relations: produced by node.rs (hard_state), encoded by raft-storage
//! what: PersistentState

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;

/// Term, vote and log, saved together as one blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,
}
