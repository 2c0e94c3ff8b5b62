//! # apply
//!
//! why: hand committed commands to the service in log order, exactly once
//! relations: produced by peer.rs under the peer lock, consumed by the embedding service
//! what: ApplyMsg

use raft_core::LogEntry;

/// A committed log entry, ready for the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

impl From<LogEntry> for ApplyMsg {
    fn from(entry: LogEntry) -> Self {
        Self {
            index: entry.index,
            term: entry.term,
            command: entry.command,
        }
    }
}
