//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via raft-storage
//! what: LogEntry struct, up-to-date comparison, contiguity checking

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }
}

/// Returns true if a log ending at (`last_term`, `last_index`) is at least as
/// up to date as one ending at (`our_term`, `our_index`).
///
/// Terms are compared first; only equal last terms fall back to length.
pub fn is_up_to_date(last_term: u64, last_index: u64, our_term: u64, our_index: u64) -> bool {
    if last_term != our_term {
        return last_term > our_term;
    }
    last_index >= our_index
}

/// Checks that `entries` carries exactly the indices `1..=entries.len()`.
pub fn check_contiguous(entries: &[LogEntry]) -> Result<(), CoreError> {
    for (position, entry) in entries.iter().enumerate() {
        let expected = position as u64 + 1;
        if entry.index != expected {
            return Err(CoreError::NonContiguousLog {
                position,
                expected,
                found: entry.index,
            });
        }
    }
    Ok(())
}
