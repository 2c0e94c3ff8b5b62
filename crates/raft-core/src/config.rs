//! # config
//!
//! why: keep every timing knob of a raft node in one validated place
//! relations: read by timer.rs for deadlines, by raft-peer for loop periods
//! what: RaftConfig with defaults, serde support, validation

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Timing configuration, all values in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound (inclusive) of the randomized election timeout
    pub election_timeout_max: u64,
    /// Period of the leader's replication loop; every tick doubles as a heartbeat
    pub heartbeat_interval: u64,
    /// Period at which the election loop checks its deadlines
    pub tick_interval: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 100,
            election_timeout_max: 200,
            heartbeat_interval: 10,
            tick_interval: 10,
        }
    }
}

impl RaftConfig {
    /// Reject configurations under which heartbeats cannot suppress elections
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.election_timeout_min == 0 {
            return Err(CoreError::InvalidConfig(
                "election_timeout_min must be positive".into(),
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(CoreError::InvalidConfig(format!(
                "election_timeout_min ({}) exceeds election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(CoreError::InvalidConfig(format!(
                "heartbeat_interval ({}) must be in 1..{}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.tick_interval == 0 || self.tick_interval >= self.election_timeout_min {
            return Err(CoreError::InvalidConfig(format!(
                "tick_interval ({}) must be in 1..{}",
                self.tick_interval, self.election_timeout_min
            )));
        }
        Ok(())
    }

    pub fn election_timeout_range(&self) -> RangeInclusive<u64> {
        self.election_timeout_min..=self.election_timeout_max
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_interval)
    }
}
