//! # timer
//!
//! why: randomized deadlines break symmetry so one candidate usually wins a round
//! relations: owned next to RaftNode by raft-peer, configured by config.rs
//! what: ElectionTimer with follower and candidacy deadlines

use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::RaftConfig;
use crate::node::NodeState;

/// Tracks when a follower should stand for election and when a candidate
/// should give up on its current round.
#[derive(Debug, Clone)]
pub struct ElectionTimer {
    timeout_ms: RangeInclusive<u64>,
    election_deadline: Instant,
    candidacy_deadline: Instant,
}

impl ElectionTimer {
    /// Create a timer with both deadlines freshly drawn from now
    pub fn new(config: &RaftConfig) -> Self {
        let now = Instant::now();
        let mut timer = Self {
            timeout_ms: config.election_timeout_range(),
            election_deadline: now,
            candidacy_deadline: now,
        };
        timer.reset_at(now);
        timer
    }

    /// Redraw both deadlines from the current instant
    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    pub fn reset_at(&mut self, now: Instant) {
        self.election_deadline = now + self.draw();
        self.candidacy_deadline = now + self.draw();
    }

    /// Whether the deadline relevant to `role` has passed at `now`
    pub fn is_due(&self, role: NodeState, now: Instant) -> bool {
        match role {
            NodeState::Follower => now >= self.election_deadline,
            NodeState::Candidate => now >= self.candidacy_deadline,
            NodeState::Leader => false,
        }
    }

    fn draw(&self) -> Duration {
        let ms = rand::rng().random_range(self.timeout_ms.clone());
        Duration::from_millis(ms)
    }
}
