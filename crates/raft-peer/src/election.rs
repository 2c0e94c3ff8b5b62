//! # election
//!
//! why: turn an expired election timer into a vote round and tally its replies
//! relations: background loop spawned by peer.rs, rules live in raft-core's RaftNode
//! what: election loop, vote broadcast, vote reply handling

use std::time::Instant;

use raft_core::{NodeId, RaftMessage};
use tokio::time::{self, MissedTickBehavior};

use crate::peer::Raft;

/// Poll the election timer until the peer is killed
pub(crate) async fn run(raft: Raft) {
    let mut ticker = time::interval(raft.config().tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if raft.is_killed() {
            break;
        }
        if let Some((term, request)) = raft.start_election_if_due() {
            raft.broadcast_vote_request(term, request);
        }
    }
    tracing::debug!(node = raft.id(), "election loop stopped");
}

impl Raft {
    /// Become candidate if the timer for our role has expired. Returns the
    /// round's term and the request to broadcast once our self-vote is saved.
    fn start_election_if_due(&self) -> Option<(u64, RaftMessage)> {
        let mut st = self.lock();
        if !st.timer.is_due(st.node.state, Instant::now()) {
            return None;
        }
        let request = st.node.start_election();
        st.timer.reset();
        self.persist(&mut st).ok()?;
        // a lone member holds a majority with its own vote
        st.node.try_become_leader();
        Some((st.node.current_term, request))
    }

    fn broadcast_vote_request(&self, term: u64, request: RaftMessage) {
        for &peer in self.peers() {
            let raft = self.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let reply = raft.transport().call(peer, request).await;
                raft.handle_vote_reply(peer, term, reply);
            });
        }
    }

    fn handle_vote_reply(&self, peer: NodeId, round_term: u64, reply: Option<RaftMessage>) {
        if self.is_killed() {
            return;
        }
        let (term, vote_granted) = match reply {
            Some(RaftMessage::VoteResponse { term, vote_granted }) => (term, vote_granted),
            Some(other) => {
                tracing::warn!(node = self.id(), peer, kind = other.kind(), "unexpected reply to vote request");
                return;
            }
            None => {
                tracing::trace!(node = self.id(), peer, term = round_term, "vote request lost");
                return;
            }
        };

        let mut st = self.lock();
        // a reply from an abandoned round only matters if it reveals a newer
        // term; handle_vote_response repeats the same-term check on its own
        if term <= st.node.current_term && st.node.current_term != round_term {
            return;
        }
        if st.node.handle_vote_response(term, vote_granted, peer) {
            tracing::info!(node = self.id(), term, "won election");
        }
        // failure is logged inside persist; nothing waits on this write
        let _ = self.persist(&mut st);
    }
}
