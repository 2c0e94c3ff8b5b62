//! # transport
//!
//! why: the peer talks to other peers only through this seam
//! relations: implemented by the embedding service (or the test network), called by election.rs and replication.rs
//! what: Transport trait

use async_trait::async_trait;
use raft_core::{NodeId, RaftMessage};

/// Delivers one request to a remote peer and waits for its reply.
///
/// `None` means the call failed: the request or the reply was lost, the
/// target is down, or the transport gave up. Callers treat that as a dropped
/// message and rely on the next tick to try again, so implementations should
/// bound how long a call can take.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, target: NodeId, message: RaftMessage) -> Option<RaftMessage>;
}
