//! # cluster harness
//!
//! why: run real peers against each other without sockets
//! relations: used by cluster_tests.rs; implements raft-peer's Transport
//! what: simulated network (connect, partition, unreliable), Cluster with agreement checks

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use raft_peer::{ApplyMsg, NodeId, Raft, RaftConfig, RaftMessage, Transport};
use raft_storage::InMemoryStorage;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::sleep;

/// Longest time a healthy cluster should need to elect a leader
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(1000);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// -- network --

#[derive(Default)]
struct NetState {
    peers: HashMap<NodeId, Raft>,
    connected: HashSet<NodeId>,
    /// peers only reach peers in the same group
    group: HashMap<NodeId, u32>,
    unreliable: bool,
    calls: u64,
}

impl NetState {
    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        self.connected.contains(&from)
            && self.connected.contains(&to)
            && self.group.get(&from).copied().unwrap_or(0) == self.group.get(&to).copied().unwrap_or(0)
    }
}

/// In-process network routing calls straight into `Raft::handle_message`
#[derive(Clone, Default)]
pub struct Network {
    state: Arc<Mutex<NetState>>,
}

impl Network {
    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap()
    }

    pub fn endpoint(&self, from: NodeId) -> Arc<dyn Transport> {
        Arc::new(Endpoint {
            from,
            net: self.clone(),
        })
    }

    pub fn register(&self, id: NodeId, raft: Raft) {
        self.lock().peers.insert(id, raft);
    }

    pub fn unregister(&self, id: NodeId) {
        self.lock().peers.remove(&id);
    }

    pub fn set_connected(&self, id: NodeId, connected: bool) {
        let mut net = self.lock();
        if connected {
            net.connected.insert(id);
        } else {
            net.connected.remove(&id);
        }
    }

    pub fn set_group(&self, id: NodeId, group: u32) {
        self.lock().group.insert(id, group);
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.lock().unreliable = unreliable;
    }

    pub fn calls(&self) -> u64 {
        self.lock().calls
    }

    fn route(&self, from: NodeId, to: NodeId) -> Option<Raft> {
        let mut net = self.lock();
        net.calls += 1;
        if !net.reachable(from, to) {
            return None;
        }
        net.peers.get(&to).cloned()
    }

    fn unreliable(&self) -> bool {
        self.lock().unreliable
    }
}

struct Endpoint {
    from: NodeId,
    net: Network,
}

/// Random delay and whether to drop, drawn without holding the rng across an await
fn chaos() -> (Duration, bool) {
    let mut rng = rand::rng();
    (Duration::from_millis(rng.random_range(0..27)), rng.random_range(0..10) == 0)
}

#[async_trait]
impl Transport for Endpoint {
    async fn call(&self, target: NodeId, message: RaftMessage) -> Option<RaftMessage> {
        let unreliable = self.net.unreliable();
        if unreliable {
            let (delay, lost) = chaos();
            sleep(delay).await;
            if lost {
                return None;
            }
        }

        let peer = self.net.route(self.from, target)?;
        let reply = peer.handle_message(message)?;

        if unreliable {
            let (delay, lost) = chaos();
            sleep(delay).await;
            if lost {
                return None;
            }
        }
        // the reply is lost if the link was cut while the request was handled
        if !self.net.lock().reachable(target, self.from) {
            return None;
        }
        Some(reply)
    }
}

// -- apply log collection --

#[derive(Default)]
struct Applied {
    /// per peer: index -> command, as delivered on its apply channel
    logs: Vec<BTreeMap<u64, Vec<u8>>>,
    /// per peer: incremented on every restart so stale channels are ignored
    generation: Vec<u64>,
    errors: Vec<String>,
}

impl Applied {
    fn record(&mut self, peer: usize, generation: u64, msg: ApplyMsg) {
        if self.generation[peer] != generation {
            return;
        }
        for (other, log) in self.logs.iter().enumerate() {
            if let Some(existing) = log.get(&msg.index) {
                if *existing != msg.command {
                    self.errors.push(format!(
                        "commit index={} server={} {:?} != server={} {:?}",
                        msg.index, peer, msg.command, other, existing
                    ));
                }
            }
        }
        let expected = self.logs[peer].len() as u64 + 1;
        if msg.index != expected {
            self.errors.push(format!(
                "server {} applied index {} out of order, expected {}",
                peer, msg.index, expected
            ));
        }
        self.logs[peer].insert(msg.index, msg.command);
    }
}

async fn collect_applies(
    peer: usize,
    generation: u64,
    mut rx: UnboundedReceiver<ApplyMsg>,
    applied: Arc<Mutex<Applied>>,
) {
    while let Some(msg) = rx.recv().await {
        applied.lock().unwrap().record(peer, generation, msg);
    }
}

// -- cluster --

pub struct Cluster {
    pub n: usize,
    net: Network,
    config: RaftConfig,
    rafts: Vec<Option<Raft>>,
    storages: Vec<Arc<InMemoryStorage>>,
    connected: Vec<bool>,
    applied: Arc<Mutex<Applied>>,
}

impl Cluster {
    /// Start `n` connected peers with ids `0..n`
    pub fn new(n: usize, unreliable: bool) -> Self {
        init_tracing();
        let net = Network::default();
        net.set_unreliable(unreliable);
        let mut cluster = Self {
            n,
            net,
            config: RaftConfig::default(),
            rafts: vec![None; n],
            storages: (0..n).map(|_| Arc::new(InMemoryStorage::new())).collect(),
            connected: vec![false; n],
            applied: Arc::new(Mutex::new(Applied {
                logs: vec![BTreeMap::new(); n],
                generation: vec![0; n],
                errors: Vec::new(),
            })),
        };
        for i in 0..n {
            cluster.start_one(i);
            cluster.connect(i);
        }
        cluster
    }

    fn ids(&self) -> Vec<NodeId> {
        (0..self.n as NodeId).collect()
    }

    pub fn raft(&self, i: usize) -> &Raft {
        self.rafts[i].as_ref().expect("peer is not running")
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.net.set_unreliable(unreliable);
    }

    /// Start or restart peer `i` from its saved state. Connectivity is unchanged.
    pub fn start_one(&mut self, i: usize) {
        self.crash_one(i);

        // a fresh copy so a straggling handler of the old instance cannot write into it
        let storage = Arc::new(self.storages[i].copy());
        self.storages[i] = storage.clone();

        let generation = {
            let mut applied = self.applied.lock().unwrap();
            applied.generation[i] += 1;
            applied.logs[i].clear();
            applied.generation[i]
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let raft = Raft::new(
            i as NodeId,
            self.ids(),
            self.net.endpoint(i as NodeId),
            storage,
            tx,
            self.config.clone(),
        )
        .expect("peer failed to start");
        tokio::spawn(collect_applies(i, generation, rx, self.applied.clone()));
        self.net.register(i as NodeId, raft.clone());
        self.rafts[i] = Some(raft);
    }

    /// Kill peer `i`, keeping what it persisted
    pub fn crash_one(&mut self, i: usize) {
        self.net.unregister(i as NodeId);
        if let Some(raft) = self.rafts[i].take() {
            raft.kill();
            let saved = self.storages[i].copy();
            self.storages[i] = Arc::new(saved);
        }
    }

    pub fn is_running(&self, i: usize) -> bool {
        self.rafts[i].is_some()
    }

    pub fn connect(&mut self, i: usize) {
        self.connected[i] = true;
        self.net.set_connected(i as NodeId, true);
    }

    pub fn disconnect(&mut self, i: usize) {
        self.connected[i] = false;
        self.net.set_connected(i as NodeId, false);
    }

    /// Split connected peers into groups that cannot reach each other
    pub fn partition(&mut self, groups: &[&[usize]]) {
        for (group, members) in groups.iter().enumerate() {
            for &i in members.iter() {
                self.net.set_group(i as NodeId, group as u32);
            }
        }
    }

    pub fn heal(&mut self) {
        for i in 0..self.n {
            self.net.set_group(i as NodeId, 0);
        }
    }

    fn live(&self) -> impl Iterator<Item = (usize, &Raft)> + '_ {
        self.rafts
            .iter()
            .enumerate()
            .filter(|(i, _)| self.connected[*i])
            .filter_map(|(i, r)| r.as_ref().map(|r| (i, r)))
    }

    /// Wait for exactly one leader among connected peers and return it.
    /// Panics if any term ever has two leaders.
    pub async fn check_one_leader(&self) -> usize {
        for _ in 0..10 {
            let pause = rand::rng().random_range(450..550);
            sleep(Duration::from_millis(pause)).await;

            let mut leaders: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
            for (i, raft) in self.live() {
                let (term, is_leader) = raft.get_state();
                if is_leader {
                    leaders.entry(term).or_default().push(i);
                }
            }
            for (term, ids) in &leaders {
                assert!(ids.len() <= 1, "term {} has {} (>1) leaders: {:?}", term, ids.len(), ids);
            }
            if let Some((_, ids)) = leaders.iter().next_back() {
                return ids[0];
            }
        }
        panic!("expected one leader, got none");
    }

    /// All connected peers agree on the term; returns it
    pub fn check_terms(&self) -> u64 {
        let mut term = None;
        for (i, raft) in self.live() {
            let (t, _) = raft.get_state();
            match term {
                None => term = Some(t),
                Some(expected) => assert_eq!(t, expected, "server {} disagrees on term", i),
            }
        }
        term.expect("no connected peers")
    }

    pub fn check_no_leader(&self) {
        for (i, raft) in self.live() {
            assert!(!raft.get_state().1, "server {} is leader, expected no leader", i);
        }
    }

    fn check_apply_errors(&self) {
        let applied = self.applied.lock().unwrap();
        assert!(applied.errors.is_empty(), "apply errors: {:?}", applied.errors);
    }

    /// How many peers applied `index`, and the command they agree on
    pub fn n_committed(&self, index: u64) -> (usize, Option<Vec<u8>>) {
        self.check_apply_errors();
        let applied = self.applied.lock().unwrap();
        let mut count = 0;
        let mut command: Option<Vec<u8>> = None;
        for log in &applied.logs {
            if let Some(c) = log.get(&index) {
                if let Some(existing) = &command {
                    assert_eq!(existing, c, "committed values do not match at index {}", index);
                }
                count += 1;
                command = Some(c.clone());
            }
        }
        (count, command)
    }

    pub fn applied_anywhere(&self, command: &[u8]) -> bool {
        let applied = self.applied.lock().unwrap();
        applied.logs.iter().any(|log| log.values().any(|c| c == command))
    }

    /// Submit `command` until some leader commits it on at least `expected`
    /// peers, returning its index. Without `retry`, a leader that fails to
    /// commit within two seconds fails the test.
    pub async fn one(&self, command: &[u8], expected: usize, retry: bool) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut next = 0;
        while Instant::now() < deadline {
            let mut index = None;
            for _ in 0..self.n {
                next = (next + 1) % self.n;
                if !self.connected[next] {
                    continue;
                }
                if let Some(raft) = &self.rafts[next] {
                    if let Ok(proposal) = raft.start(command.to_vec()) {
                        if proposal.is_leader {
                            index = Some(proposal.index);
                            break;
                        }
                    }
                }
            }

            if let Some(index) = index {
                let started = Instant::now();
                while started.elapsed() < Duration::from_secs(2) {
                    let (count, committed) = self.n_committed(index);
                    if count >= expected && committed.as_deref() == Some(command) {
                        return index;
                    }
                    sleep(Duration::from_millis(20)).await;
                }
                assert!(retry, "one({:?}) failed to reach agreement", String::from_utf8_lossy(command));
            } else {
                sleep(Duration::from_millis(50)).await;
            }
        }
        panic!("one({:?}) failed to reach agreement", String::from_utf8_lossy(command));
    }

    /// Wait until `index` is applied on at least `count` peers
    pub async fn wait(&self, index: u64, count: usize) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let (n, command) = self.n_committed(index);
            if n >= count {
                return command.expect("counted peers carry a command");
            }
            assert!(Instant::now() < deadline, "only {} peers applied index {}, wanted {}", n, index, count);
            sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn calls(&self) -> u64 {
        self.net.calls()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for raft in self.rafts.iter().flatten() {
            raft.kill();
        }
    }
}

/// A distinct command for tests that only need uniqueness
pub fn cmd(tag: impl std::fmt::Display) -> Vec<u8> {
    format!("cmd-{}", tag).into_bytes()
}
