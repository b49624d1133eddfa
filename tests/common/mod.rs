//! Shared test harness: an in-memory mesh standing in for the ad-hoc
//! routing layer.
//!
//! The [`Mesh`] is a registry of node inboxes plus an adjacency map per
//! broadcast radius. Each engine gets a [`MeshPort`] implementing the
//! `Routing` trait; unicasts are delivered to any registered node (the
//! routing layer is assumed to find a path), broadcasts fan out to the
//! peers registered inside the sender's radius. Every unicast is also
//! recorded in a tap so tests can assert on who asked whom.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, RwLock};

use rhpman::{
    decode_envelope, Config, ConstantFitness, DataItem, InboundDatagram, LookupObserver, NodeId,
    Payload, ReplicationEngine, Routing,
};

#[derive(Default)]
struct MeshState {
    inboxes: HashMap<NodeId, mpsc::Sender<InboundDatagram>>,
    /// Peers reachable with the neighborhood TTL (h).
    neighborhood: HashMap<NodeId, HashSet<NodeId>>,
    /// Peers reachable with the election TTL (h_r); superset of the above.
    election: HashMap<NodeId, HashSet<NodeId>>,
}

/// In-memory mesh connecting engine instances.
#[derive(Default)]
pub struct Mesh {
    state: RwLock<MeshState>,
    /// Every unicast delivered, as `(from, to, payload)`.
    unicast_log: StdMutex<Vec<(NodeId, NodeId, Payload)>>,
}

impl Mesh {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self::default())
    }

    pub async fn register(&self, node: NodeId, inbox: mpsc::Sender<InboundDatagram>) {
        self.state.write().await.inboxes.insert(node, inbox);
    }

    /// Put `a` and `b` inside each other's neighborhood (and therefore
    /// election) radius.
    pub async fn connect(&self, a: NodeId, b: NodeId) {
        let mut state = self.state.write().await;
        state.neighborhood.entry(a).or_default().insert(b);
        state.neighborhood.entry(b).or_default().insert(a);
        state.election.entry(a).or_default().insert(b);
        state.election.entry(b).or_default().insert(a);
    }

    /// Put `a` and `b` inside each other's election radius only; beacons
    /// do not reach that far.
    pub async fn connect_election_only(&self, a: NodeId, b: NodeId) {
        let mut state = self.state.write().await;
        state.election.entry(a).or_default().insert(b);
        state.election.entry(b).or_default().insert(a);
    }

    /// Sever every link between `a` and `b`.
    pub async fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        for map in [&mut state.neighborhood, &mut state.election] {
            if let Some(peers) = map.get_mut(&a) {
                peers.remove(&b);
            }
            if let Some(peers) = map.get_mut(&b) {
                peers.remove(&a);
            }
        }
    }

    /// Take `node` out of the mesh entirely, as if it moved away.
    pub async fn isolate(&self, node: NodeId) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        for map in [&mut state.neighborhood, &mut state.election] {
            map.remove(&node);
            for peers in map.values_mut() {
                peers.remove(&node);
            }
        }
    }

    /// Every unicast seen so far.
    pub fn unicasts(&self) -> Vec<(NodeId, NodeId, Payload)> {
        self.unicast_log.lock().unwrap().clone()
    }

    async fn deliver(&self, from: NodeId, to: NodeId, bytes: Vec<u8>) {
        let inbox = {
            let state = self.state.read().await;
            state.inboxes.get(&to).cloned()
        };
        if let Some(inbox) = inbox {
            let _ = inbox
                .send(InboundDatagram {
                    source: from,
                    bytes,
                })
                .await;
        }
    }

    async fn broadcast(&self, from: NodeId, bytes: Vec<u8>, election_radius: bool) {
        let peers: Vec<NodeId> = {
            let state = self.state.read().await;
            let map = if election_radius {
                &state.election
            } else {
                &state.neighborhood
            };
            map.get(&from).map(|peers| peers.iter().copied().collect()).unwrap_or_default()
        };
        for peer in peers {
            self.deliver(from, peer, bytes.clone()).await;
        }
    }
}

/// One node's attachment point to the mesh.
pub struct MeshPort {
    mesh: Arc<Mesh>,
    node_id: NodeId,
}

impl MeshPort {
    pub fn new(mesh: Arc<Mesh>, node_id: NodeId) -> Self {
        Self { mesh, node_id }
    }
}

#[async_trait::async_trait]
impl Routing for MeshPort {
    fn own_node_id(&self) -> Result<NodeId> {
        Ok(self.node_id)
    }

    async fn unicast(&self, dest: NodeId, bytes: Vec<u8>) -> Result<()> {
        if let Ok(envelope) = decode_envelope(&bytes) {
            self.mesh
                .unicast_log
                .lock()
                .unwrap()
                .push((self.node_id, dest, envelope.payload));
        }
        self.mesh.deliver(self.node_id, dest, bytes).await;
        Ok(())
    }

    async fn broadcast_neighborhood(&self, bytes: Vec<u8>) -> Result<()> {
        self.mesh.broadcast(self.node_id, bytes, false).await;
        Ok(())
    }

    async fn broadcast_election(&self, bytes: Vec<u8>) -> Result<()> {
        self.mesh.broadcast(self.node_id, bytes, true).await;
        Ok(())
    }
}

/// Observer that records every lookup outcome.
#[derive(Default)]
pub struct RecordingObserver {
    successes: StdMutex<Vec<u64>>,
    failures: StdMutex<Vec<u64>>,
}

impl RecordingObserver {
    pub fn successes(&self) -> Vec<u64> {
        self.successes.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<u64> {
        self.failures.lock().unwrap().clone()
    }
}

impl LookupObserver for RecordingObserver {
    fn on_success(&self, item: &DataItem) {
        self.successes.lock().unwrap().push(item.id);
    }

    fn on_failure(&self, data_id: u64) {
        self.failures.lock().unwrap().push(data_id);
    }
}

/// Timing configuration coherent for simulation: announcements come more
/// often than the missing-replication timeout, elections decide quickly.
pub fn fast_config() -> Config {
    Config {
        profile_delay: Duration::from_secs(1),
        request_timeout: Duration::from_secs(5),
        missing_replication_timeout: Duration::from_secs(5),
        profile_timeout: Duration::from_secs(5),
        election_timeout: Duration::from_secs(1),
        election_cooldown: Duration::from_secs(1),
        storage_capacity: 8,
        buffer_capacity: 8,
        ..Config::default()
    }
}

/// Build, register, and start one node on the mesh.
pub async fn spawn_node(
    mesh: &Arc<Mesh>,
    node_id: NodeId,
    config: Config,
    fitness: f64,
) -> (ReplicationEngine<MeshPort>, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::default());
    let engine = ReplicationEngine::builder(MeshPort::new(mesh.clone(), node_id))
        .config(config)
        .observer(observer.clone())
        .fitness(Arc::new(ConstantFitness(fitness)))
        .build();
    mesh.register(node_id, engine.datagram_sender()).await;
    engine.start().await.expect("engine start failed");
    (engine, observer)
}

/// Let every ready task run; with paused time a short sleep is a
/// deterministic synchronization point.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Route engine traces to the test output, honoring `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
