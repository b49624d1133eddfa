//! # Protocol Engine
//!
//! This module provides the main entry point for running an RHPMAN node. A
//! [`ReplicationEngine`] combines the leaf components (storage, buffer,
//! neighbor tables, election state, lookup tracker) into a single
//! event-driven engine wired to the routing collaborator.
//!
//! ## Architecture
//!
//! The engine uses the actor pattern: the public handle is cheap to clone
//! and communicates over async channels with a private actor that owns all
//! mutable state and processes events sequentially. Inbound datagrams,
//! application commands, and timer firings are all serialized through one
//! `select!` loop, which gives the cooperative single-threaded execution
//! the protocol assumes.
//!
//! ## Timers
//!
//! Every scheduled event is data: the actor keeps the next beacon time,
//! the replica watchdog deadline, the election decision deadline, and the
//! per-entry expiries inside the tables, then sleeps until the earliest of
//! them. Cancelling a timer is overwriting the stored deadline, so a
//! refresh can never race a stale firing.
//!
//! ## Quick Start
//!
//! ```ignore
//! let engine = ReplicationEngine::builder(routing)
//!     .config(Config::default())
//!     .observer(observer)
//!     .build();
//! engine.start().await?;
//!
//! engine.save(DataItem::new(42, my_id, payload)).await?;
//! engine.lookup(42).await?;  // outcome arrives via the observer
//! ```

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use lru::LruCache;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Role};
use crate::election::ElectionState;
use crate::fitness::{DeliveryEstimator, ElectionFitness, FitnessContext, ReferenceFitness};
use crate::lookup::LookupTracker;
use crate::messages::{
    decode_envelope, encode_envelope, DataItem, Envelope, MessageId, NodeId, Payload, NO_NODE,
};
use crate::profiles::{ProfileTable, ReplicaSet};
use crate::routing::{LookupObserver, NoopObserver, Routing};
use crate::storage::SlotStore;

/// Maximum envelope ids remembered for duplicate suppression.
/// Bounds the receive-path replay table; oldest ids age out first.
const MAX_SEEN_ENVELOPES: usize = 10_000;

/// Command channel depth between handle and actor.
const COMMAND_CHANNEL_DEPTH: usize = 256;

/// Inbound datagram channel depth. Sized for a burst of beacons from a
/// dense neighborhood.
const DATAGRAM_CHANNEL_DEPTH: usize = 1024;

/// Lifecycle state of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Running,
    Stopped,
}

/// One datagram handed up by the routing layer.
#[derive(Clone, Debug)]
pub struct InboundDatagram {
    /// Node the routing layer received the datagram from.
    pub source: NodeId,
    /// The encoded envelope.
    pub bytes: Vec<u8>,
}

enum Command {
    Lookup(u64),
    Save(DataItem, oneshot::Sender<bool>),
    FreeSpace(oneshot::Sender<u32>),
    GetRole(oneshot::Sender<Role>),
    Stop(oneshot::Sender<()>),
}

struct Lifecycle {
    state: LifecycleState,
    cmd_tx: Option<mpsc::Sender<Command>>,
    /// Receivers parked here between construction and start.
    parked: Option<(mpsc::Receiver<Command>, mpsc::Receiver<InboundDatagram>)>,
}

struct EngineShared<R: Routing> {
    routing: Arc<R>,
    config: Config,
    observer: Arc<dyn LookupObserver>,
    fitness: Arc<dyn ElectionFitness>,
    datagram_tx: mpsc::Sender<InboundDatagram>,
    cmd_tx: mpsc::Sender<Command>,
    lifecycle: Mutex<Lifecycle>,
}

/// Handle to a running (or not yet started) protocol engine.
pub struct ReplicationEngine<R: Routing> {
    shared: Arc<EngineShared<R>>,
}

impl<R: Routing> Clone for ReplicationEngine<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Builder for [`ReplicationEngine`].
pub struct EngineBuilder<R: Routing> {
    routing: R,
    config: Config,
    observer: Arc<dyn LookupObserver>,
    fitness: Arc<dyn ElectionFitness>,
}

impl<R: Routing> EngineBuilder<R> {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Supply the application's lookup callbacks.
    pub fn observer(mut self, observer: Arc<dyn LookupObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Supply the election fitness function.
    pub fn fitness(mut self, fitness: Arc<dyn ElectionFitness>) -> Self {
        self.fitness = fitness;
        self
    }

    pub fn build(self) -> ReplicationEngine<R> {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_CHANNEL_DEPTH);

        ReplicationEngine {
            shared: Arc::new(EngineShared {
                routing: Arc::new(self.routing),
                config: self.config,
                observer: self.observer,
                fitness: self.fitness,
                datagram_tx,
                cmd_tx,
                lifecycle: Mutex::new(Lifecycle {
                    state: LifecycleState::NotStarted,
                    cmd_tx: None,
                    parked: Some((cmd_rx, datagram_rx)),
                }),
            }),
        }
    }
}

impl<R: Routing> ReplicationEngine<R> {
    /// Start building an engine around the given routing collaborator.
    pub fn builder(routing: R) -> EngineBuilder<R> {
        EngineBuilder {
            routing,
            config: Config::default(),
            observer: Arc::new(NoopObserver),
            fitness: Arc::new(ReferenceFitness),
        }
    }

    /// Convenience constructor with default observer and fitness.
    pub fn new(config: Config, routing: R) -> Self {
        Self::builder(routing).config(config).build()
    }

    /// The routing collaborator this engine sends through.
    pub fn routing(&self) -> &R {
        &self.shared.routing
    }

    /// Sender the routing layer pushes received datagrams into.
    ///
    /// Datagrams delivered before `start()` wait in the channel and are
    /// processed once the engine runs.
    pub fn datagram_sender(&self) -> mpsc::Sender<InboundDatagram> {
        self.shared.datagram_tx.clone()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        self.shared.lifecycle.lock().await.state
    }

    /// Start the engine: latch the node id, initialize storage, begin
    /// beaconing, arm the replica watchdog, and kick an initial election.
    ///
    /// Idempotent against double-start. Failure to obtain the node id
    /// aborts the start and leaves the engine NotStarted.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        match lifecycle.state {
            LifecycleState::Running => {
                debug!("ignoring start on an already running engine");
                return Ok(());
            }
            LifecycleState::Stopped => {
                bail!("a stopped engine cannot be restarted");
            }
            LifecycleState::NotStarted => {}
        }

        let node_id = self
            .shared
            .routing
            .own_node_id()
            .context("failed to obtain own node id from the routing layer")?;
        if node_id == NO_NODE {
            bail!("routing layer allocated the reserved node id");
        }

        let (cmd_rx, datagram_rx) = lifecycle
            .parked
            .take()
            .context("engine channels already consumed")?;

        let actor = EngineActor::new(
            node_id,
            self.shared.config.clone(),
            self.shared.routing.clone(),
            self.shared.observer.clone(),
            self.shared.fitness.clone(),
        );
        tokio::spawn(actor.run(cmd_rx, datagram_rx));

        lifecycle.cmd_tx = Some(self.shared.cmd_tx.clone());
        lifecycle.state = LifecycleState::Running;
        info!(node = node_id, "replication engine started");
        Ok(())
    }

    /// Stop the engine, cancelling every scheduled event.
    ///
    /// Stop on a NotStarted engine is a misuse: it logs an error and does
    /// nothing. Double-stop is ignored.
    pub async fn stop(&self) {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        match lifecycle.state {
            LifecycleState::NotStarted => {
                error!("stop called on an engine that was never started");
                return;
            }
            LifecycleState::Stopped => {
                debug!("ignoring stop on an already stopped engine");
                return;
            }
            LifecycleState::Running => {}
        }

        if let Some(cmd_tx) = lifecycle.cmd_tx.take() {
            let (tx, rx) = oneshot::channel();
            if cmd_tx.send(Command::Stop(tx)).await.is_ok() {
                let _ = rx.await;
            }
        }
        lifecycle.state = LifecycleState::Stopped;
    }

    /// Look up a data item. The outcome arrives through the observer:
    /// exactly one of `on_success` or `on_failure` fires.
    pub async fn lookup(&self, data_id: u64) -> Result<()> {
        self.command_sender()
            .await?
            .send(Command::Lookup(data_id))
            .await
            .map_err(|_| anyhow::anyhow!("engine actor closed"))
    }

    /// Save a data item: store it locally and disseminate it.
    ///
    /// Returns whether local storage had room; dissemination proceeds
    /// regardless of the local outcome.
    pub async fn save(&self, item: DataItem) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.command_sender()
            .await?
            .send(Command::Save(item, tx))
            .await
            .map_err(|_| anyhow::anyhow!("engine actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("engine actor closed"))
    }

    /// Remaining empty slots in replica storage.
    pub async fn free_space(&self) -> Result<u32> {
        let (tx, rx) = oneshot::channel();
        self.command_sender()
            .await?
            .send(Command::FreeSpace(tx))
            .await
            .map_err(|_| anyhow::anyhow!("engine actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("engine actor closed"))
    }

    /// Current replication role.
    pub async fn role(&self) -> Result<Role> {
        let (tx, rx) = oneshot::channel();
        self.command_sender()
            .await?
            .send(Command::GetRole(tx))
            .await
            .map_err(|_| anyhow::anyhow!("engine actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("engine actor closed"))
    }

    async fn command_sender(&self) -> Result<mpsc::Sender<Command>> {
        let lifecycle = self.shared.lifecycle.lock().await;
        match (&lifecycle.state, &lifecycle.cmd_tx) {
            (LifecycleState::Running, Some(cmd_tx)) => Ok(cmd_tx.clone()),
            _ => bail!("engine is not running"),
        }
    }
}

// ============================================================================
// Engine Actor (owns state)
// ============================================================================

struct EngineActor<R: Routing> {
    node_id: NodeId,
    config: Config,
    routing: Arc<R>,
    observer: Arc<dyn LookupObserver>,
    fitness: Arc<dyn ElectionFitness>,

    role: Role,
    storage: SlotStore,
    buffer: SlotStore,
    profiles: ProfileTable,
    replicas: ReplicaSet,
    lookups: LookupTracker,
    election: ElectionState,
    estimator: DeliveryEstimator,

    /// Envelope ids already handled, for at-most-once delivery.
    seen: LruCache<MessageId, ()>,
    /// Next envelope id; seeded with the node id in the high bits so ids
    /// from different engines never collide.
    next_message_id: u64,

    /// Next periodic beacon.
    next_ping_at: Instant,
    /// Next periodic ReplicaAnnounce; only set while Replicating.
    next_announce_at: Option<Instant>,
    /// Replica watchdog deadline; only set while NonReplicating.
    watchdog_at: Option<Instant>,
}

impl<R: Routing> EngineActor<R> {
    fn new(
        node_id: NodeId,
        config: Config,
        routing: Arc<R>,
        observer: Arc<dyn LookupObserver>,
        fitness: Arc<dyn ElectionFitness>,
    ) -> Self {
        let seen_cap =
            NonZeroUsize::new(MAX_SEEN_ENVELOPES).expect("MAX_SEEN_ENVELOPES must be non-zero");
        let now = Instant::now();

        Self {
            node_id,
            role: config.role,
            storage: SlotStore::new(config.storage_capacity),
            buffer: SlotStore::new(config.buffer_capacity),
            profiles: ProfileTable::new(config.profile_timeout),
            replicas: ReplicaSet::new(config.missing_replication_timeout),
            lookups: LookupTracker::new(),
            election: ElectionState::new(config.election_cooldown, config.election_timeout),
            estimator: DeliveryEstimator::new(config.w_cdc, config.w_col, config.profile_delay),
            seen: LruCache::new(seen_cap),
            next_message_id: (node_id as u64) << 32,
            next_ping_at: now,
            next_announce_at: None,
            watchdog_at: None,
            routing,
            observer,
            fitness,
            config,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut datagram_rx: mpsc::Receiver<InboundDatagram>,
    ) {
        let now = Instant::now();

        // Start-of-life: immediate beacon, watchdog armed, and an initial
        // election so a fresh neighborhood elects its first holder without
        // waiting for a timeout.
        self.update_profile(now).await;
        match self.role {
            Role::Replicating => {
                self.broadcast_election_payload(Payload::ReplicaAnnounce).await;
                self.next_announce_at = Some(now + self.config.profile_delay);
            }
            Role::NonReplicating => {
                self.watchdog_at = Some(now + self.config.missing_replication_timeout);
            }
        }
        self.start_election(now).await;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => {
                            debug!("engine handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                datagram = datagram_rx.recv() => {
                    match datagram {
                        Some(datagram) => self.handle_datagram(datagram).await,
                        None => {
                            debug!("datagram channel closed, actor quitting");
                            break;
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    self.handle_deadlines(Instant::now()).await;
                }
            }
        }
        info!(node = self.node_id, "replication engine actor stopped");
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Earliest pending deadline across every scheduled event.
    fn next_deadline(&self) -> Instant {
        let mut deadline = self.next_ping_at;
        let candidates = [
            self.next_announce_at,
            self.watchdog_at,
            self.election.decide_at(),
            self.profiles.next_expiry(),
            self.replicas.next_expiry(),
            self.lookups.next_deadline(),
        ];
        for candidate in candidates.into_iter().flatten() {
            deadline = deadline.min(candidate);
        }
        deadline
    }

    async fn handle_deadlines(&mut self, now: Instant) {
        if now >= self.next_ping_at {
            self.update_profile(now).await;
        }

        if let Some(at) = self.next_announce_at {
            if now >= at && self.role == Role::Replicating {
                self.broadcast_election_payload(Payload::ReplicaAnnounce).await;
                self.next_announce_at = Some(now + self.config.profile_delay);
            }
        }

        let dropped = self.profiles.purge_expired(now);
        for peer in dropped {
            debug!(node = self.node_id, peer, "neighbor profile expired");
        }

        let gone = self.replicas.purge_expired(now);
        if !gone.is_empty() {
            debug!(node = self.node_id, holders = ?gone, "replica holders went silent");
            if self.replicas.is_empty() {
                self.start_election(now).await;
            }
        }

        if self.watchdog_at.is_some_and(|at| now >= at) {
            debug!(node = self.node_id, "replica watchdog fired");
            self.watchdog_at = Some(now + self.config.missing_replication_timeout);
            self.start_election(now).await;
        }

        if self.election.decide_at().is_some_and(|at| now >= at) {
            self.decide_election(now).await;
        }

        for lookup in self.lookups.expire(now) {
            debug!(
                node = self.node_id,
                request_id = lookup.request_id,
                data_id = lookup.data_id,
                "lookup timed out"
            );
            self.observer.on_failure(lookup.data_id);
        }
    }

    // ========================================================================
    // Application commands
    // ========================================================================

    /// Returns `true` when the actor should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Lookup(data_id) => {
                self.handle_lookup(data_id, Instant::now()).await;
            }
            Command::Save(item, reply) => {
                let stored = self.handle_save(item).await;
                let _ = reply.send(stored);
            }
            Command::FreeSpace(reply) => {
                let _ = reply.send(self.storage.free_space());
            }
            Command::GetRole(reply) => {
                let _ = reply.send(self.role);
            }
            Command::Stop(ack) => {
                let _ = ack.send(());
                return true;
            }
        }
        false
    }

    async fn handle_lookup(&mut self, data_id: u64, now: Instant) {
        // A local hit answers synchronously, before any outbound message.
        if let Some(item) = self.local_item(data_id) {
            let item = item.clone();
            self.observer.on_success(&item);
            return;
        }

        let request_id = self.mint_id();
        let sigma = self.delivery_probability();
        let envelope = Envelope::new(
            request_id,
            Payload::Request {
                data_id,
                requestor: self.node_id,
                sigma,
            },
        );

        // Known replica holders are asked directly; otherwise fall back to
        // the neighbors most likely to reach one.
        let recipients: Vec<NodeId> = if self.replicas.is_empty() {
            self.profiles.select_at_least(sigma)
        } else {
            self.replicas.peers().collect()
        };
        for peer in &recipients {
            self.send_unicast(*peer, &envelope).await;
        }

        debug!(
            node = self.node_id,
            data_id,
            request_id,
            asked = recipients.len(),
            "lookup dispatched"
        );
        self.lookups
            .insert(request_id, data_id, now + self.config.request_timeout);
    }

    async fn handle_save(&mut self, item: DataItem) -> bool {
        // Saving makes the item durable here; drop any buffered copy so a
        // data id never sits in two containers.
        self.buffer.remove(item.id);
        let stored = self.storage.contains(item.id) || self.storage.store(item.clone());
        if !stored {
            warn!(
                node = self.node_id,
                data_id = item.id,
                "local storage full, saving without a local copy"
            );
        }

        let envelope = Envelope::new(self.mint_id(), Payload::Store { item });
        self.disseminate(&envelope, self.config.forwarding_threshold, None)
            .await;
        stored
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    async fn handle_datagram(&mut self, datagram: InboundDatagram) {
        let envelope = match decode_envelope(&datagram.bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(
                    node = self.node_id,
                    source = datagram.source,
                    error = %err,
                    "dropping undecodable datagram"
                );
                return;
            }
        };

        if datagram.source == self.node_id {
            return;
        }
        // Duplicate suppression happens before any side effect.
        if self.seen.put(envelope.id, ()).is_some() {
            debug!(
                node = self.node_id,
                envelope = envelope.id,
                kind = envelope.payload.kind(),
                "dropping duplicate envelope"
            );
            return;
        }

        let source = datagram.source;
        let now = Instant::now();
        match envelope.payload.clone() {
            Payload::Ping { delivery } => self.handle_ping(source, delivery, now).await,
            Payload::ReplicaAnnounce => self.handle_replica_announce(source, now),
            Payload::Election => self.handle_election_request(source, now).await,
            Payload::Fitness { fitness } => self.handle_ballot(source, fitness),
            Payload::ModeChange { old, new } => self.handle_mode_change(old, new, now).await,
            Payload::Store { item } => self.handle_store(&envelope, source, item).await,
            Payload::Request {
                data_id,
                requestor,
                sigma,
            } => {
                self.handle_request(&envelope, source, data_id, requestor, sigma)
                    .await
            }
            Payload::Response { request_id, item } => self.handle_response(request_id, item),
            Payload::Transfer { items } => self.handle_transfer(items),
        }
    }

    async fn handle_ping(&mut self, source: NodeId, delivery: f64, now: Instant) {
        self.profiles.observe(source, delivery, now);

        // Carrier forwarding: a fitter courier just came into range, hand
        // it everything we are carrying.
        if self.config.carrier_forwarding
            && delivery > self.delivery_probability()
            && !self.buffer.is_empty()
        {
            let items = self.buffer.take_all();
            debug!(
                node = self.node_id,
                carrier = source,
                items = items.len(),
                "handing buffer to a fitter carrier"
            );
            let envelope = Envelope::new(self.mint_id(), Payload::Transfer { items });
            self.send_unicast(source, &envelope).await;
        }
    }

    fn handle_replica_announce(&mut self, source: NodeId, now: Instant) {
        self.replicas.observe(source, now);
        if self.role == Role::NonReplicating {
            self.watchdog_at = Some(now + self.config.missing_replication_timeout);
        }
    }

    async fn handle_election_request(&mut self, source: NodeId, now: Instant) {
        if !self.election.may_join(now) {
            debug!(
                node = self.node_id,
                source, "election request inside cooldown, dropping"
            );
            return;
        }
        self.enter_collection(now).await;
    }

    fn handle_ballot(&mut self, source: NodeId, fitness: f64) {
        let from_holder = self.replicas.contains(source);
        if !self.election.record_ballot(source, fitness, from_holder) {
            debug!(node = self.node_id, source, "stale ballot, ignoring");
        }
    }

    async fn handle_mode_change(&mut self, old: NodeId, new: NodeId, now: Instant) {
        if old == new {
            // Step-up announcement.
            self.replicas.observe(new, now);
            return;
        }
        if new == NO_NODE {
            // Step-down: the region may have lost its last holder.
            self.replicas.remove(old);
            if self.replicas.is_empty() {
                self.start_election(now).await;
            }
            return;
        }
        // Handover.
        self.replicas.remove(old);
        self.replicas.observe(new, now);
    }

    async fn handle_store(&mut self, envelope: &Envelope, source: NodeId, item: DataItem) {
        if self.knows_item(item.id) {
            debug!(
                node = self.node_id,
                data_id = item.id,
                "item already known, dropping store"
            );
            return;
        }

        if self.role == Role::Replicating {
            if !self.storage.store(item.clone()) {
                warn!(
                    node = self.node_id,
                    data_id = item.id,
                    "replica storage full, item not stored"
                );
            }
            return;
        }

        // Relay the original envelope so its id keeps suppressing loops.
        self.disseminate(envelope, self.config.forwarding_threshold, Some(source))
            .await;

        if self.delivery_probability() > self.config.carrying_threshold
            && !self.buffer.store(item)
        {
            debug!(node = self.node_id, "forwarding buffer full, not carrying");
        }
    }

    async fn handle_request(
        &mut self,
        envelope: &Envelope,
        source: NodeId,
        data_id: u64,
        requestor: NodeId,
        sigma: f64,
    ) {
        if let Some(item) = self.local_item(data_id) {
            let item = item.clone();
            let response = Envelope::new(
                self.mint_id(),
                Payload::Response {
                    request_id: envelope.id,
                    item,
                },
            );
            debug!(
                node = self.node_id,
                data_id, requestor, "answering lookup request"
            );
            self.send_unicast(requestor, &response).await;
            return;
        }

        // Relay with the originator's selectivity.
        self.disseminate(envelope, sigma, Some(source)).await;
    }

    fn handle_response(&mut self, request_id: MessageId, item: DataItem) {
        match self.lookups.complete(request_id) {
            Some(pending) => {
                if pending.data_id != item.id {
                    warn!(
                        node = self.node_id,
                        request_id,
                        expected = pending.data_id,
                        got = item.id,
                        "response carries a different item than requested"
                    );
                }
                self.observer.on_success(&item);
            }
            None => {
                debug!(
                    node = self.node_id,
                    request_id, "late or unknown response, dropping"
                );
            }
        }
    }

    fn handle_transfer(&mut self, items: Vec<DataItem>) {
        for item in items {
            if self.knows_item(item.id) {
                continue;
            }
            let data_id = item.id;
            let kept = match self.role {
                Role::Replicating => self.storage.store(item),
                Role::NonReplicating => self.buffer.store(item),
            };
            if !kept {
                warn!(
                    node = self.node_id,
                    data_id, "no room for transferred item, dropping"
                );
            }
        }
    }

    // ========================================================================
    // Elections
    // ========================================================================

    /// Self-initiated election: watchdog fired, the replica set drained,
    /// or the engine just started.
    async fn start_election(&mut self, now: Instant) {
        if self.election.is_collecting() {
            return;
        }
        if !self.election.may_join(now) {
            debug!(node = self.node_id, "election suppressed by cooldown");
            return;
        }
        let envelope = Envelope::new(self.mint_id(), Payload::Election);
        self.broadcast_election_envelope(&envelope).await;
        self.enter_collection(now).await;
    }

    async fn enter_collection(&mut self, now: Instant) {
        let fitness = self.fitness.fitness(&self.fitness_context());
        if self.election.begin(fitness, now) {
            debug!(node = self.node_id, fitness, "joining election");
            self.broadcast_election_payload(Payload::Fitness { fitness })
                .await;
        }
    }

    async fn decide_election(&mut self, now: Instant) {
        let won = self.election.decide(self.role);
        match (won, self.role) {
            (true, Role::NonReplicating) => self.step_up(now).await,
            (false, Role::Replicating) => self.step_down(now).await,
            _ => {
                debug!(node = self.node_id, won, role = ?self.role, "election decided, role unchanged");
            }
        }
    }

    async fn step_up(&mut self, now: Instant) {
        self.role = Role::Replicating;
        info!(node = self.node_id, "elected replica holder");

        self.broadcast_election_payload(Payload::ModeChange {
            old: self.node_id,
            new: self.node_id,
        })
        .await;
        self.broadcast_election_payload(Payload::ReplicaAnnounce).await;
        self.next_announce_at = Some(now + self.config.profile_delay);
        self.watchdog_at = None;
    }

    async fn step_down(&mut self, now: Instant) {
        self.role = Role::NonReplicating;
        info!(node = self.node_id, "stepping down as replica holder");

        self.next_announce_at = None;
        self.broadcast_election_payload(Payload::ModeChange {
            old: self.node_id,
            new: NO_NODE,
        })
        .await;
        self.watchdog_at = Some(now + self.config.missing_replication_timeout);
    }

    // ========================================================================
    // Dissemination
    // ========================================================================

    /// Semi-probabilistic send: every known replica holder, plus every
    /// neighbor whose advertised delivery probability reaches `sigma`,
    /// minus the relay source.
    async fn disseminate(&self, envelope: &Envelope, sigma: f64, exclude: Option<NodeId>) {
        let bytes = match encode_envelope(envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(node = self.node_id, error = %err, "failed to encode envelope");
                return;
            }
        };

        let mut sent: HashSet<NodeId> = HashSet::new();
        sent.insert(self.node_id);
        if let Some(excluded) = exclude {
            sent.insert(excluded);
        }

        let mut recipients: Vec<NodeId> = Vec::new();
        for peer in self.replicas.peers() {
            if sent.insert(peer) {
                recipients.push(peer);
            }
        }
        for peer in self.profiles.select_at_least(sigma) {
            if sent.insert(peer) {
                recipients.push(peer);
            }
        }

        for peer in recipients {
            if let Err(err) = self.routing.unicast(peer, bytes.clone()).await {
                debug!(node = self.node_id, peer, error = %err, "unicast failed");
            }
        }
    }

    async fn send_unicast(&self, dest: NodeId, envelope: &Envelope) {
        match encode_envelope(envelope) {
            Ok(bytes) => {
                if let Err(err) = self.routing.unicast(dest, bytes).await {
                    debug!(node = self.node_id, dest, error = %err, "unicast failed");
                }
            }
            Err(err) => {
                warn!(node = self.node_id, error = %err, "failed to encode envelope");
            }
        }
    }

    /// Beacon the current profile into the h-hop neighborhood.
    async fn update_profile(&mut self, now: Instant) {
        self.estimator.record_degree(self.profiles.len(), now);
        let delivery = self.delivery_probability();
        let envelope = Envelope::new(self.mint_id(), Payload::Ping { delivery });
        match encode_envelope(&envelope) {
            Ok(bytes) => {
                if let Err(err) = self.routing.broadcast_neighborhood(bytes).await {
                    debug!(node = self.node_id, error = %err, "beacon broadcast failed");
                }
            }
            Err(err) => {
                warn!(node = self.node_id, error = %err, "failed to encode beacon");
            }
        }
        self.next_ping_at = now + self.config.profile_delay;
    }

    async fn broadcast_election_payload(&mut self, payload: Payload) {
        let envelope = Envelope::new(self.mint_id(), payload);
        self.broadcast_election_envelope(&envelope).await;
    }

    async fn broadcast_election_envelope(&self, envelope: &Envelope) {
        match encode_envelope(envelope) {
            Ok(bytes) => {
                if let Err(err) = self.routing.broadcast_election(bytes).await {
                    debug!(
                        node = self.node_id,
                        kind = envelope.payload.kind(),
                        error = %err,
                        "election broadcast failed"
                    );
                }
            }
            Err(err) => {
                warn!(node = self.node_id, error = %err, "failed to encode envelope");
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn mint_id(&mut self) -> MessageId {
        let id = self.next_message_id;
        self.next_message_id += 1;
        // Our own ids join the seen set so relayed echoes of our envelopes
        // die on arrival.
        self.seen.put(id, ());
        id
    }

    /// Current P_ij for this node.
    fn delivery_probability(&self) -> f64 {
        let colocated = self
            .replicas
            .peers()
            .any(|holder| self.profiles.contains(holder));
        self.estimator.probability(self.role, colocated)
    }

    fn fitness_context(&self) -> FitnessContext {
        FitnessContext {
            free_storage: self.storage.free_space(),
            free_buffer: self.buffer.free_space(),
            neighbors: self.profiles.len(),
            mean_delivery: self.profiles.mean_delivery(),
        }
    }

    /// The item as visible to lookups: replica storage, and the buffer
    /// when configured.
    fn local_item(&self, data_id: u64) -> Option<&DataItem> {
        self.storage.get(data_id).or_else(|| {
            if self.config.check_buffer {
                self.buffer.get(data_id)
            } else {
                None
            }
        })
    }

    /// Whether any container holds the item.
    fn knows_item(&self, data_id: u64) -> bool {
        self.storage.contains(data_id) || self.buffer.contains(data_id)
    }
}
