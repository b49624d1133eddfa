//! # Neighborhood Bookkeeping
//!
//! Two per-node tables track what the protocol knows about its
//! surroundings:
//!
//! - [`ProfileTable`]: the delivery probability last advertised by each
//!   h-hop neighbor via `Ping`, refreshed on every beacon.
//! - [`ReplicaSet`]: the replica holders currently believed alive in the
//!   election neighborhood, refreshed by `ReplicaAnnounce` and updated by
//!   `ModeChange`.
//!
//! Entries carry their own expiry deadline instead of owning timer tasks:
//! the engine's event loop asks each table for its [`next_expiry`] when
//! computing how long to sleep, and calls [`purge_expired`] when it wakes.
//! Refreshing an entry overwrites the deadline, which is all the timer
//! cancellation the scheme needs.
//!
//! [`next_expiry`]: ProfileTable::next_expiry
//! [`purge_expired`]: ProfileTable::purge_expired

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::messages::NodeId;

/// A single neighbor's advertised delivery probability.
#[derive(Clone, Copy, Debug)]
struct ProfileEntry {
    delivery: f64,
    expires_at: Instant,
}

/// Delivery probabilities of the h-hop neighborhood, keyed by peer.
#[derive(Debug)]
pub struct ProfileTable {
    entries: HashMap<NodeId, ProfileEntry>,
    timeout: Duration,
}

impl ProfileTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Record a beacon from `peer`, replacing any previous value and
    /// pushing its expiry out by the profile timeout.
    pub fn observe(&mut self, peer: NodeId, delivery: f64, now: Instant) {
        self.entries.insert(
            peer,
            ProfileEntry {
                delivery,
                expires_at: now + self.timeout,
            },
        );
    }

    /// The delivery probability last advertised by `peer`, if still fresh.
    pub fn delivery_of(&self, peer: NodeId) -> Option<f64> {
        self.entries.get(&peer).map(|entry| entry.delivery)
    }

    pub fn contains(&self, peer: NodeId) -> bool {
        self.entries.contains_key(&peer)
    }

    /// Number of live neighbors (the node's degree).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(peer, delivery)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, f64)> + '_ {
        self.entries
            .iter()
            .map(|(peer, entry)| (*peer, entry.delivery))
    }

    /// Peers whose advertised delivery probability is at least `sigma`.
    ///
    /// This is the semi-probabilistic recipient pre-selection; the
    /// dissemination engine subtracts replicas and the relay source.
    pub fn select_at_least(&self, sigma: f64) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.delivery >= sigma)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Mean advertised delivery across live neighbors, 0.0 when alone.
    pub fn mean_delivery(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.entries.values().map(|entry| entry.delivery).sum();
        sum / self.entries.len() as f64
    }

    /// Drop every entry whose deadline has passed, returning the peers
    /// removed.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<NodeId> {
        let mut removed = Vec::new();
        self.entries.retain(|peer, entry| {
            let alive = entry.expires_at > now;
            if !alive {
                removed.push(*peer);
            }
            alive
        });
        removed
    }

    /// The earliest entry deadline, if any entry is live.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.expires_at).min()
    }
}

/// Replica holders believed alive in the election neighborhood.
#[derive(Debug)]
pub struct ReplicaSet {
    entries: HashMap<NodeId, Instant>,
    timeout: Duration,
}

impl ReplicaSet {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Insert or refresh `peer`, pushing its expiry out by the
    /// missing-replication timeout.
    pub fn observe(&mut self, peer: NodeId, now: Instant) {
        self.entries.insert(peer, now + self.timeout);
    }

    /// Remove `peer` (step-down or handover). Returns whether it was known.
    pub fn remove(&mut self, peer: NodeId) -> bool {
        self.entries.remove(&peer).is_some()
    }

    pub fn contains(&self, peer: NodeId) -> bool {
        self.entries.contains_key(&peer)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over the known holders.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    /// Drop every holder whose deadline has passed, returning those removed.
    ///
    /// The caller is responsible for triggering an election when the set
    /// becomes empty.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<NodeId> {
        let mut removed = Vec::new();
        self.entries.retain(|peer, expires_at| {
            let alive = *expires_at > now;
            if !alive {
                removed.push(*peer);
            }
            alive
        });
        removed
    }

    /// The earliest holder deadline, if any holder is known.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().copied().min()
    }
}
