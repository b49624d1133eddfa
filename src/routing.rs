//! # Collaborator Traits
//!
//! The engine talks to the outside world through two seams, defined here
//! separately from any implementation so the protocol depends only on
//! traits:
//!
//! - [`Routing`]: the lower-layer ad-hoc routing protocol. It owns the
//!   sockets, the TTL semantics of the two broadcast radii, and the node's
//!   identity. Inbound datagrams flow the other way, into the channel
//!   returned by `ReplicationEngine::datagram_sender`.
//! - [`LookupObserver`]: the application's lookup callbacks, supplied once
//!   at engine construction. [`NoopObserver`] is used when the caller
//!   declines to observe.

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::{DataItem, NodeId};

/// Outbound interface to the ad-hoc routing layer.
///
/// The two broadcast operations differ only in TTL: the neighborhood
/// radius `h` carries beacons and data dissemination, the wider election
/// radius `h_r` carries election and role-change traffic. Both values are
/// available in `Config` for the implementation to consume.
#[async_trait]
pub trait Routing: Send + Sync + 'static {
    /// The identity the routing layer allocated to this node.
    ///
    /// Must never return `NO_NODE`. An error here aborts engine start-up.
    fn own_node_id(&self) -> Result<NodeId>;

    /// Deliver `bytes` to exactly `dest`.
    async fn unicast(&self, dest: NodeId, bytes: Vec<u8>) -> Result<()>;

    /// Hop-limited broadcast with TTL `h`.
    async fn broadcast_neighborhood(&self, bytes: Vec<u8>) -> Result<()>;

    /// Hop-limited broadcast with TTL `h_r`.
    async fn broadcast_election(&self, bytes: Vec<u8>) -> Result<()>;
}

/// Application callbacks for lookup outcomes.
///
/// For every `lookup()` call exactly one of the two methods fires, never
/// both. Implementations must not block: they run on the engine task.
pub trait LookupObserver: Send + Sync + 'static {
    /// A lookup was answered, locally or by a peer.
    fn on_success(&self, item: &DataItem);

    /// A lookup timed out without an answer.
    fn on_failure(&self, data_id: u64);
}

/// Discards every lookup outcome. Used when no observer is supplied.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl LookupObserver for NoopObserver {
    fn on_success(&self, _item: &DataItem) {}

    fn on_failure(&self, _data_id: u64) {}
}
