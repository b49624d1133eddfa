//! # Wire Protocol Messages
//!
//! This module defines the serializable message types exchanged between
//! RHPMAN nodes. Every datagram on the wire is one [`Envelope`] carrying a
//! tagged [`Payload`]; envelopes are serialized with bincode using fixed-width
//! integer encoding and a hard size limit to prevent memory exhaustion.
//!
//! ## Message Types
//!
//! | Payload | Radius | Meaning |
//! |---------|--------|---------|
//! | `Ping` | neighborhood (h) | Periodic beacon carrying the sender's delivery probability |
//! | `ReplicaAnnounce` | election (h_r) | "I am a replica holder" |
//! | `Election` | election (h_r) | Start an election |
//! | `Fitness` | election (h_r) | Election ballot |
//! | `ModeChange` | election (h_r) | Role transition notice |
//! | `Store` | unicast | Disseminate a data item |
//! | `Request` | unicast | Lookup for a data item |
//! | `Response` | unicast | Answer to a Request |
//! | `Transfer` | unicast | Hand off buffered items to a fitter carrier |
//!
//! ## Identifiers
//!
//! Envelope ids double as request ids for `Request`/`Response` correlation
//! and feed the receive-path duplicate suppression set. Each engine mints
//! ids from a counter seeded with its own node id shifted into the high
//! bits, so ids stay unique across every node of a run while remaining
//! engine-scoped state.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque 32-bit node identifier, unique within a run.
/// Allocated by the routing collaborator.
pub type NodeId = u32;

/// Reserved "no node" identifier. Used by `ModeChange` to signal step-down.
pub const NO_NODE: NodeId = 0;

/// Monotonically-increasing envelope identifier, unique across a run.
pub type MessageId = u64;

/// Maximum size of a data item payload (1 MiB).
/// Larger items should be chunked by the application.
pub const MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Set slightly larger than MAX_ITEM_SIZE to allow for envelope framing overhead.
pub const MAX_WIRE_SIZE: u64 = (MAX_ITEM_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
/// Always used for deserialization so a malformed length prefix cannot OOM.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_WIRE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Encode an envelope for transmission.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(envelope)
}

/// Decode an envelope received from the routing layer.
///
/// Unknown tags, truncated frames, and oversized frames all surface as
/// errors here; the receive path drops such datagrams.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, bincode::Error> {
    deserialize_bounded(bytes)
}

/// An immutable replicated data item.
///
/// Items are value types: every holder (storage, buffer, in-flight message,
/// pending response) owns its own copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    /// Globally unique item identifier.
    pub id: u64,
    /// Node that originally saved the item.
    pub owner: NodeId,
    /// Opaque application payload.
    pub payload: Vec<u8>,
}

impl DataItem {
    pub fn new(id: u64, owner: NodeId, payload: Vec<u8>) -> Self {
        Self { id, owner, payload }
    }
}

/// The tagged union of all protocol messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Neighborhood beacon carrying the sender's delivery probability.
    Ping { delivery: f64 },
    /// Announcement that the sender currently holds the replica role.
    ReplicaAnnounce,
    /// Request to start an election in the election neighborhood.
    Election,
    /// Election ballot carrying the sender's fitness.
    Fitness { fitness: f64 },
    /// Role transition notice.
    ///
    /// `old == new` is a step-up, `new == NO_NODE` is a step-down, anything
    /// else is a handover from `old` to `new`.
    ModeChange { old: NodeId, new: NodeId },
    /// Disseminate a data item through the neighborhood.
    Store { item: DataItem },
    /// Lookup for a data item.
    ///
    /// `sigma` is the forwarding threshold stamped by the originator so that
    /// relays select recipients with the same selectivity.
    Request {
        data_id: u64,
        requestor: NodeId,
        sigma: f64,
    },
    /// Answer to a `Request`; `request_id` echoes the request envelope id.
    Response {
        request_id: MessageId,
        item: DataItem,
    },
    /// Hand off the sender's entire forwarding buffer to a fitter carrier.
    Transfer { items: Vec<DataItem> },
}

impl Payload {
    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Ping { .. } => "ping",
            Payload::ReplicaAnnounce => "replica-announce",
            Payload::Election => "election",
            Payload::Fitness { .. } => "fitness",
            Payload::ModeChange { .. } => "mode-change",
            Payload::Store { .. } => "store",
            Payload::Request { .. } => "request",
            Payload::Response { .. } => "response",
            Payload::Transfer { .. } => "transfer",
        }
    }
}

/// The common wire frame around every protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Run-unique envelope id; also the request id for `Request` frames.
    pub id: MessageId,
    /// Milliseconds since the UNIX epoch at send time. Informational only;
    /// no handler branches on it.
    pub timestamp_ms: u64,
    /// The protocol message itself.
    pub payload: Payload,
}

impl Envelope {
    /// Build an envelope stamped with the current wall-clock time.
    pub fn new(id: MessageId, payload: Payload) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            id,
            timestamp_ms,
            payload,
        }
    }
}
