//! # Pending Lookup Tracking
//!
//! Bookkeeping for in-flight data lookups. Each `lookup()` that misses
//! local storage mints a request id, registers it here with a deadline, and
//! sends Requests into the network. The tracker guarantees the
//! at-most-one-callback property structurally: a pending entry can leave
//! the map exactly once, either through [`LookupTracker::complete`] (a
//! matching Response arrived) or through [`LookupTracker::expire`] (the
//! deadline passed). Late Responses find nothing to complete and are
//! silently dropped by the caller.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::messages::MessageId;

/// A lookup awaiting a Response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingLookup {
    /// Envelope id of the Request this node originated.
    pub request_id: MessageId,
    /// Data item being sought.
    pub data_id: u64,
    /// When the failure callback fires if no Response arrives.
    pub deadline: Instant,
}

/// Pending lookups keyed by request id.
#[derive(Debug, Default)]
pub struct LookupTracker {
    pending: HashMap<MessageId, PendingLookup>,
}

impl LookupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly minted request.
    pub fn insert(&mut self, request_id: MessageId, data_id: u64, deadline: Instant) {
        self.pending.insert(
            request_id,
            PendingLookup {
                request_id,
                data_id,
                deadline,
            },
        );
    }

    /// Resolve a pending request, removing it.
    ///
    /// Returns `None` for unknown, already-completed, or already-expired
    /// request ids; the caller drops the Response in that case.
    pub fn complete(&mut self, request_id: MessageId) -> Option<PendingLookup> {
        self.pending.remove(&request_id)
    }

    /// Drain every request whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingLookup> {
        let mut expired = Vec::new();
        self.pending.retain(|_, lookup| {
            let alive = lookup.deadline > now;
            if !alive {
                expired.push(*lookup);
            }
            alive
        });
        expired
    }

    /// The earliest pending deadline, if any request is in flight.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|lookup| lookup.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
