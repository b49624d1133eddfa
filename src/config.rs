//! # Engine Configuration
//!
//! All recognized options with the defaults from Shi & Chen's evaluation.
//! Every option is independent; construct with `Config::default()` and
//! override fields as needed.
//!
//! | Option | Symbol | Default |
//! |--------|--------|---------|
//! | `forwarding_threshold` | σ | 0.4 |
//! | `carrying_threshold` | τ | 0.6 |
//! | `w_cdc` | w_cdc | 0.5 |
//! | `w_col` | w_col | 0.5 |
//! | `neighborhood_hops` | h | 2 |
//! | `election_neighborhood_hops` | h_r | 4 |
//! | `profile_delay` | T | 6 s |
//! | `request_timeout` | — | 5 s |
//! | `missing_replication_timeout` | — | 5 s |
//! | `profile_timeout` | — | 5 s |
//! | `election_timeout` | — | 5 s |
//! | `election_cooldown` | — | 1 s |
//!
//! Note that with the paper defaults `profile_delay` exceeds
//! `missing_replication_timeout`, so replica entries expire between two
//! announcements and neighborhoods periodically re-elect. Deployments that
//! want a quiet steady state should set `profile_delay` below the
//! missing-replication timeout.

use std::time::Duration;

/// Replication role of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Ordinary node: forwards and opportunistically carries items.
    NonReplicating,
    /// Elected replica holder: durable store for items in its region.
    Replicating,
}

/// Tunable parameters of the protocol engine.
#[derive(Clone, Debug)]
pub struct Config {
    /// Initial role of this node. Data owners typically start Replicating.
    pub role: Role,
    /// σ — minimum neighbor delivery probability for that neighbor to
    /// receive a relayed message.
    pub forwarding_threshold: f64,
    /// τ — minimum own delivery probability at which a non-replica caches
    /// a received item in its buffer.
    pub carrying_threshold: f64,
    /// Weight of the change-degree metric in P_ij.
    pub w_cdc: f64,
    /// Weight of the colocation metric in P_ij.
    pub w_col: f64,
    /// h — TTL radius for Ping and local dissemination. Consumed by the
    /// routing collaborator; the engine never branches on it.
    pub neighborhood_hops: u32,
    /// h_r — TTL radius for election and role-change messages. Consumed by
    /// the routing collaborator.
    pub election_neighborhood_hops: u32,
    /// T — period between profile updates and beacons; also the
    /// replica-announcement period.
    pub profile_delay: Duration,
    /// How long a lookup waits for a Response before failing.
    pub request_timeout: Duration,
    /// Silence after which a replica holder is presumed gone; also the
    /// replica watchdog period.
    pub missing_replication_timeout: Duration,
    /// Silence after which a neighbor profile is dropped.
    pub profile_timeout: Duration,
    /// How long an election collects ballots before deciding.
    pub election_timeout: Duration,
    /// Minimum separation between elections joined by one node.
    pub election_cooldown: Duration,
    /// Capacity of the replica storage, in items.
    pub storage_capacity: u32,
    /// Capacity of the forwarding buffer, in items.
    pub buffer_capacity: u32,
    /// Hand the whole buffer to any neighbor beaconing a higher delivery
    /// probability than our own.
    pub carrier_forwarding: bool,
    /// Consult the forwarding buffer when answering lookups, local and
    /// remote.
    pub check_buffer: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::NonReplicating,
            forwarding_threshold: 0.4,
            carrying_threshold: 0.6,
            w_cdc: 0.5,
            w_col: 0.5,
            neighborhood_hops: 2,
            election_neighborhood_hops: 4,
            profile_delay: Duration::from_secs(6),
            request_timeout: Duration::from_secs(5),
            missing_replication_timeout: Duration::from_secs(5),
            profile_timeout: Duration::from_secs(5),
            election_timeout: Duration::from_secs(5),
            election_cooldown: Duration::from_secs(1),
            storage_capacity: 10,
            buffer_capacity: 10,
            carrier_forwarding: false,
            check_buffer: false,
        }
    }
}
