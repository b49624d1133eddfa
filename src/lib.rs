//! # rhpman — Replication for Highly Partitioned MANETs
//!
//! An implementation of the RHPMAN data-replication scheme (Shi & Chen,
//! 2014) for mobile ad-hoc networks that partition and re-merge as nodes
//! move. Every node continuously estimates its own delivery fitness, a
//! small number of elected replica holders per election neighborhood carry
//! durable copies of every item they learn about, and ordinary nodes
//! opportunistically cache or forward items driven by the same fitness
//! value. Replication is self-healing: holders that fall silent are
//! detected and replaced by a new election, with no central coordinator.
//!
//! ## Architecture
//!
//! One [`ReplicationEngine`] runs per node. The engine is an actor: a
//! cheap-to-clone handle communicates over async channels with a task that
//! owns all protocol state and processes inbound datagrams, application
//! commands, and timer firings strictly sequentially.
//!
//! The engine reaches the outside world through two traits supplied at
//! construction: [`Routing`] (the lower-layer ad-hoc routing protocol
//! providing unicast and two hop-limited broadcast radii) and
//! [`LookupObserver`] (the application's lookup callbacks).
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `engine` | Engine handle + actor: lifecycle, receive loop, dissemination, timers |
//! | `config` | Tunable parameters with the defaults from the paper |
//! | `messages` | Wire envelope and the tagged union of protocol messages |
//! | `storage` | Fixed-capacity slot container backing storage and buffer |
//! | `profiles` | Neighbor profile table and replica-set view with expiries |
//! | `fitness` | Delivery probability and pluggable election fitness |
//! | `lookup` | Pending lookup bookkeeping and timeouts |
//! | `election` | Election phase state, ballots, and the decision rule |
//! | `routing` | Collaborator traits (`Routing`, `LookupObserver`) |

mod config;
mod election;
mod engine;
mod fitness;
mod lookup;
mod messages;
mod profiles;
mod routing;
mod storage;

pub use config::{Config, Role};
pub use election::{ElectionPhase, ElectionState};
pub use engine::{EngineBuilder, InboundDatagram, LifecycleState, ReplicationEngine};
pub use fitness::{
    ConstantFitness, DegreeWindow, DeliveryEstimator, ElectionFitness, FitnessContext,
    ReferenceFitness,
};
pub use lookup::{LookupTracker, PendingLookup};
pub use messages::{
    decode_envelope, encode_envelope, DataItem, Envelope, MessageId, NodeId, Payload,
    MAX_ITEM_SIZE, MAX_WIRE_SIZE, NO_NODE,
};
pub use profiles::{ProfileTable, ReplicaSet};
pub use routing::{LookupObserver, NoopObserver, Routing};
pub use storage::SlotStore;
