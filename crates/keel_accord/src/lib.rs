//! Keel protocol core.
//!
//! A leaderless, strict-serializable transaction engine: any node may
//! coordinate any transaction, every replica observes the same total order
//! of committed outcomes, and any replica can take over a stalled
//! coordination and drive it to the same result. The crate is transport-,
//! storage-, and runtime-embedding-agnostic: the collaborators in
//! [`node`] are traits supplied by the host.

pub mod cfk;
pub mod cleanup;
pub mod clock;
pub mod command;
pub mod coordinate;
pub mod deps;
pub mod error;
pub mod keys;
pub mod latest_deps;
pub mod messages;
pub mod node;
pub mod progress;
pub mod recovery;
pub mod status;
pub mod store;
pub mod timers;
pub mod topology;
pub mod topology_manager;
pub mod trackers;
pub mod txn;

pub use cleanup::{Cleanup, DurableBefore, RedundantBefore, RedundantStatus};
pub use command::{Command, StoreParticipants, WaitingOn};
pub use coordinate::{coordinate, Outcome};
pub use deps::Deps;
pub use error::{CoordinateError, CoordinateResult};
pub use keys::{Key, KeyRange, Keys, Participants, Ranges, Route, RoutingKey};
pub use latest_deps::{KnownDeps, LatestDeps};
pub use messages::{Reply, Request};
pub use node::{empty_system_txn, Agent, DataStore, Journal, Node, NodeConfig, Transport};
pub use recovery::recover;
pub use status::{Durability, Phase, SaveStatus};
pub use store::CommandStore;
pub use timers::LogGroupTimers;
pub use topology::{Shard, Topologies, Topology};
pub use topology_manager::TopologyManager;
pub use txn::{Ballot, Domain, Kind, NodeId, PartialTxn, Timestamp, Txn, TxnId};
