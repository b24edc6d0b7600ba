//! Connection liveness for PolyQuery's storage engines.
//!
//! Three pieces:
//! - [`connection`]: per-engine heartbeat loops and the actor that owns
//!   blocked/in-vote state and drives the propose/vote protocol;
//! - [`consensus`]: the proposal/vote/update message types, the transport
//!   contract, and quorum aggregation;
//! - [`reconnect`]: exponential-backoff retries for engines that never
//!   connected in the first place.
//!
//! The design assumes crash/partition faults only; a single node's failed
//! probe is a suspicion, and only a cluster quorum turns it into a blocked
//! engine.

pub mod connection;
pub mod consensus;
pub mod reconnect;

pub use connection::{
    ConnectionDeps, ConnectionManager, LivenessSnapshot, MigrationTrigger, NoMigration,
};
pub use consensus::{
    ConnectionProposal, ConnectionVote, ConsensusTransport, NodeId, ProposalKind, ProposalOutcome,
    ProposalUpdate, VoteTally,
};
pub use reconnect::ReconnectionScheduler;
