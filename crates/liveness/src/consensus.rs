//! Propose/vote protocol for confirming storage-engine connection loss.
//!
//! A single node's failed heartbeat is only a suspicion; the cluster votes on
//! it so a transient network issue on one member cannot block a healthy
//! engine. The transport carries proposals, votes, and resolution updates
//! between members; vote aggregation itself is local and synchronous.

use std::collections::HashSet;

use async_trait::async_trait;
use pq_common::{Result, StorageEngineId};
use serde::{Deserialize, Serialize};

/// Cluster member identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalKind {
    /// Claim that a previously alive engine has gone silent.
    Loss,
    /// Claim that a blocked engine is reachable again.
    Restore,
}

impl ProposalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalKind::Loss => "loss",
            ProposalKind::Restore => "restore",
        }
    }
}

/// One vote round about one storage engine, keyed by `(storage_id, round)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProposal {
    pub storage_id: StorageEngineId,
    pub kind: ProposalKind,
    pub proposer: NodeId,
    pub round: u64,
}

/// A member's independent liveness observation for one proposal round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionVote {
    pub storage_id: StorageEngineId,
    pub voter: NodeId,
    pub round: u64,
    pub alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalOutcome {
    ConfirmedDown,
    ConfirmedAlive,
}

/// Resolution of a proposal round, observed by every member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalUpdate {
    pub proposal: ConnectionProposal,
    pub outcome: ProposalOutcome,
}

/// Carries the protocol's messages between cluster members.
///
/// Implementations must deliver each message to every member, including the
/// sender; the connection manager relies on self-delivery for its own state
/// transitions.
#[async_trait]
pub trait ConsensusTransport: Send + Sync {
    async fn propose(&self, proposal: ConnectionProposal) -> Result<()>;

    async fn vote(&self, vote: ConnectionVote) -> Result<()>;

    async fn publish_update(&self, update: ProposalUpdate) -> Result<()>;
}

/// Aggregates votes for one proposal round into a quorum decision.
///
/// Decision rules: a `Loss` proposal resolves on a strict majority either
/// way. A `Restore` proposal resolves alive on any single alive vote, since
/// one successful probe of a blocked engine is proof of reachability, and
/// resolves down on a strict majority of down votes.
#[derive(Debug)]
pub struct VoteTally {
    proposal: ConnectionProposal,
    cluster_size: usize,
    alive: HashSet<NodeId>,
    down: HashSet<NodeId>,
}

impl VoteTally {
    pub fn new(proposal: ConnectionProposal, cluster_size: usize) -> Self {
        Self {
            proposal,
            cluster_size: cluster_size.max(1),
            alive: HashSet::new(),
            down: HashSet::new(),
        }
    }

    pub fn proposal(&self) -> &ConnectionProposal {
        &self.proposal
    }

    /// Record one vote; later votes from the same member are ignored.
    /// Returns the outcome once a quorum is reached.
    pub fn record(&mut self, vote: &ConnectionVote) -> Option<ProposalOutcome> {
        if vote.storage_id != self.proposal.storage_id || vote.round != self.proposal.round {
            return None;
        }
        if self.alive.contains(&vote.voter) || self.down.contains(&vote.voter) {
            return None;
        }
        if vote.alive {
            self.alive.insert(vote.voter);
        } else {
            self.down.insert(vote.voter);
        }
        self.decide()
    }

    fn decide(&self) -> Option<ProposalOutcome> {
        let majority = self.cluster_size / 2 + 1;
        match self.proposal.kind {
            ProposalKind::Restore if !self.alive.is_empty() => {
                Some(ProposalOutcome::ConfirmedAlive)
            }
            _ if self.down.len() >= majority => Some(ProposalOutcome::ConfirmedDown),
            _ if self.alive.len() >= majority => Some(ProposalOutcome::ConfirmedAlive),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loss_proposal() -> ConnectionProposal {
        ConnectionProposal {
            storage_id: StorageEngineId(3),
            kind: ProposalKind::Loss,
            proposer: NodeId(0),
            round: 1,
        }
    }

    fn vote(voter: u64, alive: bool) -> ConnectionVote {
        ConnectionVote {
            storage_id: StorageEngineId(3),
            voter: NodeId(voter),
            round: 1,
            alive,
        }
    }

    #[test]
    fn loss_proposal_resolves_down_on_majority() {
        let mut tally = VoteTally::new(loss_proposal(), 3);
        assert_eq!(tally.record(&vote(0, false)), None);
        assert_eq!(
            tally.record(&vote(1, false)),
            Some(ProposalOutcome::ConfirmedDown)
        );
    }

    #[test]
    fn loss_proposal_resolves_alive_on_majority() {
        let mut tally = VoteTally::new(loss_proposal(), 3);
        assert_eq!(tally.record(&vote(0, false)), None);
        assert_eq!(tally.record(&vote(1, true)), None);
        assert_eq!(
            tally.record(&vote(2, true)),
            Some(ProposalOutcome::ConfirmedAlive)
        );
    }

    #[test]
    fn duplicate_votes_from_one_member_count_once() {
        let mut tally = VoteTally::new(loss_proposal(), 3);
        assert_eq!(tally.record(&vote(0, false)), None);
        assert_eq!(tally.record(&vote(0, false)), None);
        assert_eq!(tally.record(&vote(0, false)), None);
    }

    #[test]
    fn stale_round_votes_are_ignored() {
        let mut tally = VoteTally::new(loss_proposal(), 1);
        let stale = ConnectionVote {
            round: 0,
            ..vote(0, false)
        };
        assert_eq!(tally.record(&stale), None);
    }

    #[test]
    fn restore_proposal_resolves_on_single_alive_vote() {
        let proposal = ConnectionProposal {
            kind: ProposalKind::Restore,
            ..loss_proposal()
        };
        let mut tally = VoteTally::new(proposal, 5);
        assert_eq!(
            tally.record(&vote(4, true)),
            Some(ProposalOutcome::ConfirmedAlive)
        );
    }
}
