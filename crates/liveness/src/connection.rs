//! Connection manager: one heartbeat loop per storage engine feeding a
//! single actor task that owns all liveness state and drives the
//! propose/vote protocol.
//!
//! The actor is the only writer of the blocked/in-vote/removed sets, so no
//! lock guards them; heartbeat loops and transport callbacks communicate with
//! it exclusively through typed events on an mpsc channel. The one piece of
//! state shared outside the actor is each gateway's `blocked` flag, which
//! dispatch workers read to fail fast instead of hanging on a dead engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use pq_common::{global_metrics, EngineConfig, PqError, Result, StorageEngineId};
use pq_model::StorageGateway;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::consensus::{
    ConnectionProposal, ConnectionVote, ConsensusTransport, NodeId, ProposalKind, ProposalOutcome,
    ProposalUpdate, VoteTally,
};

/// Hands a confirmed-down engine's data off to migration. Invoked at most
/// once per loss, and only on the member that proposed it.
pub trait MigrationTrigger: Send + Sync {
    fn migrate(&self, storage_id: StorageEngineId);
}

/// Migration disabled; a confirmed loss still blocks the engine.
#[derive(Debug, Default)]
pub struct NoMigration;

impl MigrationTrigger for NoMigration {
    fn migrate(&self, storage_id: StorageEngineId) {
        info!(engine = %storage_id, "migration disabled; blocked engine left in place");
    }
}

/// Collaborators injected at construction time.
pub struct ConnectionDeps {
    pub transport: Arc<dyn ConsensusTransport>,
    pub migration: Arc<dyn MigrationTrigger>,
}

/// Point-in-time copy of the actor's liveness state, for inspection.
#[derive(Debug, Clone, Default)]
pub struct LivenessSnapshot {
    pub blocked: HashSet<StorageEngineId>,
    pub in_votes: HashSet<StorageEngineId>,
    pub removed: HashSet<StorageEngineId>,
}

enum LivenessEvent {
    Register { gateway: Arc<StorageGateway> },
    Remove { storage_id: StorageEngineId },
    HeartbeatFailed { storage_id: StorageEngineId },
    HeartbeatRecovered { storage_id: StorageEngineId },
    ProposalCreated { proposal: ConnectionProposal },
    VoteCast { vote: ConnectionVote },
    ProposalResolved { update: ProposalUpdate },
    RoundExpired { storage_id: StorageEngineId, round: u64 },
    Snapshot { reply: oneshot::Sender<LivenessSnapshot> },
    Shutdown,
}

#[derive(Clone, Copy)]
struct HeartbeatSettings {
    interval: Duration,
    timeout: Duration,
    max_retries: u32,
    restore_probability: f64,
    vote_round_timeout: Duration,
}

impl HeartbeatSettings {
    fn from_config(config: &EngineConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            timeout: Duration::from_millis(config.heartbeat_timeout_ms.max(1)),
            max_retries: config.heartbeat_max_retry_times.max(1),
            restore_probability: config.restore_heartbeat_probability,
            vote_round_timeout: Duration::from_millis(config.vote_round_timeout_ms.max(1)),
        }
    }
}

/// Handle to the liveness actor. Cheap to clone; all clones feed the same
/// actor task.
#[derive(Clone)]
pub struct ConnectionManager {
    tx: mpsc::UnboundedSender<LivenessEvent>,
    actor: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionManager {
    /// Must be called from within a tokio runtime; the actor and heartbeat
    /// loops are spawned onto it.
    pub fn new(
        node: NodeId,
        cluster_size: usize,
        config: EngineConfig,
        deps: ConnectionDeps,
    ) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            node,
            cluster_size: cluster_size.max(1),
            settings: HeartbeatSettings::from_config(&config),
            transport: deps.transport,
            migration: deps.migration,
            events: tx.clone(),
            gateways: HashMap::new(),
            heartbeats: HashMap::new(),
            blocked: HashSet::new(),
            in_votes: HashSet::new(),
            removed: HashSet::new(),
            tallies: HashMap::new(),
            rounds: HashMap::new(),
            next_round: 0,
        };
        let handle = tokio::spawn(actor.run(rx));
        Ok(Self {
            tx,
            actor: Arc::new(parking_lot::Mutex::new(Some(handle))),
        })
    }

    /// Start heartbeat monitoring for one engine's gateway.
    pub fn register(&self, gateway: Arc<StorageGateway>) {
        self.send(LivenessEvent::Register { gateway });
    }

    /// Stop monitoring an engine; its id is remembered so late heartbeat
    /// failures cannot start proposals for it.
    pub fn remove(&self, storage_id: StorageEngineId) {
        self.send(LivenessEvent::Remove { storage_id });
    }

    /// Transport inbound: another member (or this one) opened a vote round.
    pub fn observe_proposal(&self, proposal: ConnectionProposal) {
        self.send(LivenessEvent::ProposalCreated { proposal });
    }

    /// Transport inbound: a member cast its vote.
    pub fn observe_vote(&self, vote: ConnectionVote) {
        self.send(LivenessEvent::VoteCast { vote });
    }

    /// Transport inbound: a vote round resolved.
    pub fn observe_update(&self, update: ProposalUpdate) {
        self.send(LivenessEvent::ProposalResolved { update });
    }

    pub async fn snapshot(&self) -> LivenessSnapshot {
        let (reply, rx) = oneshot::channel();
        self.send(LivenessEvent::Snapshot { reply });
        rx.await.unwrap_or_default()
    }

    /// Stop the actor and every heartbeat loop.
    pub async fn shutdown(&self) {
        self.send(LivenessEvent::Shutdown);
        let handle = self.actor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn send(&self, event: LivenessEvent) {
        if self.tx.send(event).is_err() {
            debug!("liveness actor is gone; event dropped");
        }
    }
}

struct Actor {
    node: NodeId,
    cluster_size: usize,
    settings: HeartbeatSettings,
    transport: Arc<dyn ConsensusTransport>,
    migration: Arc<dyn MigrationTrigger>,
    events: mpsc::UnboundedSender<LivenessEvent>,
    gateways: HashMap<StorageEngineId, Arc<StorageGateway>>,
    heartbeats: HashMap<StorageEngineId, JoinHandle<()>>,
    blocked: HashSet<StorageEngineId>,
    in_votes: HashSet<StorageEngineId>,
    removed: HashSet<StorageEngineId>,
    tallies: HashMap<StorageEngineId, VoteTally>,
    /// Round currently open per engine; an expiry event only clears state
    /// when its round is still the open one.
    rounds: HashMap<StorageEngineId, u64>,
    next_round: u64,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LivenessEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                LivenessEvent::Register { gateway } => self.on_register(gateway),
                LivenessEvent::Remove { storage_id } => self.on_remove(storage_id),
                LivenessEvent::HeartbeatFailed { storage_id } => {
                    self.on_heartbeat_failed(storage_id).await
                }
                LivenessEvent::HeartbeatRecovered { storage_id } => {
                    self.on_heartbeat_recovered(storage_id).await
                }
                LivenessEvent::ProposalCreated { proposal } => self.on_proposal_created(proposal),
                LivenessEvent::VoteCast { vote } => self.on_vote_cast(vote).await,
                LivenessEvent::ProposalResolved { update } => self.on_proposal_resolved(update),
                LivenessEvent::RoundExpired { storage_id, round } => {
                    self.on_round_expired(storage_id, round)
                }
                LivenessEvent::Snapshot { reply } => {
                    let _ = reply.send(LivenessSnapshot {
                        blocked: self.blocked.clone(),
                        in_votes: self.in_votes.clone(),
                        removed: self.removed.clone(),
                    });
                }
                LivenessEvent::Shutdown => break,
            }
        }
        for (_, heartbeat) in self.heartbeats.drain() {
            heartbeat.abort();
        }
        debug!(node = %self.node, "liveness actor stopped");
    }

    fn on_register(&mut self, gateway: Arc<StorageGateway>) {
        let id = gateway.engine_id();
        self.removed.remove(&id);
        if let Some(old) = self.heartbeats.remove(&id) {
            old.abort();
        }
        let handle = tokio::spawn(heartbeat_loop(
            Arc::clone(&gateway),
            self.settings,
            self.events.clone(),
        ));
        self.heartbeats.insert(id, handle);
        self.gateways.insert(id, gateway);
        info!(engine = %id, node = %self.node, "heartbeat monitoring started");
    }

    fn on_remove(&mut self, id: StorageEngineId) {
        if let Some(heartbeat) = self.heartbeats.remove(&id) {
            heartbeat.abort();
        }
        self.gateways.remove(&id);
        self.in_votes.remove(&id);
        self.tallies.remove(&id);
        self.rounds.remove(&id);
        self.removed.insert(id);
        info!(engine = %id, "engine removed from liveness monitoring");
    }

    async fn on_heartbeat_failed(&mut self, id: StorageEngineId) {
        // One proposal per engine at a time; a failure observed while a vote
        // round is already in flight is folded into that round.
        if self.blocked.contains(&id) || self.in_votes.contains(&id) || self.removed.contains(&id) {
            debug!(engine = %id, "heartbeat failure ignored; engine blocked, removed, or already in a vote round");
            return;
        }
        self.start_proposal(id, ProposalKind::Loss).await;
    }

    async fn on_heartbeat_recovered(&mut self, id: StorageEngineId) {
        if !self.blocked.contains(&id) || self.in_votes.contains(&id) || self.removed.contains(&id)
        {
            return;
        }
        self.start_proposal(id, ProposalKind::Restore).await;
    }

    async fn start_proposal(&mut self, id: StorageEngineId, kind: ProposalKind) {
        self.next_round += 1;
        let proposal = ConnectionProposal {
            storage_id: id,
            kind,
            proposer: self.node,
            round: self.next_round,
        };
        self.in_votes.insert(id);
        self.tallies
            .insert(id, VoteTally::new(proposal, self.cluster_size));
        self.rounds.insert(id, proposal.round);
        self.arm_round_expiry(id, proposal.round);
        global_metrics().inc_proposal_started(&id.to_string(), kind.as_str());
        info!(engine = %id, kind = kind.as_str(), round = proposal.round, "starting connection vote round");
        if let Err(err) = self.transport.propose(proposal).await {
            warn!(engine = %id, error = %err, "failed to broadcast proposal; round abandoned");
            self.in_votes.remove(&id);
            self.tallies.remove(&id);
            self.rounds.remove(&id);
        }
    }

    /// Every member independently re-probes the engine and casts one vote.
    fn on_proposal_created(&mut self, proposal: ConnectionProposal) {
        let id = proposal.storage_id;
        if self.removed.contains(&id) {
            return;
        }
        self.in_votes.insert(id);
        if self.rounds.insert(id, proposal.round) != Some(proposal.round) {
            self.arm_round_expiry(id, proposal.round);
        }
        let Some(gateway) = self.gateways.get(&id).cloned() else {
            debug!(engine = %id, "no local gateway; abstaining from vote round");
            return;
        };
        let transport = Arc::clone(&self.transport);
        let node = self.node;
        let timeout = self.settings.timeout;
        tokio::spawn(async move {
            let alive = probe(gateway.as_ref(), timeout, 1).await;
            let vote = ConnectionVote {
                storage_id: id,
                voter: node,
                round: proposal.round,
                alive,
            };
            if let Err(err) = transport.vote(vote).await {
                warn!(engine = %id, error = %err, "failed to cast connection vote");
            }
        });
    }

    /// The proposer aggregates votes and publishes the resolution once a
    /// quorum is reached; other members only observe the update.
    async fn on_vote_cast(&mut self, vote: ConnectionVote) {
        let Some(tally) = self.tallies.get_mut(&vote.storage_id) else {
            return;
        };
        let Some(outcome) = tally.record(&vote) else {
            return;
        };
        let proposal = *tally.proposal();
        self.tallies.remove(&vote.storage_id);
        if proposal.proposer != self.node {
            return;
        }
        let update = ProposalUpdate { proposal, outcome };
        if let Err(err) = self.transport.publish_update(update).await {
            warn!(engine = %proposal.storage_id, error = %err, "failed to publish vote resolution");
        }
    }

    fn on_proposal_resolved(&mut self, update: ProposalUpdate) {
        let id = update.proposal.storage_id;
        self.in_votes.remove(&id);
        self.tallies.remove(&id);
        self.rounds.remove(&id);
        match update.outcome {
            ProposalOutcome::ConfirmedDown => {
                // Edge-triggered: a redelivered update must not re-block or
                // re-trigger migration.
                if self.blocked.insert(id) {
                    if let Some(gateway) = self.gateways.get(&id) {
                        gateway.set_blocked(true);
                    }
                    global_metrics().set_storages_blocked(self.blocked.len() as u64);
                    warn!(engine = %id, "connection loss confirmed by quorum; engine blocked");
                    if update.proposal.proposer == self.node {
                        self.migration.migrate(id);
                    }
                }
            }
            ProposalOutcome::ConfirmedAlive => {
                if self.blocked.remove(&id) {
                    if let Some(gateway) = self.gateways.get(&id) {
                        gateway.set_blocked(false);
                    }
                    global_metrics().set_storages_blocked(self.blocked.len() as u64);
                    info!(engine = %id, "engine restored by quorum; unblocked");
                }
            }
        }
    }

    fn arm_round_expiry(&self, id: StorageEngineId, round: u64) {
        let events = self.events.clone();
        let deadline = self.settings.vote_round_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = events.send(LivenessEvent::RoundExpired {
                storage_id: id,
                round,
            });
        });
    }

    /// A round that misses its quorum deadline is abandoned, so a later
    /// heartbeat failure or recovery can open a fresh one.
    fn on_round_expired(&mut self, id: StorageEngineId, round: u64) {
        if self.rounds.get(&id) != Some(&round) {
            return;
        }
        self.rounds.remove(&id);
        self.in_votes.remove(&id);
        self.tallies.remove(&id);
        let err = PqError::VoteExpired(format!("engine {id} round {round}"));
        warn!(engine = %id, round, error = %err, "vote round abandoned without quorum");
    }
}

/// Heartbeat loop for one gateway. Jittered start so a cluster restart does
/// not probe every engine in lockstep.
///
/// For an alive engine, all retries failing in one period counts as a
/// heartbeat failure. For a blocked engine only an occasional probe is sent,
/// to avoid hammering a node the cluster already agreed is down.
async fn heartbeat_loop(
    gateway: Arc<StorageGateway>,
    settings: HeartbeatSettings,
    events: mpsc::UnboundedSender<LivenessEvent>,
) {
    let id = gateway.engine_id();
    let mut rng = StdRng::from_entropy();
    tokio::time::sleep(settings.interval.mul_f64(rng.gen::<f64>())).await;
    loop {
        if gateway.is_blocked() {
            if rng.gen_bool(settings.restore_probability)
                && probe(gateway.as_ref(), settings.timeout, 1).await
                && events
                    .send(LivenessEvent::HeartbeatRecovered { storage_id: id })
                    .is_err()
            {
                break;
            }
        } else if !probe(gateway.as_ref(), settings.timeout, settings.max_retries).await {
            global_metrics().inc_heartbeat_failure(&id.to_string());
            if events
                .send(LivenessEvent::HeartbeatFailed { storage_id: id })
                .is_err()
            {
                break;
            }
        }
        tokio::time::sleep(settings.interval).await;
    }
}

async fn probe(gateway: &StorageGateway, timeout: Duration, attempts: u32) -> bool {
    for _ in 0..attempts.max(1) {
        match tokio::time::timeout(timeout, gateway.adapter().echo(timeout)).await {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => {
                debug!(engine = %gateway.engine_id(), error = %err, "echo failed")
            }
            Err(_) => debug!(engine = %gateway.engine_id(), "echo timed out"),
        }
    }
    false
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
