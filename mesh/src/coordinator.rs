//! Mesh sync coordinator.
//!
//! Ties discovery, links, routing and the replica together. A sync cycle
//! with one peer runs as follows:
//!
//! 1. We send `SyncRequest` with our summary clock and the clock of every
//!    record we hold.
//! 2. The peer answers with `SyncPlan` (what it will send, what it wants)
//!    followed by a `RecordBatch` of the records it found newer or
//!    concurrent.
//! 3. We send a `RecordBatch` with what it wants and apply its batch through
//!    the conflict resolver.
//! 4. Both sides exchange `SyncComplete` with their applied counts.
//!
//! Outside of cycles, local edits are broadcast as they happen and inbound
//! traffic is relayed according to the [`Router`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tandem_engine::{CausalOrder, Record, RecordId, Timestamp, VectorClock};
use tokio::sync::{broadcast, mpsc};

use crate::config::SyncConfig;
use crate::discovery::{Peer, PeerDiscovery};
use crate::error::{LinkError, MeshError, Result};
use crate::link::{LinkEvent, PeerLink};
use crate::message::MeshMessage;
use crate::now_millis;
use crate::protocol::{MeshPayload, PeerId, RecordPayload, SessionId};
use crate::replica::{ApplyOutcome, ChangeEvent, ChangeOrigin, Replica};
use crate::router::{DropReason, RouteDecision, Router};

/// Undelivered critical messages kept per peer.
const RETRY_QUEUE_LIMIT: usize = 256;

/// How a sync cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    /// Records were exchanged but something went wrong
    Partial,
    Failure,
}

/// Result of one sync cycle with one peer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub peer_id: PeerId,
    pub session_id: SessionId,
    pub outcome: SyncOutcome,
    pub records_sent: usize,
    pub records_received: usize,
    pub records_applied: usize,
    /// Unresolved conflicts opened or extended during the cycle
    pub conflicts: usize,
    /// Records the peer reported as applied
    pub peer_applied: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    #[serde(skip)]
    exchanged: bool,
}

impl SyncResult {
    fn new(peer_id: &str, session_id: SessionId) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            session_id,
            outcome: SyncOutcome::Success,
            records_sent: 0,
            records_received: 0,
            records_applied: 0,
            conflicts: 0,
            peer_applied: 0,
            errors: Vec::new(),
            duration_ms: 0,
            exchanged: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == SyncOutcome::Success
    }
}

/// Aggregate of a `sync_with_all_peers` run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub results: Vec<SyncResult>,
}

impl SyncSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == SyncOutcome::Failure)
            .count()
    }

    pub fn records_applied(&self) -> usize {
        self.results.iter().map(|r| r.records_applied).sum()
    }

    pub fn conflicts(&self) -> usize {
        self.results.iter().map(|r| r.conflicts).sum()
    }
}

/// Last completed cycle with a peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSyncState {
    pub last_synced_at: Timestamp,
    /// Summary clock the peer reported
    pub peer_clock: VectorClock,
}

/// What a responder decided to exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangePlan {
    /// Ours, newer than or concurrent with the requester's copy
    pub send: Vec<RecordId>,
    /// The requester's, newer than or concurrent with ours
    pub want: Vec<RecordId>,
}

/// Compare local records with a requester's digest.
///
/// Concurrent copies go both ways so both sides detect the same conflict.
pub fn plan_exchange(local: &[Record], digest: &BTreeMap<RecordId, VectorClock>) -> ExchangePlan {
    let mut plan = ExchangePlan::default();
    let mut held: HashMap<&str, &VectorClock> = HashMap::with_capacity(local.len());

    for record in local {
        held.insert(record.id.as_str(), &record.clock);
        let Some(theirs) = digest.get(&record.id) else {
            plan.send.push(record.id.clone());
            continue;
        };
        if record.clock == *theirs {
            continue;
        }
        match record.clock.compare(theirs) {
            CausalOrder::After => plan.send.push(record.id.clone()),
            CausalOrder::Before => plan.want.push(record.id.clone()),
            CausalOrder::Concurrent => {
                plan.send.push(record.id.clone());
                plan.want.push(record.id.clone());
            }
        }
    }
    for id in digest.keys() {
        if !held.contains_key(id.as_str()) {
            plan.want.push(id.clone());
        }
    }
    plan.send.sort();
    plan.want.sort();
    plan
}

/// Counts from applying one batch.
#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    applied: usize,
    conflicts: usize,
}

/// A session we answered, until the initiator completes it.
struct ResponderSession {
    peer_id: PeerId,
    started_at: Timestamp,
    tally: Tally,
}

/// An initiator-side session waiting for responses.
struct SessionHandle {
    peer_id: PeerId,
    inbox: mpsc::UnboundedSender<MeshPayload>,
}

/// Orchestrates discovery, links and conflict resolution.
pub struct MeshSyncCoordinator {
    replica: Arc<Replica>,
    discovery: Arc<PeerDiscovery>,
    link: Arc<PeerLink>,
    router: Router,
    config: SyncConfig,
    sessions: DashMap<SessionId, SessionHandle>,
    /// Sessions we answered, reported on completion
    responding: DashMap<SessionId, ResponderSession>,
    peer_state: DashMap<PeerId, PeerSyncState>,
    retry: DashMap<PeerId, VecDeque<MeshMessage>>,
}

impl MeshSyncCoordinator {
    pub fn new(
        replica: Arc<Replica>,
        discovery: Arc<PeerDiscovery>,
        link: Arc<PeerLink>,
        config: SyncConfig,
    ) -> Self {
        Self {
            router: Router::new(link.local_id().clone()),
            replica,
            discovery,
            link,
            config,
            sessions: DashMap::new(),
            responding: DashMap::new(),
            peer_state: DashMap::new(),
            retry: DashMap::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        self.link.local_id()
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn discovery(&self) -> &Arc<PeerDiscovery> {
        &self.discovery
    }

    pub fn link(&self) -> &Arc<PeerLink> {
        &self.link
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn peer_sync_state(&self, peer_id: &str) -> Option<PeerSyncState> {
        self.peer_state.get(peer_id).map(|s| s.clone())
    }

    /// Sessions answered but not yet completed by their initiator.
    pub fn responder_sessions(&self) -> usize {
        self.responding.len()
    }

    /// Critical messages waiting for a peer.
    pub fn pending_retries(&self, peer_id: &str) -> usize {
        self.retry.get(peer_id).map(|q| q.len()).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Sync cycles
    // ------------------------------------------------------------------

    /// Sync concurrently with every available peer that takes part in sync
    /// and is connected or dialable. One failing peer does not stop the rest.
    pub async fn sync_with_all_peers(&self) -> SyncSummary {
        let peers: Vec<PeerId> = self
            .discovery
            .available_peers()
            .into_iter()
            .filter(|p| p.capabilities.sync)
            .filter(|p| p.address.is_some() || self.link.is_connected(&p.id))
            .map(|p| p.id)
            .collect();

        let results = join_all(peers.iter().map(|peer| self.sync_with_peer(peer))).await;
        let summary = SyncSummary { results };
        tracing::info!(
            peers = summary.results.len(),
            succeeded = summary.succeeded(),
            applied = summary.records_applied(),
            conflicts = summary.conflicts(),
            "Sync round finished"
        );
        summary
    }

    /// Run one sync cycle with a peer.
    pub async fn sync_with_peer(&self, peer_id: &str) -> SyncResult {
        let started = Instant::now();
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut result = SyncResult::new(peer_id, session_id.clone());
        tracing::info!(peer_id = %peer_id, session = %session_id, "Sync cycle started");

        let run = tokio::time::timeout(
            self.config.timeout,
            self.run_session(peer_id, &session_id, &mut result),
        )
        .await;
        self.sessions.remove(&session_id);

        let fatal = match run {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(MeshError::Timeout(peer_id.to_string())),
        };
        result.outcome = match (&fatal, result.errors.is_empty()) {
            (None, true) => SyncOutcome::Success,
            (None, false) => SyncOutcome::Partial,
            (Some(_), _) if result.exchanged => SyncOutcome::Partial,
            (Some(_), _) => SyncOutcome::Failure,
        };
        if let Some(e) = fatal {
            tracing::warn!(peer_id = %peer_id, session = %session_id, "Sync cycle failed: {}", e);
            result.errors.push(e.to_string());
        }
        result.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            peer_id = %peer_id,
            session = %session_id,
            outcome = ?result.outcome,
            sent = result.records_sent,
            received = result.records_received,
            applied = result.records_applied,
            conflicts = result.conflicts,
            duration_ms = result.duration_ms,
            "Sync cycle finished"
        );
        result
    }

    async fn run_session(
        &self,
        peer_id: &str,
        session_id: &SessionId,
        result: &mut SyncResult,
    ) -> Result<()> {
        let peer = self
            .discovery
            .get(peer_id)
            .ok_or_else(|| MeshError::PeerNotFound(peer_id.to_string()))?;
        if !peer.is_available() {
            return Err(LinkError::ConnectionFailed(format!("{peer_id} is unreachable")).into());
        }
        self.ensure_connected(&peer).await?;
        self.flush_retry(peer_id);

        let (inbox, mut rx) = mpsc::unbounded_channel();
        self.sessions.insert(
            session_id.clone(),
            SessionHandle {
                peer_id: peer_id.to_string(),
                inbox,
            },
        );

        let records = self.replica.repository().all().await?;
        let digest: BTreeMap<RecordId, VectorClock> = records
            .iter()
            .map(|r| (r.id.clone(), r.clock.clone()))
            .collect();
        let clock = summary_clock(&records);
        self.send_to(
            peer_id,
            &MeshPayload::SyncRequest {
                session_id: session_id.clone(),
                clock,
                digest,
            },
        )?;

        let (announced, want, peer_clock) = match next_payload(&mut rx).await? {
            MeshPayload::SyncPlan {
                send, want, clock, ..
            } => (send, want, clock),
            other => return Err(unexpected(&other)),
        };
        result.exchanged = true;
        tracing::debug!(
            peer_id = %peer_id,
            session = %session_id,
            incoming = announced.len(),
            wanted = want.len(),
            "Sync plan received"
        );

        let outgoing = self.replica.records(&want).await?;
        result.records_sent = outgoing.len();
        self.send_to(
            peer_id,
            &MeshPayload::RecordBatch {
                session_id: session_id.clone(),
                records: outgoing.iter().map(RecordPayload::from).collect(),
            },
        )?;

        let incoming = match next_payload(&mut rx).await? {
            MeshPayload::RecordBatch { records, .. } => records,
            other => return Err(unexpected(&other)),
        };
        result.records_received = incoming.len();
        let tally = self.apply_batch(incoming, peer_id, &mut result.errors).await;
        result.records_applied = tally.applied;
        result.conflicts = tally.conflicts;

        self.send_to(
            peer_id,
            &MeshPayload::SyncComplete {
                session_id: session_id.clone(),
                applied: tally.applied,
                conflicts: tally.conflicts,
            },
        )?;
        match next_payload(&mut rx).await? {
            MeshPayload::SyncComplete { applied, .. } => result.peer_applied = applied,
            other => return Err(unexpected(&other)),
        }

        self.peer_state.insert(
            peer_id.to_string(),
            PeerSyncState {
                last_synced_at: now_millis(),
                peer_clock,
            },
        );
        Ok(())
    }

    async fn apply_batch(
        &self,
        records: Vec<RecordPayload>,
        from: &str,
        errors: &mut Vec<String>,
    ) -> Tally {
        let mut tally = Tally::default();
        for payload in records {
            let record = match payload.into_record() {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(peer_id = %from, "Dropping invalid record: {}", e);
                    errors.push(e.to_string());
                    continue;
                }
            };
            match self.replica.apply_remote(&record, from, now_millis()).await {
                Ok(outcome) => {
                    if outcome.is_applied() {
                        tally.applied += 1;
                    }
                    if outcome.is_conflict() {
                        tally.conflicts += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(peer_id = %from, record_id = %record.id, "Failed to apply record: {}", e);
                    errors.push(e.to_string());
                }
            }
        }
        tally
    }

    // ------------------------------------------------------------------
    // Inbound traffic
    // ------------------------------------------------------------------

    /// Consume link events until the link layer goes away.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        tracing::debug!("Link event stream closed");
    }

    pub async fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected(peer_id) => {
                self.discovery.mark_connected(&peer_id, now_millis());
                self.flush_retry(&peer_id);
            }
            LinkEvent::Disconnected(peer_id) => self.discovery.mark_disconnected(&peer_id),
            LinkEvent::Message { from, message } => self.handle_message(&from, message).await,
        }
    }

    async fn handle_message(&self, from: &str, message: MeshMessage) {
        let now = now_millis();
        self.discovery.heartbeat(from, now);

        match self.router.route(&message, now) {
            RouteDecision::Drop(DropReason::IntegrityFailure) => {
                tracing::warn!(peer_id = %from, message_id = %message.id, "Dropping message with bad checksum");
            }
            RouteDecision::Drop(reason) => {
                tracing::debug!(peer_id = %from, message_id = %message.id, ?reason, "Dropping message");
            }
            RouteDecision::Forward(next) => self.relay(next),
            RouteDecision::DeliverAndForward(next) => {
                self.relay(next);
                self.deliver(from, &message).await;
            }
            RouteDecision::Deliver => self.deliver(from, &message).await,
        }
    }

    async fn deliver(&self, from: &str, message: &MeshMessage) {
        let payload = match message.decode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(peer_id = %from, message_id = %message.id, "Dropping undecodable payload: {}", e);
                return;
            }
        };
        let sender = message.sender.as_str();
        let now = now_millis();

        // Replies to our own sessions
        if let Some(session_id) = payload.session_id().cloned() {
            if let Some(handle) = self.sessions.get(&session_id) {
                if handle.peer_id == sender {
                    let _ = handle.inbox.send(payload);
                } else {
                    tracing::warn!(peer_id = %sender, session = %session_id, "Session message from wrong peer");
                }
                return;
            }
        }

        match payload {
            MeshPayload::Heartbeat { .. } => {
                self.discovery.heartbeat(sender, now);
            }
            MeshPayload::Presence { node } => {
                self.discovery.observe(&node, now);
                if sender == from {
                    self.discovery.mark_connected(from, now);
                }
            }
            MeshPayload::DiscoveryProbe { node } => {
                self.discovery.observe(&node, now);
                let reply = MeshPayload::DiscoveryReply {
                    node: self.discovery.local().clone(),
                };
                if let Err(e) = self.send_to(sender, &reply) {
                    tracing::debug!(peer_id = %sender, "Could not answer probe: {}", e);
                }
            }
            MeshPayload::DiscoveryReply { node } => {
                self.discovery.observe(&node, now);
            }
            MeshPayload::SyncRequest {
                session_id, digest, ..
            } => {
                if let Err(e) = self.respond_to_sync(sender, session_id, &digest).await {
                    tracing::warn!(peer_id = %sender, "Failed to answer sync request: {}", e);
                }
            }
            MeshPayload::RecordBatch {
                session_id,
                records,
            } => {
                // Late batches still carry valid records
                let mut errors = Vec::new();
                let tally = self.apply_batch(records, sender, &mut errors).await;
                match self
                    .responding
                    .get_mut(&session_id)
                    .filter(|s| s.peer_id == sender)
                {
                    Some(mut session) => {
                        session.tally.applied += tally.applied;
                        session.tally.conflicts += tally.conflicts;
                    }
                    None => {
                        tracing::debug!(peer_id = %sender, session = %session_id, "Batch for unknown session");
                    }
                }
            }
            MeshPayload::SyncComplete { session_id, .. } => {
                // Only sessions we answered are acknowledged; a completion
                // for anything else is a late ack and ends here.
                match self
                    .responding
                    .remove_if(&session_id, |_, s| s.peer_id == sender)
                {
                    Some((session_id, session)) => {
                        let ack = MeshPayload::SyncComplete {
                            session_id,
                            applied: session.tally.applied,
                            conflicts: session.tally.conflicts,
                        };
                        if let Err(e) = self.send_to(sender, &ack) {
                            tracing::debug!(peer_id = %sender, "Could not acknowledge sync: {}", e);
                        }
                    }
                    None => {
                        tracing::debug!(peer_id = %sender, session = %session_id, "Completion for unknown session");
                    }
                }
            }
            MeshPayload::SyncPlan { session_id, .. } => {
                tracing::debug!(peer_id = %sender, session = %session_id, "Plan for unknown session");
            }
            MeshPayload::RecordUpdate { record }
            | MeshPayload::RecordDelete { record }
            | MeshPayload::ConflictResolved { record, .. } => {
                self.apply_live(sender, record, now).await;
            }
        }
    }

    async fn respond_to_sync(
        &self,
        requester: &str,
        session_id: SessionId,
        digest: &BTreeMap<RecordId, VectorClock>,
    ) -> Result<()> {
        let records = self.replica.repository().all().await?;
        let plan = plan_exchange(&records, digest);
        tracing::debug!(
            peer_id = %requester,
            session = %session_id,
            send = plan.send.len(),
            want = plan.want.len(),
            "Answering sync request"
        );

        let outgoing = self.replica.records(&plan.send).await?;
        self.responding.insert(
            session_id.clone(),
            ResponderSession {
                peer_id: requester.to_string(),
                started_at: now_millis(),
                tally: Tally::default(),
            },
        );
        self.send_to(
            requester,
            &MeshPayload::SyncPlan {
                session_id: session_id.clone(),
                send: plan.send,
                want: plan.want,
                clock: summary_clock(&records),
            },
        )?;
        self.send_to(
            requester,
            &MeshPayload::RecordBatch {
                session_id,
                records: outgoing.iter().map(RecordPayload::from).collect(),
            },
        )
    }

    async fn apply_live(&self, sender: &str, payload: RecordPayload, now: Timestamp) {
        let record = match payload.into_record() {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(peer_id = %sender, "Dropping invalid record: {}", e);
                return;
            }
        };
        match self.replica.apply_remote(&record, sender, now).await {
            Ok(ApplyOutcome::KeptLocal) => {
                // The sender is behind; hand it our copy
                if let Ok(Some(local)) = self.replica.repository().get(&record.id).await {
                    let update = MeshPayload::RecordUpdate {
                        record: RecordPayload::from(&local),
                    };
                    if let Err(e) = self.send_to(sender, &update) {
                        tracing::debug!(peer_id = %sender, "Could not send newer copy: {}", e);
                    }
                }
            }
            Ok(outcome) => {
                tracing::debug!(peer_id = %sender, record_id = %record.id, ?outcome, "Live update applied");
            }
            Err(e) => {
                tracing::warn!(peer_id = %sender, record_id = %record.id, "Failed to apply live update: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound traffic
    // ------------------------------------------------------------------

    /// Broadcast local changes as they happen. Remote changes are not
    /// rebroadcast; the router already relays them.
    pub async fn propagate(self: Arc<Self>, mut changes: broadcast::Receiver<ChangeEvent>) {
        loop {
            let payload = match changes.recv().await {
                Ok(ChangeEvent::Record {
                    record,
                    origin: ChangeOrigin::Local,
                }) => {
                    let record_payload = RecordPayload::from(&record);
                    if record.deleted {
                        MeshPayload::RecordDelete {
                            record: record_payload,
                        }
                    } else {
                        MeshPayload::RecordUpdate {
                            record: record_payload,
                        }
                    }
                }
                Ok(ChangeEvent::ConflictResolved {
                    record,
                    origin: ChangeOrigin::Local,
                }) => MeshPayload::ConflictResolved {
                    record: RecordPayload::from(&record),
                    resolved_by: self.local_id().clone(),
                },
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Missed changes still reach peers in the next sync cycle
                    tracing::warn!(missed, "Change propagation lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if let Err(e) = self.broadcast(&payload) {
                tracing::warn!("Failed to broadcast change: {}", e);
            }
        }
    }

    /// Send a payload to every node. Returns the number of neighbours reached.
    pub fn broadcast(&self, payload: &MeshPayload) -> Result<usize> {
        let message = MeshMessage::broadcast(self.local_id().clone(), payload, now_millis())?;
        self.router.mark_seen(&message.id, message.timestamp);
        Ok(self.dispatch(message, self.link.connected_peers()))
    }

    /// Send a payload to one node, directly if connected, through the mesh
    /// otherwise.
    pub fn send_to(&self, peer_id: &str, payload: &MeshPayload) -> Result<()> {
        let message = MeshMessage::addressed(self.local_id().clone(), peer_id, payload, now_millis())?;
        self.router.mark_seen(&message.id, message.timestamp);
        let targets = if self.link.is_connected(peer_id) {
            vec![peer_id.to_string()]
        } else {
            self.link.connected_peers()
        };
        if targets.is_empty() {
            return Err(LinkError::NotConnected(peer_id.to_string()).into());
        }
        match self.dispatch(message, targets) {
            0 => Err(LinkError::SendFailed(format!("no route to {peer_id}")).into()),
            _ => Ok(()),
        }
    }

    fn relay(&self, message: MeshMessage) {
        let targets = self
            .router
            .forward_targets(&message, &self.link.connected_peers());
        tracing::trace!(message_id = %message.id, ttl = message.ttl, targets = targets.len(), "Relaying");
        self.dispatch(message, targets);
    }

    /// Send to each target; queue critical messages that fail.
    fn dispatch(&self, message: MeshMessage, targets: Vec<PeerId>) -> usize {
        let mut delivered = 0;
        for peer_id in targets {
            match self.link.send(&peer_id, message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(peer_id = %peer_id, message_id = %message.id, "Send failed: {}", e);
                    if message.message_type.is_critical() {
                        self.enqueue_retry(&peer_id, message.clone());
                    }
                }
            }
        }
        delivered
    }

    fn enqueue_retry(&self, peer_id: &str, message: MeshMessage) {
        let mut queue = self.retry.entry(peer_id.to_string()).or_default();
        if queue.len() >= RETRY_QUEUE_LIMIT {
            queue.pop_front();
        }
        queue.push_back(message);
    }

    /// Resend queued critical messages to a peer. Returns how many went out.
    pub fn flush_retry(&self, peer_id: &str) -> usize {
        let Some((_, queue)) = self.retry.remove(peer_id) else {
            return 0;
        };
        let now = now_millis();
        let mut sent = 0;
        for message in queue {
            if message.is_expired(now) {
                continue;
            }
            match self.link.send(peer_id, message.clone()) {
                Ok(()) => sent += 1,
                Err(_) => self.enqueue_retry(peer_id, message),
            }
        }
        if sent > 0 {
            tracing::info!(peer_id = %peer_id, sent, "Retried queued messages");
        }
        sent
    }

    // ------------------------------------------------------------------
    // Discovery and liveness
    // ------------------------------------------------------------------

    /// Dial a peer if needed.
    ///
    /// Peers known only through relayed traffic have no address; they are
    /// reached through the mesh instead.
    pub async fn ensure_connected(&self, peer: &Peer) -> Result<()> {
        if self.link.is_connected(&peer.id) {
            return Ok(());
        }
        match peer.address.as_deref() {
            Some(address) => self.connect_peer(&peer.id, address).await,
            None => Ok(()),
        }
    }

    /// Open a link to a peer and introduce ourselves with a presence frame.
    pub async fn connect_peer(&self, peer_id: &str, address: &str) -> Result<()> {
        match self.link.connect(peer_id, address).await {
            Ok(opened) => {
                if opened {
                    let hello = MeshPayload::Presence {
                        node: self.discovery.local().clone(),
                    };
                    self.send_to(peer_id, &hello)?;
                }
                self.discovery.mark_connected(peer_id, now_millis());
                Ok(())
            }
            Err(e) => {
                self.discovery.mark_unreachable(peer_id);
                Err(e.into())
            }
        }
    }

    /// Scan discovery sources and dial dialable peers we are not linked to.
    ///
    /// Unreachable peers are dialled too; only a successful dial brings them
    /// back, and sync never picks them until then.
    pub async fn discover(&self) -> usize {
        let found = self.discovery.scan(now_millis()).await;
        for peer in self.discovery.peers() {
            if peer.address.is_some() && !self.link.is_connected(&peer.id) {
                if let Err(e) = self.ensure_connected(&peer).await {
                    tracing::debug!(peer_id = %peer.id, "Dial failed: {}", e);
                }
            }
        }
        found
    }

    /// Broadcast our presence.
    pub fn announce(&self) -> Result<usize> {
        self.broadcast(&MeshPayload::Presence {
            node: self.discovery.local().clone(),
        })
    }

    /// Ask nearby nodes to announce themselves.
    pub fn probe(&self) -> Result<usize> {
        self.broadcast(&MeshPayload::DiscoveryProbe {
            node: self.discovery.local().clone(),
        })
    }

    /// Heartbeat neighbours, age out silent peers and old dedup entries.
    pub fn heartbeat(&self) {
        let now = now_millis();
        for peer_id in self.link.connected_peers() {
            if let Err(e) = self.send_to(&peer_id, &MeshPayload::Heartbeat { sent_at: now }) {
                tracing::debug!(peer_id = %peer_id, "Heartbeat failed: {}", e);
            }
        }
        let sweep = self.discovery.sweep(now);
        for peer_id in sweep.unreachable.iter().chain(&sweep.evicted) {
            self.link.disconnect(peer_id);
        }
        for peer_id in &sweep.evicted {
            self.retry.remove(peer_id);
            self.peer_state.remove(peer_id);
        }
        self.prune_sessions(now);
        self.router.prune_seen(now);
    }

    /// Forget answered sessions whose initiator never completed them.
    /// Returns how many were dropped.
    pub fn prune_sessions(&self, now: Timestamp) -> usize {
        let limit = 2 * self.config.timeout.as_millis() as u64;
        let mut dropped = 0;
        self.responding.retain(|session_id, session| {
            let abandoned = now.saturating_sub(session.started_at) > limit;
            if abandoned {
                tracing::debug!(peer_id = %session.peer_id, session = %session_id, "Dropping abandoned session");
                dropped += 1;
            }
            !abandoned
        });
        dropped
    }
}

fn summary_clock(records: &[Record]) -> VectorClock {
    records
        .iter()
        .fold(VectorClock::new(), |acc, r| acc.merge(&r.clock))
}

async fn next_payload(rx: &mut mpsc::UnboundedReceiver<MeshPayload>) -> Result<MeshPayload> {
    rx.recv()
        .await
        .ok_or_else(|| MeshError::Protocol("session closed".into()))
}

fn unexpected(payload: &MeshPayload) -> MeshError {
    MeshError::Protocol(format!(
        "unexpected {} in sync session",
        payload.message_type().as_str()
    ))
}
