//! Sync node: one task pair per peer connection plus a gossip driver
//!
//! Every connection is split into a reader task (applies incoming batches,
//! routes acks) and a writer task fed by an mpsc channel. Sync rounds read
//! the delta log, compress, send and wait for the peer's ack; a round that
//! times out feeds the retry policy. Nothing is lost on failure: the peer's
//! watermark only moves on ack, so the deltas stay queued.
//!
//! The last batch of a round also carries the audit entries the peer has
//! not acknowledged, and after a full-state transfer the sender's version
//! vector so the receiver can close its origin windows.

use super::gossip::{outgoing_for, select_targets, Outgoing};
use super::handshake::handshake;
use super::peer::{FailureOutcome, PeerState, PeerTable};
use super::retry::RetryPolicy;
use super::transport::{Dialer, PeerStream};
use crate::config::SyncConfig;
use crate::conflict::{AuditKey, ConflictEngine};
use crate::error::{NetworkErrorKind, Result, SyncError};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::optimizer::{compress, split_by_budget, LazySync};
use crate::protocol::codec::{read_frame, write_frame};
use crate::protocol::serialize::{
    decode_audit, deserialize_delta, encode_audit, serialize_delta, serialize_full_state,
};
use crate::protocol::{
    envelope, DeltaBatch, DeltaPayload, Envelope, Hello, CAP_COMPRESSION, CAP_DELTA_STATE,
    CAP_FULL_STATE, PROTOCOL_VERSION,
};
use crate::replica::{ReplicaStore, StoreEvent, DEFAULT_LOG_CAPACITY};
use crate::sync::{SystemClock, VectorClock};
use crate::ReplicaId;
use parking_lot::{Mutex, RwLock};
use prost::Message;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

const OUTBOUND_QUEUE: usize = 64;

/// Result of one gossip round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundReport {
    pub targets: Vec<ReplicaId>,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
struct PeerLink {
    generation: u64,
    outbound: mpsc::Sender<Envelope>,
    acked: Arc<watch::Sender<u64>>,
}

struct NodeInner {
    replica_id: ReplicaId,
    config: SyncConfig,
    store: Arc<ReplicaStore>,
    peers: Mutex<PeerTable>,
    links: Mutex<HashMap<ReplicaId, PeerLink>>,
    in_flight: Mutex<HashSet<ReplicaId>>,
    /// Audit entries each peer has acknowledged or sent us
    audit_known: Mutex<HashMap<ReplicaId, BTreeSet<AuditKey>>>,
    dialer: RwLock<Option<Arc<dyn Dialer>>>,
    metrics: Arc<SyncMetrics>,
    generation: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Handle to a running sync node (cheap to clone)
#[derive(Clone)]
pub struct SyncNode {
    inner: Arc<NodeInner>,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    applied: usize,
    full_state_rejected: usize,
}

/// Receiver side of a full-state transfer spanning several batches
#[derive(Debug)]
struct FullStateTransfer {
    clean: bool,
}

impl Default for FullStateTransfer {
    fn default() -> Self {
        Self { clean: true }
    }
}

/// Removes a peer from the in-flight set when the round ends
struct InFlight {
    node: Arc<NodeInner>,
    peer: ReplicaId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.node.in_flight.lock().remove(&self.peer);
    }
}

impl SyncNode {
    /// Node over an existing store
    ///
    /// # Errors
    ///
    /// `Config` if the configuration is invalid or names a different
    /// replica id than the store.
    pub fn new(config: SyncConfig, store: Arc<ReplicaStore>) -> Result<Self> {
        config.validate()?;
        if let Some(id) = &config.replica_id {
            if id != store.replica_id() {
                return Err(SyncError::Config(format!(
                    "config replica_id '{}' does not match store '{}'",
                    id,
                    store.replica_id()
                )));
            }
        }
        let policy = RetryPolicy::from_config(&config.retry);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(NodeInner {
                replica_id: store.replica_id().to_string(),
                peers: Mutex::new(PeerTable::new(policy, config.retry.exclusion_rounds)),
                metrics: store.metrics().clone(),
                config,
                store,
                links: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                audit_known: Mutex::new(HashMap::new()),
                dialer: RwLock::new(None),
                generation: AtomicU64::new(0),
                shutdown,
            }),
        })
    }

    /// Node with a fresh store built from `config`
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let replica_id = config.resolve_replica_id();
        let engine = ConflictEngine::from_config(replica_id.clone(), &config.conflict)?;
        let store = ReplicaStore::with_parts(
            replica_id.clone(),
            engine,
            Box::new(SystemClock::new()),
            DEFAULT_LOG_CAPACITY,
        );
        let mut config = config;
        config.replica_id = Some(replica_id);
        Self::new(config, Arc::new(store))
    }

    pub fn replica_id(&self) -> &str {
        &self.inner.replica_id
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.inner.dialer.write() = Some(dialer);
    }

    pub fn peer_state(&self, peer: &str) -> Option<PeerState> {
        self.inner.peers.lock().state(peer)
    }

    /// Connected peers
    pub fn connected_peers(&self) -> Vec<ReplicaId> {
        let mut peers: Vec<_> = self.inner.links.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Counters plus per-peer reachability
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self.inner.metrics.snapshot();
        let store = &self.inner.store;
        snapshot.peers = self
            .inner
            .peers
            .lock()
            .report(|peer| store.with_log(|log| log.watermark(peer)));
        snapshot
    }

    fn hello(&self) -> Hello {
        Hello {
            replica_id: self.inner.replica_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            capabilities: vec![
                CAP_DELTA_STATE.to_string(),
                CAP_FULL_STATE.to_string(),
                CAP_COMPRESSION.to_string(),
            ],
            version_vector: self.inner.store.version_vector().to_wire(),
        }
    }

    /// Handshake over `stream` and start serving the peer
    ///
    /// `expected_peer` pins the remote identity (dialed connections);
    /// accepted connections pass `None`. On failure the stream is dropped.
    pub async fn connect<S: PeerStream>(&self, mut stream: S, expected_peer: Option<&str>) -> Result<ReplicaId> {
        if let Some(peer) = expected_peer {
            self.inner.peers.lock().begin_handshake(peer);
        }
        let config = &self.inner.config;
        let remote = match handshake(
            &mut stream,
            &self.hello(),
            expected_peer,
            config.handshake_timeout(),
            config.protocol.max_frame_bytes,
        )
        .await
        {
            Ok(remote) => remote,
            Err(err) => {
                if let Some(peer) = expected_peer {
                    self.inner.peers.lock().disconnected(peer);
                }
                return Err(err);
            }
        };

        let peer = remote.replica_id.clone();
        let announced = VectorClock::from_wire(&remote.version_vector);
        // A restart may have reused sequences the peer already holds
        self.inner.store.resume_origin(announced.get(&self.inner.replica_id));
        self.inner.peers.lock().synced(&peer, announced);
        self.attach(peer.clone(), stream);
        info!(local = %self.inner.replica_id, remote = %peer, "peer connected");
        Ok(peer)
    }

    fn attach<S: PeerStream>(&self, peer: ReplicaId, stream: S) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (acked, _) = watch::channel(0u64);
        let link = PeerLink {
            generation,
            outbound,
            acked: Arc::new(acked),
        };
        self.inner.links.lock().insert(peer.clone(), link.clone());

        let span = info_span!("peer", local = %self.inner.replica_id, remote = %peer);
        let max_frame = self.inner.config.protocol.max_frame_bytes;
        tokio::spawn(write_loop(writer, outbound_rx, max_frame).instrument(span.clone()));
        let node = self.clone();
        tokio::spawn(async move { node.read_loop(peer, reader, link).await }.instrument(span));
    }

    async fn read_loop<R>(self, peer: ReplicaId, mut reader: R, link: PeerLink)
    where
        R: AsyncRead + Unpin,
    {
        let max_frame = self.inner.config.protocol.max_frame_bytes;
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut transfer = FullStateTransfer::default();
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = read_frame(&mut reader, max_frame) => frame,
            };
            match frame {
                Ok(Some((envelope, bytes))) => {
                    self.handle(&peer, &link, &mut transfer, envelope, bytes).await
                }
                Ok(None) => {
                    info!("peer closed the connection");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "connection failed");
                    break;
                }
            }
        }

        let mut links = self.inner.links.lock();
        if links.get(&peer).map(|l| l.generation) == Some(link.generation) {
            links.remove(&peer);
            drop(links);
            self.inner.peers.lock().disconnected(&peer);
        }
    }

    async fn handle(
        &self,
        peer: &str,
        link: &PeerLink,
        transfer: &mut FullStateTransfer,
        envelope: Envelope,
        bytes: usize,
    ) {
        match envelope.body {
            Some(envelope::Body::Batch(batch)) => {
                let outcome = self.apply_batch(peer, &batch);
                self.inner.metrics.record_received(outcome.applied, bytes);
                transfer.clean &= outcome.full_state_rejected == 0;
                if !batch.audit.is_empty() {
                    self.absorb_audit(peer, &batch.audit);
                }
                if !batch.covers.is_empty() {
                    self.close_covered(transfer, &batch.covers);
                }
                // Partial batches carry neither a sequence nor audit entries
                let last = batch.batch_seq > 0 || !batch.audit.is_empty();
                if last && link.outbound.send(Envelope::ack(batch.batch_seq)).await.is_err() {
                    debug!("writer gone before ack");
                }
            }
            Some(envelope::Body::Ack(ack)) => {
                self.inner.store.with_log(|log| log.ack(peer, ack.up_to));
                // Notifies even when the sequence was acked before
                link.acked.send_modify(|current| *current = (*current).max(ack.up_to));
                self.inner.peers.lock().record_success(peer);
            }
            Some(envelope::Body::Resync(resync)) => {
                info!(since = resync.since, "peer requested resync");
                self.inner.store.with_log(|log| log.rewind(peer, resync.since));
            }
            Some(envelope::Body::Hello(_)) => warn!("unexpected hello ignored"),
            None => warn!("empty envelope ignored"),
        }
    }

    /// Apply every payload of a batch
    fn apply_batch(&self, peer: &str, batch: &DeltaBatch) -> BatchOutcome {
        let store = &self.inner.store;
        let mut outcome = BatchOutcome::default();
        for payload in &batch.deltas {
            let result = deserialize_delta(payload).and_then(|delta| {
                if delta.full_state {
                    store
                        .merge_full_state(&delta.object_id, &delta.value, peer)
                        .map(|_| ())
                } else {
                    store
                        .apply_remote(
                            &delta.object_id,
                            &delta.value,
                            &delta.origin,
                            &delta.origin_seqs,
                            peer,
                            delta.hops.saturating_add(1),
                        )
                        .map(|_| ())
                }
            });
            match result {
                Ok(()) => outcome.applied += 1,
                Err(err) => {
                    if payload.full_state {
                        outcome.full_state_rejected += 1;
                    }
                    match err {
                        SyncError::Frozen { object_id, .. } => {
                            debug!(object = %object_id, "delta skipped, instance frozen");
                        }
                        err => warn!(object = %payload.object_id, error = %err, "delta rejected"),
                    }
                }
            }
        }
        outcome
    }

    fn absorb_audit(&self, peer: &str, bytes: &[u8]) {
        let audit = match decode_audit(bytes) {
            Ok(audit) => audit,
            Err(err) => {
                warn!(error = %err, "audit entries rejected");
                return;
            }
        };
        self.inner.store.merge_audit(&audit);
        self.inner
            .audit_known
            .lock()
            .entry(peer.to_string())
            .or_default()
            .extend(audit.keys().cloned());
    }

    /// End of a full-state transfer: everything the sender had applied is
    /// now merged here, unless some payload was refused
    fn close_covered(&self, transfer: &mut FullStateTransfer, covers: &HashMap<String, u64>) {
        if transfer.clean {
            let covered = VectorClock::from_wire(covers);
            let renumbered = self.inner.store.with_log(|log| log.advance_origins(&covered));
            debug!(renumbered, "origin windows advanced past full state");
        } else {
            debug!("full state partly refused, origin windows left open");
        }
        *transfer = FullStateTransfer::default();
    }

    /// One delivery attempt: send what `peer` is missing and wait for its ack
    async fn sync_round(&self, peer: &str) -> Result<usize> {
        let link = self.inner.links.lock().get(peer).cloned().ok_or_else(|| {
            SyncError::network(NetworkErrorKind::Unreachable, format!("no connection to '{}'", peer))
        })?;
        let config = &self.inner.config;
        let store = &self.inner.store;

        let outgoing = store.with_log(|log| outgoing_for(log, peer, config.gossip.max_relay_hops));
        let audit = {
            let known = self.inner.audit_known.lock();
            store.audit_missing(known.get(peer).unwrap_or(&BTreeSet::new()))
        };
        let mut covers = HashMap::new();
        let (payloads, up_to) = match outgoing {
            Outgoing::Nothing if audit.is_empty() => return Ok(0),
            Outgoing::Nothing => (Vec::new(), store.with_log(|log| log.head())),
            Outgoing::Deltas { deltas, up_to } => {
                let deltas = if config.batching.compress {
                    let (compressed, stats) = compress(deltas)?;
                    if stats.merged() > 0 {
                        self.inner.metrics.record_compression(stats.merged(), stats.saved_bytes);
                    }
                    compressed
                } else {
                    deltas
                };
                let payloads = deltas.iter().map(serialize_delta).collect::<Result<Vec<_>>>()?;
                (payloads, up_to)
            }
            Outgoing::FullState { up_to } => {
                info!(remote = peer, "peer behind log truncation, sending full state");
                // Taken first: the states read next include at least this much
                covers = store.version_vector().to_wire();
                let payloads = store
                    .full_state()
                    .iter()
                    .map(|(object_id, value)| serialize_full_state(object_id, value))
                    .collect::<Result<Vec<_>>>()?;
                (payloads, up_to)
            }
        };

        if payloads.is_empty() && audit.is_empty() {
            // Everything in range came from this peer or ran out of hops
            store.with_log(|log| log.ack(peer, up_to));
            return Ok(0);
        }

        let started = Instant::now();
        let count = payloads.len();
        let mut audit_bytes = encode_audit(&audit)?;
        let bytes: usize = payloads.iter().map(|p| p.encoded_len()).sum::<usize>() + audit_bytes.len();
        let mut acked = link.acked.subscribe();

        let mut chunks = split_by_budget(payloads, config.batching.max_bytes, DeltaPayload::encoded_len);
        if chunks.is_empty() {
            chunks.push(Vec::new());
        }
        let last = chunks.len() - 1;
        for (i, deltas) in chunks.into_iter().enumerate() {
            let batch = if i == last {
                DeltaBatch {
                    batch_seq: up_to,
                    deltas,
                    audit: std::mem::take(&mut audit_bytes),
                    covers: std::mem::take(&mut covers),
                }
            } else {
                DeltaBatch {
                    deltas,
                    ..DeltaBatch::default()
                }
            };
            link.outbound
                .send(Envelope::batch(batch))
                .await
                .map_err(|_| SyncError::network(NetworkErrorKind::Disconnected, "writer closed"))?;
        }
        debug!(remote = peer, count, up_to, "batch sent");

        let confirmed = async {
            if audit.is_empty() {
                return acked.wait_for(|seq| *seq >= up_to).await.map(|_| ());
            }
            // Audit keys need the ack for this very batch
            loop {
                acked.changed().await?;
                if *acked.borrow_and_update() >= up_to {
                    return Ok(());
                }
            }
        };
        match tokio::time::timeout(config.round_timeout(), confirmed).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(SyncError::network(
                    NetworkErrorKind::Disconnected,
                    "connection closed before ack",
                ))
            }
            Err(_) => {
                return Err(SyncError::network(
                    NetworkErrorKind::Timeout,
                    format!("no ack for {} within {:?}", up_to, config.round_timeout()),
                ))
            }
        }

        if !audit.is_empty() {
            self.inner
                .audit_known
                .lock()
                .entry(peer.to_string())
                .or_default()
                .extend(audit.keys().cloned());
        }
        self.inner.metrics.record_sent(count, bytes);
        self.inner.metrics.record_round(started.elapsed());
        Ok(count)
    }

    /// Sync with one peer, retrying timed-out rounds with backoff
    ///
    /// Returns the number of deltas delivered. A peer that exhausts its
    /// attempts is excluded from the next gossip rounds.
    pub async fn sync_with(&self, peer: &str) -> Result<usize> {
        let Some(_guard) = self.claim(peer) else {
            return Ok(0);
        };
        loop {
            let err = match self.sync_round(peer).await {
                Ok(count) => {
                    self.inner.peers.lock().record_success(peer);
                    return Ok(count);
                }
                Err(err) => err,
            };
            self.inner.metrics.record_failed_round();

            let timed_out = matches!(
                err,
                SyncError::Network {
                    kind: NetworkErrorKind::Timeout,
                    ..
                }
            );
            if !timed_out {
                warn!(remote = peer, error = %err, "sync round failed");
                return Err(err);
            }

            let (outcome, delay) = {
                let mut peers = self.inner.peers.lock();
                let outcome = peers.record_failure(peer);
                let delay = match outcome {
                    FailureOutcome::Retry { attempt } => Some(peers.policy().delay(attempt)),
                    FailureOutcome::Excluded { .. } => None,
                };
                (outcome, delay)
            };
            match (outcome, delay) {
                (FailureOutcome::Retry { attempt }, Some(delay)) => {
                    warn!(remote = peer, attempt, ?delay, "round timed out, retrying");
                    tokio::time::sleep(delay).await;
                }
                (_, _) => {
                    warn!(remote = peer, "retries exhausted, peer excluded");
                    return Err(err);
                }
            }
        }
    }

    fn claim(&self, peer: &str) -> Option<InFlight> {
        if !self.inner.in_flight.lock().insert(peer.to_string()) {
            return None;
        }
        Some(InFlight {
            node: self.inner.clone(),
            peer: peer.to_string(),
        })
    }

    /// Run one gossip round to a random fan-out of eligible peers
    ///
    /// Waits for every delivery (with retries) to finish, then drops log
    /// entries every known peer has acknowledged.
    pub async fn gossip_round(&self) -> RoundReport {
        let targets = {
            let mut peers = self.inner.peers.lock();
            peers.start_round();
            let eligible = peers.eligible();
            select_targets(&eligible, self.inner.config.gossip.fanout, &mut rand::thread_rng())
        };
        self.redial_lost_peers();

        let mut tasks = JoinSet::new();
        for peer in targets.iter().cloned() {
            let node = self.clone();
            tasks.spawn(async move { node.sync_with(&peer).await });
        }

        let mut report = RoundReport {
            targets,
            ..RoundReport::default()
        };
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(_)) => report.delivered += 1,
                _ => report.failed += 1,
            }
        }

        let known: Vec<ReplicaId> = self.inner.peers.lock().ids().cloned().collect();
        let compacted = self
            .inner
            .store
            .with_log(|log| log.compact(known.iter().map(String::as_str)));
        if compacted > 0 {
            debug!(compacted, "log entries acknowledged by every peer dropped");
        }
        report
    }

    fn redial_lost_peers(&self) {
        let Some(dialer) = self.inner.dialer.read().clone() else {
            return;
        };
        let candidates = self.inner.peers.lock().redial_candidates();
        for peer in candidates {
            let node = self.clone();
            let dialer = dialer.clone();
            tokio::spawn(async move {
                let result = match dialer.dial(&peer).await {
                    Ok(stream) => node.connect(stream, Some(&peer)).await.map(|_| ()),
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    debug!(remote = %peer, error = %err, "redial failed");
                    node.inner.peers.lock().record_failure(&peer);
                }
            });
        }
    }

    /// Administrative: clear a frozen instance and ask peers to resend
    pub async fn unfreeze(&self, object_id: &str) -> Result<()> {
        self.inner.store.unfreeze(object_id)?;
        let links: Vec<PeerLink> = self.inner.links.lock().values().cloned().collect();
        for link in links {
            let _ = link.outbound.send(Envelope::resync(0)).await;
        }
        Ok(())
    }

    /// Administrative: forget a peer entirely
    pub fn remove_peer(&self, peer: &str) {
        self.inner.links.lock().remove(peer);
        self.inner.peers.lock().remove(peer);
        self.inner.audit_known.lock().remove(peer);
        self.inner.store.with_log(|log| log.forget_peer(peer));
    }

    /// Spawn the background driver: periodic gossip plus lazy flushes
    pub fn start(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move { node.drive().await })
    }

    async fn drive(self) {
        let config = &self.inner.config;
        let mut events = self.inner.store.subscribe();
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut lazy = LazySync::from_config(&config.batching);
        let mut gossip = tokio::time::interval(config.gossip_interval());
        gossip.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut flush = tokio::time::interval(config.flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let run = tokio::select! {
                _ = shutdown.changed() => break,
                _ = gossip.tick() => true,
                _ = flush.tick() => lazy.is_due(Instant::now()),
                event = events.recv() => match event {
                    Ok(
                        StoreEvent::DeltaProduced { .. }
                        | StoreEvent::DeltaApplied { .. }
                        | StoreEvent::AuditRecorded { .. },
                    ) => {
                        lazy.observe(1, Instant::now())
                    }
                    Ok(_) => false,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        lazy.observe(missed as usize, Instant::now())
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if run {
                lazy.flushed();
                let node = self.clone();
                tokio::spawn(async move {
                    node.gossip_round().await;
                });
            }
        }
        debug!("driver stopped");
    }

    /// Stop the driver and every connection task
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.links.lock().clear();
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Envelope>, max_frame: usize)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        if let Err(err) = write_frame(&mut writer, &envelope, max_frame).await {
            warn!(error = %err, message = envelope.label(), "write failed, closing");
            break;
        }
    }
}
