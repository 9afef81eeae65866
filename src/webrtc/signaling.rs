//! Signaling orchestrator: bridges sessions, the blob store, the ledger
//! relay and the event poller, and keeps the channel store synchronized
//!
//! Flow: a UI action (or inbound offer event) creates a session; the session
//! surfaces its candidate-complete local description; we pin it to the blob
//! store and relay the CID on chain; the remote poller discovers the event,
//! fetches the blob and feeds it into its own session. Once the data channel
//! opens, both sides mark the channel CONNECTED.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::peer::{Session, SessionEvent};
use super::poller::EventPoller;
use super::types::{
    ConnectionStatus, Message, PeerIdentity, Role, RtcConfig, SignalingEnvelope, SELF_SENDER,
};
use crate::error::{Error, Result};
use crate::ipfs::{fetch_json, BlobStore};
use crate::ledger::LedgerRelay;
use crate::store::ChannelStore;

/// Owned map of peer -> session, injected into the manager.
///
/// Creation is atomic with the existence check: the write lock is held
/// across construction, so the first inbound event from a peer creates the
/// session before anything else can observe its absence.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<PeerIdentity, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, peer: &PeerIdentity) -> Option<Arc<Session>> {
        self.inner.read().await.get(peer).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Construct and insert a session unless one already exists. Returns
    /// `None` (and builds nothing) when the peer is already registered.
    pub async fn create_if_absent<F, Fut>(
        &self,
        peer: &PeerIdentity,
        make: F,
    ) -> Result<Option<Arc<Session>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Session>>,
    {
        let mut sessions = self.inner.write().await;
        if sessions.contains_key(peer) {
            return Ok(None);
        }
        let session = Arc::new(make().await?);
        sessions.insert(peer.clone(), session.clone());
        Ok(Some(session))
    }
}

/// Rendezvous manager: one per local identity.
pub struct RtcManager {
    identity: PeerIdentity,
    config: RtcConfig,
    blob: Arc<dyn BlobStore>,
    ledger: Arc<dyn LedgerRelay>,
    store: ChannelStore,
    sessions: SessionRegistry,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    envelope_tx: mpsc::Sender<SignalingEnvelope>,
    envelope_rx: Mutex<Option<mpsc::Receiver<SignalingEnvelope>>>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RtcManager {
    pub fn new(
        identity: PeerIdentity,
        config: RtcConfig,
        blob: Arc<dyn BlobStore>,
        ledger: Arc<dyn LedgerRelay>,
        store: ChannelStore,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(100);
        let (envelope_tx, envelope_rx) = mpsc::channel(100);
        let (shutdown, shutdown_rx) = watch::channel(false);

        Self {
            identity,
            config,
            blob,
            ledger,
            store,
            sessions: SessionRegistry::new(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            envelope_tx,
            envelope_rx: Mutex::new(Some(envelope_rx)),
            shutdown,
            shutdown_rx,
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Handle to the store the UI reads.
    pub fn store(&self) -> ChannelStore {
        self.store.clone()
    }

    /// Signal shutdown; the run loop stops before its next turn.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Run the manager: spawn the event poller and process envelopes and
    /// session events until shutdown.
    pub async fn run(&self) {
        let mut event_rx = self
            .event_rx
            .lock()
            .await
            .take()
            .expect("event_rx already taken");
        let mut envelope_rx = self
            .envelope_rx
            .lock()
            .await
            .take()
            .expect("envelope_rx already taken");

        let poller = EventPoller::new(
            self.ledger.clone(),
            self.identity.clone(),
            Duration::from_millis(self.config.poll_interval_ms),
            self.config.page_size,
            self.envelope_tx.clone(),
            self.shutdown_rx.clone(),
        );
        tokio::spawn(poller.run());

        info!("Rendezvous manager running as {}", self.identity.short());

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(envelope) = envelope_rx.recv() => {
                    // One envelope is fully handled, fetch included, before
                    // the next is taken off the queue.
                    if let Err(e) = self.handle_envelope(envelope).await {
                        warn!("Envelope handling failed: {}", e);
                    }
                }
                Some(event) = event_rx.recv() => {
                    self.handle_session_event(event).await;
                }
            }
        }

        info!("Rendezvous manager shutting down");
        for session in self.sessions.all().await {
            session.close().await;
        }
    }

    /// Start an outbound handshake toward `peer`. Idempotent: a second call
    /// while a session exists does nothing.
    pub async fn offer_connect(&self, peer: PeerIdentity) -> Result<()> {
        let created = self
            .sessions
            .create_if_absent(&peer, || {
                Session::new(
                    peer.clone(),
                    Role::Offerer,
                    &self.config.stun_servers,
                    self.event_tx.clone(),
                )
            })
            .await?;

        let Some(session) = created else {
            debug!(
                "Session for {} already exists; connect is a no-op",
                peer.short()
            );
            return Ok(());
        };

        self.store.add_channel(&peer);
        self.store.update_status(&peer, ConnectionStatus::Init);
        info!("Offering connection to {}", peer.short());

        if let Err(e) = session.initiate().await {
            session.mark_failed();
            warn!("Offer to {} failed to start: {}", peer.short(), e);
            return Err(e);
        }
        Ok(())
    }

    /// Send text to a connected peer and record it locally.
    pub async fn send_message(&self, peer: &PeerIdentity, text: &str) -> Result<()> {
        let session = self
            .sessions
            .get(peer)
            .await
            .ok_or_else(|| Error::NotConnected(peer.to_string()))?;
        session.send_text(text).await?;
        self.store.append_message(peer, Message::now(text, SELF_SENDER));
        Ok(())
    }

    /// React to a poller-delivered envelope addressed to us: an offer when
    /// no session exists for the sender, otherwise the answer to our offer.
    async fn handle_envelope(&self, envelope: SignalingEnvelope) -> Result<()> {
        if envelope.from == self.identity {
            debug!("Skipping envelope from ourselves");
            return Ok(());
        }
        debug!(
            "Envelope from {} (cid {})",
            envelope.from.short(),
            envelope.cid
        );

        let description: RTCSessionDescription =
            fetch_json(self.blob.as_ref(), &envelope.cid).await?;

        match self.sessions.get(&envelope.from).await {
            Some(session) => {
                // Answer to our earlier offer. A duplicate or re-sent offer
                // cannot advance the machine and is dropped here.
                if !session.advance(ConnectionStatus::AnswerReceived) {
                    warn!(
                        "Ignoring envelope from {}: not expecting an answer in status {}",
                        envelope.from.short(),
                        session.status()
                    );
                    return Ok(());
                }
                info!("Got answer from {}", envelope.from.short());
                self.store
                    .update_status(&envelope.from, ConnectionStatus::AnswerReceived);
                if let Err(e) = session.apply_remote(description).await {
                    session.mark_failed();
                    return Err(e);
                }
            }
            None => {
                // Fresh inbound offer.
                info!("Got offer from {}", envelope.from.short());
                self.store.add_channel(&envelope.from);
                self.store
                    .update_status(&envelope.from, ConnectionStatus::OfferReceived);

                let created = self
                    .sessions
                    .create_if_absent(&envelope.from, || {
                        Session::new(
                            envelope.from.clone(),
                            Role::Answerer,
                            &self.config.stun_servers,
                            self.event_tx.clone(),
                        )
                    })
                    .await?;
                let Some(session) = created else {
                    return Ok(());
                };

                if let Err(e) = session.accept_offer(description).await {
                    session.mark_failed();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::LocalReady { peer, role, sdp } => {
                self.relay_local_description(peer, role, sdp).await;
            }
            SessionEvent::Open { peer } => {
                if let Some(session) = self.sessions.get(&peer).await {
                    if session.advance(ConnectionStatus::Connected) {
                        self.store.update_status(&peer, ConnectionStatus::Connected);
                        info!("Connected to {}", peer.short());
                    }
                }
            }
            SessionEvent::Data { peer, text } => {
                debug!("Message from {}: {} bytes", peer.short(), text.len());
                self.store.append_message(&peer, Message::now(text, peer.short()));
            }
            SessionEvent::Failed { peer, reason } => {
                error!("Session with {} failed: {}", peer.short(), reason);
                if let Some(session) = self.sessions.get(&peer).await {
                    session.mark_failed();
                }
            }
        }
    }

    /// Pin the ready description and relay its CID on chain. Runs as its own
    /// task: the finality wait blocks only the relay of this one session,
    /// never envelope processing. Ready fires at most once per session, so
    /// no session ever has two submissions in flight.
    async fn relay_local_description(&self, peer: PeerIdentity, role: Role, sdp: String) {
        let Some(session) = self.sessions.get(&peer).await else {
            warn!("Local description for unknown peer {}", peer.short());
            return;
        };

        if !session.advance(role.ready_status()) {
            warn!(
                "Dropping duplicate ready signal for {} in status {}",
                peer.short(),
                session.status()
            );
            return;
        }
        self.store.update_status(&peer, role.ready_status());

        let blob = self.blob.clone();
        let ledger = self.ledger.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            match relay_description(blob, ledger, session, &peer, role, sdp).await {
                Ok(advanced) => {
                    // The channel may already have opened during the
                    // finality wait; never write an older status over it.
                    if advanced {
                        store.update_status(&peer, role.relayed_status());
                    }
                    info!(
                        "Relayed {} to {}",
                        if role == Role::Offerer { "offer" } else { "answer" },
                        peer.short()
                    );
                }
                // Upload or submission failed: the channel stays visibly
                // stuck in OFFERING/ANSWERING; no silent retry.
                Err(e) => warn!("Relay to {} failed: {}", peer.short(), e),
            }
        });
    }
}

async fn relay_description(
    blob: Arc<dyn BlobStore>,
    ledger: Arc<dyn LedgerRelay>,
    session: Arc<Session>,
    peer: &PeerIdentity,
    role: Role,
    sdp: String,
) -> Result<bool> {
    let cid = blob.store(sdp).await?;
    debug!("Pinned local description for {} as {}", peer.short(), cid);

    let receipt = ledger.submit(peer, &cid).await?;
    debug!("Envelope for {} final in tx {}", peer.short(), receipt.digest);

    Ok(session.advance(role.relayed_status()))
}
