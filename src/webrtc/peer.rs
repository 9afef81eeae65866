//! Per-peer connection state machine
//!
//! One `Session` per remote identity. It exclusively owns the underlying
//! peer connection and its data channel, and walks the role-specific status
//! path forward only. The local description is surfaced exactly once, after
//! ICE gathering completes; a partial, candidate-incomplete description is
//! never relayed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::types::{ConnectionStatus, PeerIdentity, Role};
use crate::error::{Error, Result};

/// Events a session emits toward the orchestrator.
#[derive(Debug)]
pub enum SessionEvent {
    /// The local description is candidate-complete and ready to relay.
    /// Fires at most once per session.
    LocalReady {
        peer: PeerIdentity,
        role: Role,
        /// Full session description as JSON (`{"type": ..., "sdp": ...}`).
        sdp: String,
    },
    /// The data channel reported open.
    Open { peer: PeerIdentity },
    /// Inbound text on the open channel. Never changes status.
    Data { peer: PeerIdentity, text: String },
    /// Negotiation failed; the session is permanently unusable.
    Failed { peer: PeerIdentity, reason: String },
}

/// Connection state machine for one remote peer.
pub struct Session {
    pub peer: PeerIdentity,
    pub role: Role,
    status: Mutex<ConnectionStatus>,
    failed: AtomicBool,
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<tokio::sync::Mutex<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::Sender<SessionEvent>,
}

impl Session {
    /// Allocate the connection primitive and local resources for one peer.
    ///
    /// Resources are requested fresh per session, never pooled. Failure to
    /// acquire them is `ResourceDenied` and leaves nothing to clean up.
    pub async fn new(
        peer: PeerIdentity,
        role: Role,
        stun_servers: &[String],
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| Error::ResourceDenied(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)
            .map_err(|e| Error::ResourceDenied(e.to_string()))?;

        // Loopback candidates let two daemons on one host pair up.
        let mut setting = SettingEngine::default();
        setting.set_include_loopback_candidate(true);

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting)
            .build();

        let ice_servers: Vec<RTCIceServer> = stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| Error::ResourceDenied(e.to_string()))?,
        );

        let peer_log = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peer = peer_log.clone();
            Box::pin(async move {
                info!("Peer {} connection state: {:?}", peer.short(), state);
            })
        }));

        Ok(Self {
            status: Mutex::new(role.path()[0]),
            failed: AtomicBool::new(false),
            peer,
            role,
            pc,
            data_channel: Arc::new(tokio::sync::Mutex::new(None)),
            events,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Mark the session permanently unusable. No further transitions occur.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    /// Move the status forward along this role's path. Returns false (and
    /// changes nothing) for regressions, repeats, off-path targets, or a
    /// failed session. Status never moves backwards.
    pub fn advance(&self, to: ConnectionStatus) -> bool {
        if self.is_failed() {
            return false;
        }
        let mut status = self.status.lock().expect("status lock poisoned");
        let (Some(current), Some(target)) = (self.role.rank(*status), self.role.rank(to)) else {
            return false;
        };
        if target <= current {
            debug!(
                "Peer {}: ignoring status {} -> {} ({})",
                self.peer.short(),
                *status,
                to,
                self.role
            );
            return false;
        }
        debug!("Peer {}: status {} -> {}", self.peer.short(), *status, to);
        *status = to;
        true
    }

    /// Begin an outbound handshake: create the data channel and the offer,
    /// then surface the candidate-complete description asynchronously.
    pub async fn initiate(&self) -> Result<()> {
        if self.role != Role::Offerer {
            return Err(Error::Negotiation(
                "initiate() is only valid for the offering side".to_string(),
            ));
        }

        let label = format!("{}-chat", self.peer);
        let dc = self
            .pc
            .create_data_channel(&label, None)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))?;
        Self::setup_dc_handlers(dc.clone(), self.peer.clone(), self.events.clone());
        *self.data_channel.lock().await = Some(dc);

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))?;

        self.spawn_local_ready_watch();
        Ok(())
    }

    /// Apply an inbound offer and begin answer negotiation.
    pub async fn accept_offer(&self, remote: RTCSessionDescription) -> Result<()> {
        if self.role != Role::Answerer {
            return Err(Error::Negotiation(
                "accept_offer() is only valid for the answering side".to_string(),
            ));
        }

        // The offerer opens the channel; grab it when it arrives.
        let peer = self.peer.clone();
        let events = self.events.clone();
        let slot = self.data_channel.clone();
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let peer = peer.clone();
            let events = events.clone();
            let slot = slot.clone();
            Box::pin(async move {
                info!("Peer {} opened data channel: {}", peer.short(), dc.label());
                Self::setup_dc_handlers(dc.clone(), peer, events);
                *slot.lock().await = Some(dc);
            })
        }));

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))?;

        self.spawn_local_ready_watch();
        Ok(())
    }

    /// Apply the remote answer to a previously sent offer.
    pub async fn apply_remote(&self, remote: RTCSessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))
    }

    /// Send text on the open data channel.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let guard = self.data_channel.lock().await;
        let dc = guard
            .as_ref()
            .ok_or_else(|| Error::NotConnected(self.peer.to_string()))?;
        dc.send_text(text.to_string()).await.map_err(|e| {
            warn!("Peer {}: send failed: {}", self.peer.short(), e);
            Error::NotConnected(self.peer.to_string())
        })?;
        Ok(())
    }

    /// Close the channel and the underlying connection.
    pub async fn close(&self) {
        if let Some(dc) = self.data_channel.lock().await.take() {
            if let Err(e) = dc.close().await {
                debug!("Peer {}: channel close: {}", self.peer.short(), e);
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!("Peer {}: connection close: {}", self.peer.short(), e);
        }
    }

    /// Wait for ICE gathering to finish, then emit the full local
    /// description. The gathering promise resolves once, so the ready
    /// signal fires at most once per session.
    fn spawn_local_ready_watch(&self) {
        let pc = self.pc.clone();
        let peer = self.peer.clone();
        let role = self.role;
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut gather_complete = pc.gathering_complete_promise().await;
            let _ = gather_complete.recv().await;

            let event = match pc.local_description().await {
                Some(desc) => match serde_json::to_string(&desc) {
                    Ok(sdp) => SessionEvent::LocalReady { peer, role, sdp },
                    Err(e) => SessionEvent::Failed {
                        peer,
                        reason: format!("description encode: {}", e),
                    },
                },
                None => SessionEvent::Failed {
                    peer,
                    reason: "no local description after gathering".to_string(),
                },
            };
            let _ = events.send(event).await;
        });
    }

    /// Wire channel callbacks into session events. Shared between the
    /// outbound channel and the one the remote side opens.
    fn setup_dc_handlers(
        dc: Arc<RTCDataChannel>,
        peer: PeerIdentity,
        events: mpsc::Sender<SessionEvent>,
    ) {
        let label = dc.label().to_string();
        let peer_open = peer.clone();
        let events_open = events.clone();
        dc.on_open(Box::new(move || {
            let peer = peer_open.clone();
            let events = events_open.clone();
            let label = label.clone();
            Box::pin(async move {
                info!("Data channel '{}' open for {}", label, peer.short());
                let _ = events.send(SessionEvent::Open { peer }).await;
            })
        }));

        let peer_err = peer.clone();
        dc.on_error(Box::new(move |e| {
            let peer = peer_err.clone();
            Box::pin(async move {
                warn!("Peer {}: data channel error: {}", peer.short(), e);
            })
        }));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let peer = peer.clone();
            let events = events.clone();
            Box::pin(async move {
                if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => {
                            let _ = events.send(SessionEvent::Data { peer, text }).await;
                        }
                        Err(e) => warn!("Peer {}: bad text frame: {}", peer.short(), e),
                    }
                } else {
                    debug!(
                        "Peer {}: ignoring {} binary bytes",
                        peer.short(),
                        msg.data.len()
                    );
                }
            })
        }));
    }
}
