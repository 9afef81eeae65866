//! Types for the on-chain WebRTC rendezvous protocol

use serde::{Deserialize, Serialize};

/// Ledger account address acting as the peer's identity.
///
/// Opaque and externally issued; used as the key for sessions and channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for display: first 8 chars, ellipsis, last 4.
    /// Same rendering the reference UI uses for channel labels and senders.
    pub fn short(&self) -> String {
        let s = &self.0;
        if s.len() <= 12 {
            s.clone()
        } else {
            format!("{}...{}", &s[..8], &s[s.len() - 4..])
        }
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which side of the handshake this session plays. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    /// The legal status sequence for this role. Transitions only ever move
    /// forward along this path.
    pub fn path(&self) -> &'static [ConnectionStatus] {
        match self {
            Role::Offerer => &[
                ConnectionStatus::Init,
                ConnectionStatus::Offering,
                ConnectionStatus::Offered,
                ConnectionStatus::AnswerReceived,
                ConnectionStatus::Connected,
            ],
            Role::Answerer => &[
                ConnectionStatus::OfferReceived,
                ConnectionStatus::Answering,
                ConnectionStatus::Answered,
                ConnectionStatus::Connected,
            ],
        }
    }

    /// Position of `status` on this role's path, if it is on it at all.
    pub fn rank(&self, status: ConnectionStatus) -> Option<usize> {
        self.path().iter().position(|s| *s == status)
    }

    /// Status entered once the local description is candidate-complete.
    pub fn ready_status(&self) -> ConnectionStatus {
        match self {
            Role::Offerer => ConnectionStatus::Offering,
            Role::Answerer => ConnectionStatus::Answering,
        }
    }

    /// Status entered once the ledger confirms the outbound envelope.
    pub fn relayed_status(&self) -> ConnectionStatus {
        match self {
            Role::Offerer => ConnectionStatus::Offered,
            Role::Answerer => ConnectionStatus::Answered,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Offerer => write!(f, "offerer"),
            Role::Answerer => write!(f, "answerer"),
        }
    }
}

/// Handshake progress for one channel. Monotonic per session along the
/// role-specific path; never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// Store default for records created before any handshake activity.
    Uninitialized,
    // Offer side
    Init,
    Offering,
    Offered,
    AnswerReceived,
    // Answer side
    OfferReceived,
    Answering,
    Answered,
    // Both sides
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Uninitialized => "UNINITIALIZED",
            ConnectionStatus::Init => "INIT",
            ConnectionStatus::Offering => "OFFERING",
            ConnectionStatus::Offered => "OFFERED",
            ConnectionStatus::AnswerReceived => "ANSWER_RECEIVED",
            ConnectionStatus::OfferReceived => "OFFER_RECEIVED",
            ConnectionStatus::Answering => "ANSWERING",
            ConnectionStatus::Answered => "ANSWERED",
            ConnectionStatus::Connected => "CONNECTED",
        };
        write!(f, "{}", s)
    }
}

/// The unit relayed over the ledger: who is signaling whom, and where the
/// session description blob lives. Emitted once per local-description-ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub from: PeerIdentity,
    pub to: PeerIdentity,
    /// Content identifier of the pinned session description, already decoded
    /// from the event's raw byte sequence.
    pub cid: String,
}

/// Position marker into the ledger's event log. Advances only forward;
/// `None` at the call sites means "from the beginning".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCursor {
    #[serde(rename = "txDigest")]
    pub tx_digest: String,
    #[serde(rename = "eventSeq")]
    pub event_seq: u64,
}

/// One chat message in a channel's history. `id` is assigned by the store
/// at append time, never by the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub text: String,
    pub sender: String,
    pub timestamp_ms: u64,
}

impl Message {
    /// Build a message stamped with the current wall clock. The store fills
    /// in the real id on append.
    pub fn now(text: impl Into<String>, sender: impl Into<String>) -> Self {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            id: 0,
            text: text.into(),
            sender: sender.into(),
            timestamp_ms,
        }
    }
}

/// Sender label used for locally sent messages.
pub const SELF_SENDER: &str = "Me";

/// Configuration for the rendezvous manager
#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// STUN servers for NAT traversal
    pub stun_servers: Vec<String>,
    /// Fixed delay between ledger event queries, in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum events fetched per query
    pub page_size: usize,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun.cloudflare.com:3478".to_string(),
            ],
            poll_interval_ms: 15_000,
            page_size: 5,
        }
    }
}
