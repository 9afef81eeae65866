//! WebRTC connection establishment over an on-chain rendezvous channel

pub mod peer;
pub mod poller;
pub mod signaling;
pub mod types;


pub use peer::{Session, SessionEvent};
pub use poller::EventPoller;
pub use signaling::{RtcManager, SessionRegistry};
pub use types::{
    ConnectionStatus, EventCursor, Message, PeerIdentity, Role, RtcConfig, SignalingEnvelope,
    SELF_SENDER,
};
