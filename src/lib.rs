pub mod config;
pub mod error;
pub mod ipfs;
pub mod ledger;
pub mod store;
pub mod webrtc;

pub use config::Config;
pub use error::{Error, Result};
pub use ipfs::{BlobStore, PinataClient};
pub use ledger::{EventPage, HttpLedger, LedgerRelay, TxReceipt};
pub use store::{ChannelRecord, ChannelStore, ChatState};
pub use webrtc::{ConnectionStatus, PeerIdentity, RtcConfig, RtcManager};
