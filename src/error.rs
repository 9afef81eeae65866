//! Error types for chainrtc

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Local resource acquisition denied: {0}")]
    ResourceDenied(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Blob upload failed: {0}")]
    Upload(String),

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Transaction submission failed: {0}")]
    Submission(String),

    #[error("Transaction {0} not finalized within {1:?}")]
    FinalityTimeout(String, std::time::Duration),

    #[error("Event query failed: {0}")]
    Polling(String),

    #[error("No open data channel for peer {0}")]
    NotConnected(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
