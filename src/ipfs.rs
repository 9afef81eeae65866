//! Content-addressed blob store client
//!
//! Session descriptions are too large for a ledger transaction, so they are
//! pinned to an IPFS pinning service and only the resulting CID crosses the
//! chain. Uploads and fetches are independent and order-insensitive; no retry
//! is performed here, callers decide.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::IpfsConfig;
use crate::error::{Error, Result};

/// Storage seam for session-description payloads.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Upload an opaque payload, returning its content identifier.
    async fn store(&self, payload: String) -> Result<String>;

    /// Fetch the raw payload for a previously returned identifier.
    async fn fetch(&self, cid: &str) -> Result<String>;
}

/// Fetch a blob and decode it as JSON.
pub async fn fetch_json<T: DeserializeOwned>(store: &dyn BlobStore, cid: &str) -> Result<T> {
    let raw = store.fetch(cid).await?;
    serde_json::from_str(&raw).map_err(|e| Error::Decode(format!("blob {}: {}", cid, e)))
}

#[derive(Debug, Deserialize)]
struct PinResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: String,
}

/// Client for a Pinata-style pinning endpoint plus gateway.
///
/// One instance is shared process-wide; `reqwest::Client` is safe under
/// concurrent independent calls.
pub struct PinataClient {
    http: reqwest::Client,
    api_url: String,
    gateway_url: String,
    api_key: String,
    api_secret: String,
}

impl PinataClient {
    pub fn new(config: &IpfsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: config.api_url.clone(),
            gateway_url: config.gateway_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
        }
    }
}

#[async_trait]
impl BlobStore for PinataClient {
    async fn store(&self, payload: String) -> Result<String> {
        let payload_len = payload.len();
        let response = self
            .http
            .post(&self.api_url)
            .header("pinata_api_key", &self.api_key)
            .header("pinata_secret_api_key", &self.api_secret)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| Error::Upload(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upload(format!(
                "pinning endpoint returned {}",
                status
            )));
        }

        let pin: PinResponse = response
            .json()
            .await
            .map_err(|e| Error::Upload(format!("bad pinning response: {}", e)))?;

        debug!("Pinned {} bytes as {}", payload_len, pin.ipfs_hash);
        Ok(pin.ipfs_hash)
    }

    async fn fetch(&self, cid: &str) -> Result<String> {
        let url = format!("{}/ipfs/{}", self.gateway_url, cid);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::NotFound(format!("{}: {}", cid, e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(cid.to_string()));
        }
        if !response.status().is_success() {
            return Err(Error::NotFound(format!(
                "{}: gateway returned {}",
                cid,
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| Error::Decode(format!("blob {}: {}", cid, e)))
    }
}
