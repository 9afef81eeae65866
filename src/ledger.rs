//! Ledger relay: signed rendezvous transactions and event-log queries
//!
//! The chain is the out-of-band rendezvous channel. An outbound handshake is
//! one move call `{package}::rtc_connect::offer_connect(recipient, cid)`;
//! inbound handshakes are discovered by querying `OfferConnectEvent`s with a
//! forward-only cursor. The ledger is trusted as an ordered, append-only
//! oracle; consensus is not our concern here.

use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::LedgerConfig;
use crate::error::{Error, Result};
use crate::webrtc::types::{EventCursor, PeerIdentity, SignalingEnvelope};

/// Finality acknowledgement for a submitted transaction.
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub digest: String,
}

/// One page of the event log, oldest-first.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<SignalingEnvelope>,
    pub next_cursor: Option<EventCursor>,
}

/// Ledger seam: transaction submission and event-log reads.
#[async_trait]
pub trait LedgerRelay: Send + Sync + 'static {
    /// Record `(recipient, cid)` on chain and wait for finality. Blocks the
    /// calling task only.
    async fn submit(&self, recipient: &PeerIdentity, cid: &str) -> Result<TxReceipt>;

    /// Events strictly after `cursor`, oldest-first, capped at `page_size`.
    async fn query_events_since(
        &self,
        cursor: Option<&EventCursor>,
        page_size: usize,
    ) -> Result<EventPage>;

    /// Cursor positioned at the most recent existing event, or `None` when
    /// the log is empty. Used so history is never replayed.
    async fn latest_cursor(&self) -> Result<Option<EventCursor>>;
}

/// Ledger address for an identity key: hex of the public key bytes.
pub fn address_for(key: &SigningKey) -> PeerIdentity {
    PeerIdentity::new(format!("0x{}", hex::encode(key.verifying_key().to_bytes())))
}

/// Raw event shape as the fullnode reports it. The cid arrives as a byte
/// sequence and must be decoded as UTF-8 before use as a blob reference.
#[derive(Debug, Deserialize)]
struct RawEvent {
    id: EventCursor,
    #[serde(rename = "parsedJson")]
    parsed: RawEnvelope,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    from: String,
    to: String,
    cid: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct RawEventPage {
    #[serde(default)]
    data: Vec<RawEvent>,
    #[serde(rename = "nextCursor")]
    next_cursor: Option<EventCursor>,
}

fn decode_event(raw: RawEvent) -> Result<SignalingEnvelope> {
    let cid = String::from_utf8(raw.parsed.cid)
        .map_err(|e| Error::Decode(format!("event cid is not utf-8: {}", e)))?;
    Ok(SignalingEnvelope {
        from: PeerIdentity::new(raw.parsed.from),
        to: PeerIdentity::new(raw.parsed.to),
        cid,
    })
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcError>,
}

/// JSON-RPC client against a chain fullnode, signing with the local
/// identity key. Safe under concurrent independent calls.
pub struct HttpLedger {
    http: reqwest::Client,
    rpc_url: String,
    package_id: String,
    signing_key: SigningKey,
    address: PeerIdentity,
    finality_timeout: Duration,
    finality_poll: Duration,
}

impl HttpLedger {
    pub fn new(config: &LedgerConfig, signing_key: SigningKey) -> Self {
        let address = address_for(&signing_key);
        Self {
            http: reqwest::Client::new(),
            rpc_url: config.rpc_url.clone(),
            package_id: config.package_id.clone(),
            signing_key,
            address,
            finality_timeout: Duration::from_millis(config.finality_timeout_ms),
            finality_poll: Duration::from_millis(config.finality_poll_ms),
        }
    }

    pub fn address(&self) -> &PeerIdentity {
        &self.address
    }

    fn event_type(&self) -> String {
        format!("{}::rtc_connect::OfferConnectEvent", self.package_id)
    }

    async fn rpc(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, String> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("fullnode returned {}", status));
        }

        let rpc: RpcResponse = response.json().await.map_err(|e| e.to_string())?;
        if let Some(err) = rpc.error {
            return Err(format!("{} ({})", err.message, err.code));
        }
        rpc.result.ok_or_else(|| "empty RPC result".to_string())
    }

    async fn query_events(
        &self,
        cursor: Option<&EventCursor>,
        descending: bool,
        limit: usize,
    ) -> Result<RawEventPage> {
        let params = json!([{
            "eventType": self.event_type(),
            "cursor": cursor,
            "order": if descending { "descending" } else { "ascending" },
            "limit": limit,
        }]);

        let result = self
            .rpc("rtc_queryEvents", params)
            .await
            .map_err(Error::Polling)?;
        serde_json::from_value(result).map_err(|e| Error::Polling(format!("bad event page: {}", e)))
    }
}

#[async_trait]
impl LedgerRelay for HttpLedger {
    async fn submit(&self, recipient: &PeerIdentity, cid: &str) -> Result<TxReceipt> {
        // The signed payload is the canonical JSON of the move call.
        let tx = json!({
            "sender": self.address,
            "target": format!("{}::rtc_connect::offer_connect", self.package_id),
            "arguments": [recipient.as_str(), cid],
        });
        let tx_bytes =
            serde_json::to_vec(&tx).map_err(|e| Error::Submission(format!("encode: {}", e)))?;
        let signature = self.signing_key.sign(&tx_bytes);

        let params = json!([{
            "tx": tx,
            "signature": hex::encode(signature.to_bytes()),
            "publicKey": hex::encode(self.signing_key.verifying_key().to_bytes()),
        }]);

        let result = self
            .rpc("rtc_executeTransaction", params)
            .await
            .map_err(Error::Submission)?;
        let digest = result
            .get("digest")
            .and_then(|d| d.as_str())
            .ok_or_else(|| Error::Submission("response carried no digest".to_string()))?
            .to_string();

        debug!("Transaction submitted: {}", digest);

        // Block this task until the ledger reports finality.
        let deadline = tokio::time::Instant::now() + self.finality_timeout;
        loop {
            let status = self
                .rpc("rtc_getTransactionStatus", json!([digest]))
                .await
                .map_err(Error::Submission)?;

            match status.get("status").and_then(|s| s.as_str()) {
                Some("finalized") => {
                    debug!("Transaction confirmed: {}", digest);
                    return Ok(TxReceipt { digest });
                }
                Some("rejected") => {
                    return Err(Error::Submission(format!(
                        "transaction {} rejected by the ledger",
                        digest
                    )));
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::FinalityTimeout(digest, self.finality_timeout));
            }
            tokio::time::sleep(self.finality_poll).await;
        }
    }

    async fn query_events_since(
        &self,
        cursor: Option<&EventCursor>,
        page_size: usize,
    ) -> Result<EventPage> {
        let raw = self.query_events(cursor, false, page_size).await?;
        let next_cursor = raw.next_cursor;
        let mut events = Vec::with_capacity(raw.data.len());
        for event in raw.data {
            events.push(decode_event(event)?);
        }
        Ok(EventPage {
            events,
            next_cursor,
        })
    }

    async fn latest_cursor(&self) -> Result<Option<EventCursor>> {
        let raw = self.query_events(None, true, 1).await?;
        Ok(raw.data.into_iter().next().map(|e| e.id))
    }
}
