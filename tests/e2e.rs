//! End-to-end handshake test: two managers rendezvous over an in-memory
//! ledger and blob store, negotiate real in-process WebRTC connections and
//! exchange chat messages.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chainrtc::error::{Error, Result};
use chainrtc::ledger::{EventPage, LedgerRelay, TxReceipt};
use chainrtc::webrtc::types::{EventCursor, PeerIdentity, RtcConfig, SignalingEnvelope};
use chainrtc::webrtc::ConnectionStatus;
use chainrtc::{BlobStore, ChannelStore, RtcManager};

/// Shared append-only event log standing in for the chain.
#[derive(Default)]
struct Chain {
    log: Mutex<Vec<SignalingEnvelope>>,
    submissions: AtomicUsize,
}

/// One account's view of the chain: submissions are stamped with its address.
struct FakeLedger {
    chain: Arc<Chain>,
    from: PeerIdentity,
}

impl FakeLedger {
    fn cursor_at(index: usize) -> EventCursor {
        EventCursor {
            tx_digest: format!("tx-{}", index),
            event_seq: index as u64,
        }
    }
}

#[async_trait]
impl LedgerRelay for FakeLedger {
    async fn submit(&self, recipient: &PeerIdentity, cid: &str) -> Result<TxReceipt> {
        self.chain.submissions.fetch_add(1, Ordering::SeqCst);
        let mut log = self.chain.log.lock().unwrap();
        log.push(SignalingEnvelope {
            from: self.from.clone(),
            to: recipient.clone(),
            cid: cid.to_string(),
        });
        Ok(TxReceipt {
            digest: format!("digest-{}", log.len()),
        })
    }

    async fn query_events_since(
        &self,
        cursor: Option<&EventCursor>,
        page_size: usize,
    ) -> Result<EventPage> {
        let log = self.chain.log.lock().unwrap();
        let start = cursor.map(|c| c.event_seq as usize + 1).unwrap_or(0);
        let end = log.len().min(start + page_size);
        let events: Vec<SignalingEnvelope> = log.get(start..end).unwrap_or_default().to_vec();
        let next_cursor = if events.is_empty() {
            None
        } else {
            Some(Self::cursor_at(end - 1))
        };
        Ok(EventPage {
            events,
            next_cursor,
        })
    }

    async fn latest_cursor(&self) -> Result<Option<EventCursor>> {
        let log = self.chain.log.lock().unwrap();
        Ok(log.len().checked_sub(1).map(Self::cursor_at))
    }
}

/// Content-addressed in-memory blob store shared by both sides.
#[derive(Default)]
struct FakeBlob {
    blobs: Mutex<Vec<String>>,
}

#[async_trait]
impl BlobStore for FakeBlob {
    async fn store(&self, payload: String) -> Result<String> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.push(payload);
        Ok(format!("Qm{}", blobs.len() - 1))
    }

    async fn fetch(&self, cid: &str) -> Result<String> {
        let index: usize = cid
            .strip_prefix("Qm")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::NotFound(cid.to_string()))?;
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(index)
            .cloned()
            .ok_or_else(|| Error::NotFound(cid.to_string()))
    }
}

fn test_config() -> RtcConfig {
    RtcConfig {
        // Host candidates only: both peers live in this process.
        stun_servers: vec![],
        poll_interval_ms: 50,
        page_size: 5,
    }
}

fn spawn_manager(
    identity: &PeerIdentity,
    chain: &Arc<Chain>,
    blob: &Arc<FakeBlob>,
) -> (Arc<RtcManager>, ChannelStore) {
    let store = ChannelStore::new();
    let ledger = Arc::new(FakeLedger {
        chain: chain.clone(),
        from: identity.clone(),
    });
    let manager = Arc::new(RtcManager::new(
        identity.clone(),
        test_config(),
        blob.clone(),
        ledger,
        store.clone(),
    ));
    let runner = manager.clone();
    tokio::spawn(async move { runner.run().await });
    (manager, store)
}

async fn wait_for_status(
    store: &ChannelStore,
    peer: &PeerIdentity,
    expected: ConnectionStatus,
    what: &str,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        if store.status(peer) == Some(expected) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} (last status: {:?})",
            what,
            store.status(peer)
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn wait_for_message(store: &ChannelStore, peer: &PeerIdentity, text: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let snapshot = store.snapshot();
        if let Some(record) = snapshot.channels.get(peer) {
            if record.messages.iter().any(|m| m.text == text) {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for message '{}'",
            text
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn full_handshake_reaches_connected_and_carries_chat() {
    let chain = Arc::new(Chain::default());
    let blob = Arc::new(FakeBlob::default());

    let a_id = PeerIdentity::new("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
    let b_id = PeerIdentity::new("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb02");

    let (a_manager, a_store) = spawn_manager(&a_id, &chain, &blob);
    let (b_manager, b_store) = spawn_manager(&b_id, &chain, &blob);

    // Let both pollers take their starting cursor on the empty log.
    tokio::time::sleep(Duration::from_millis(200)).await;

    a_manager
        .offer_connect(b_id.clone())
        .await
        .expect("offer_connect failed");

    // Both sides converge on CONNECTED.
    wait_for_status(&a_store, &b_id, ConnectionStatus::Connected, "A connected").await;
    wait_for_status(&b_store, &a_id, ConnectionStatus::Connected, "B connected").await;

    // Exactly one offer and one answer were recorded on chain.
    assert_eq!(chain.submissions.load(Ordering::SeqCst), 2);
    {
        let log = chain.log.lock().unwrap();
        assert_eq!(log[0].from, a_id);
        assert_eq!(log[0].to, b_id);
        assert_eq!(log[1].from, b_id);
        assert_eq!(log[1].to, a_id);
    }

    // Chat: A -> B.
    a_manager
        .send_message(&b_id, "hi")
        .await
        .expect("send from A failed");
    wait_for_message(&b_store, &a_id, "hi").await;

    {
        let snapshot = b_store.snapshot();
        let record = snapshot.channels.get(&a_id).unwrap();
        let message = record.messages.iter().find(|m| m.text == "hi").unwrap();
        assert_eq!(message.sender, a_id.short());
    }

    // A's own copy is labeled "Me".
    {
        let snapshot = a_store.snapshot();
        let record = snapshot.channels.get(&b_id).unwrap();
        let message = record.messages.iter().find(|m| m.text == "hi").unwrap();
        assert_eq!(message.sender, "Me");
    }

    // And back: B -> A, appended after earlier traffic.
    b_manager
        .send_message(&a_id, "hello back")
        .await
        .expect("send from B failed");
    wait_for_message(&a_store, &b_id, "hello back").await;

    {
        let snapshot = a_store.snapshot();
        let record = snapshot.channels.get(&b_id).unwrap();
        let texts: Vec<&str> = record.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hi", "hello back"]);
    }

    a_manager.shutdown();
    b_manager.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_offer_connect_submits_exactly_one_transaction() {
    let chain = Arc::new(Chain::default());
    let blob = Arc::new(FakeBlob::default());

    let a_id = PeerIdentity::new("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa03");
    let b_id = PeerIdentity::new("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb04");

    let (a_manager, a_store) = spawn_manager(&a_id, &chain, &blob);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Duplicate intent before any status movement: second call is a no-op.
    a_manager
        .offer_connect(b_id.clone())
        .await
        .expect("first offer_connect failed");
    a_manager
        .offer_connect(b_id.clone())
        .await
        .expect("second offer_connect failed");

    // With nobody answering, A walks INIT -> OFFERING -> OFFERED and stops.
    wait_for_status(&a_store, &b_id, ConnectionStatus::Offered, "A offered").await;

    // Grace period for any (erroneous) second relay to show up.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(chain.submissions.load(Ordering::SeqCst), 1);

    a_manager.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn send_to_unknown_peer_fails_with_not_connected() {
    let chain = Arc::new(Chain::default());
    let blob = Arc::new(FakeBlob::default());

    let a_id = PeerIdentity::new("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa05");
    let (a_manager, _a_store) = spawn_manager(&a_id, &chain, &blob);

    let stranger = PeerIdentity::new("0xcccccccccccccccccccccccccccccc06");
    match a_manager.send_message(&stranger, "anyone there?").await {
        Err(Error::NotConnected(_)) => {}
        other => panic!("expected NotConnected, got {:?}", other),
    }

    a_manager.shutdown();
}
