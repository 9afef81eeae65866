//! Channel state store: per-peer connection status and ordered message history
//!
//! The single source of truth the UI observes. Sessions drive it through the
//! orchestrator; every mutation is synchronous and readers only ever see a
//! complete snapshot.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::webrtc::types::{ConnectionStatus, Message, PeerIdentity};

/// Status plus append-only message history for one peer.
///
/// Message ordering is arrival order: local sends are appended immediately,
/// remote sends on receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    pub status: ConnectionStatus,
    pub messages: Vec<Message>,
}

impl Default for ChannelRecord {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Uninitialized,
            messages: Vec::new(),
        }
    }
}

/// Full store contents, cloned out as one consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub channels: HashMap<PeerIdentity, ChannelRecord>,
    /// Known peers in the order they first appeared.
    pub order: Vec<PeerIdentity>,
    /// Peer the UI is currently focused on, if any.
    pub selected: Option<PeerIdentity>,
    next_id: u64,
}

impl ChatState {
    fn record_mut(&mut self, peer: &PeerIdentity) -> &mut ChannelRecord {
        if !self.order.contains(peer) {
            self.order.push(peer.clone());
        }
        self.channels.entry(peer.clone()).or_default()
    }
}

/// Cheaply cloneable handle to the process-wide channel state.
#[derive(Debug, Clone, Default)]
pub struct ChannelStore {
    inner: Arc<RwLock<ChatState>>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer in the channel list. No-op if already present.
    pub fn add_channel(&self, peer: &PeerIdentity) {
        let mut state = self.inner.write().expect("store lock poisoned");
        state.record_mut(peer);
    }

    /// Focus a known channel. No-op if `peer` was never added.
    pub fn select_channel(&self, peer: &PeerIdentity) {
        let mut state = self.inner.write().expect("store lock poisoned");
        if state.order.contains(peer) {
            state.selected = Some(peer.clone());
        }
    }

    /// Write a channel's status, creating the record if absent.
    pub fn update_status(&self, peer: &PeerIdentity, status: ConnectionStatus) {
        let mut state = self.inner.write().expect("store lock poisoned");
        state.record_mut(peer).status = status;
    }

    /// Append a message, assigning the next store-wide monotonic id.
    /// Returns the id actually assigned.
    pub fn append_message(&self, peer: &PeerIdentity, mut message: Message) -> u64 {
        let mut state = self.inner.write().expect("store lock poisoned");
        let id = state.next_id;
        state.next_id += 1;
        message.id = id;
        state.record_mut(peer).messages.push(message);
        id
    }

    pub fn status(&self, peer: &PeerIdentity) -> Option<ConnectionStatus> {
        let state = self.inner.read().expect("store lock poisoned");
        state.channels.get(peer).map(|r| r.status)
    }

    pub fn selected(&self) -> Option<PeerIdentity> {
        let state = self.inner.read().expect("store lock poisoned");
        state.selected.clone()
    }

    /// Consistent copy of the whole state.
    pub fn snapshot(&self) -> ChatState {
        self.inner.read().expect("store lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerIdentity {
        PeerIdentity::new(s)
    }

    #[test]
    fn message_ids_are_strictly_increasing_across_channels() {
        let store = ChannelStore::new();
        let a = peer("0xaaaa");
        let b = peer("0xbbbb");

        let mut ids = Vec::new();
        ids.push(store.append_message(&a, Message::now("one", "Me")));
        ids.push(store.append_message(&b, Message::now("two", "Me")));
        ids.push(store.append_message(&a, Message::now("three", "Me")));
        ids.push(store.append_message(&b, Message::now("four", "Me")));

        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "ids must be strictly increasing");
        }

        // Globally unique across all channels
        let snapshot = store.snapshot();
        let mut all: Vec<u64> = snapshot
            .channels
            .values()
            .flat_map(|r| r.messages.iter().map(|m| m.id))
            .collect();
        all.sort_unstable();
        let len = all.len();
        all.dedup();
        assert_eq!(len, all.len());
    }

    #[test]
    fn add_channel_is_idempotent() {
        let store = ChannelStore::new();
        let p = peer("0xabc123");
        store.add_channel(&p);
        store.add_channel(&p);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.order.iter().filter(|x| **x == p).count(), 1);
        assert_eq!(snapshot.channels.len(), 1);
    }

    #[test]
    fn select_unknown_channel_is_a_noop() {
        let store = ChannelStore::new();
        let known = peer("0xknown");
        store.add_channel(&known);
        store.select_channel(&known);

        store.select_channel(&peer("0xstranger"));
        assert_eq!(store.selected(), Some(known));

        let empty = ChannelStore::new();
        empty.select_channel(&peer("0xstranger"));
        assert_eq!(empty.selected(), None);
    }

    #[test]
    fn implicit_record_creation_defaults_to_uninitialized() {
        let store = ChannelStore::new();
        let p = peer("0xfresh");
        store.append_message(&p, Message::now("hello", "Me"));

        let snapshot = store.snapshot();
        let record = snapshot.channels.get(&p).unwrap();
        assert_eq!(record.status, ConnectionStatus::Uninitialized);
        // The peer list stays consistent with the channel map.
        assert!(snapshot.order.contains(&p));
    }

    #[test]
    fn update_status_overwrites_and_registers_peer() {
        let store = ChannelStore::new();
        let p = peer("0xpeer0001");
        store.update_status(&p, ConnectionStatus::Init);
        assert_eq!(store.status(&p), Some(ConnectionStatus::Init));

        store.update_status(&p, ConnectionStatus::Offering);
        assert_eq!(store.status(&p), Some(ConnectionStatus::Offering));
        assert!(store.snapshot().order.contains(&p));
    }

    #[test]
    fn messages_keep_arrival_order() {
        let store = ChannelStore::new();
        let p = peer("0xorder");
        store.append_message(&p, Message::now("first", "Me"));
        store.append_message(&p, Message::now("second", "0x123...beef"));

        let snapshot = store.snapshot();
        let texts: Vec<&str> = snapshot.channels[&p]
            .messages
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
    }
}
