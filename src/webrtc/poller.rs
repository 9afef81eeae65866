//! Resumable, cursor-tracked polling of the ledger's event log
//!
//! Wraps the ledger's query primitive into a fixed-interval loop that yields
//! only unseen events, in ascending order. The cursor advances only on a
//! non-empty page and never moves on a failed cycle, so no event is skipped
//! or delivered twice.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::types::{EventCursor, PeerIdentity, SignalingEnvelope};
use crate::ledger::LedgerRelay;

pub struct EventPoller {
    ledger: Arc<dyn LedgerRelay>,
    /// Only envelopes addressed to this identity are delivered.
    identity: PeerIdentity,
    interval: Duration,
    page_size: usize,
    delivery: mpsc::Sender<SignalingEnvelope>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EventPoller {
    pub fn new(
        ledger: Arc<dyn LedgerRelay>,
        identity: PeerIdentity,
        interval: Duration,
        page_size: usize,
        delivery: mpsc::Sender<SignalingEnvelope>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ledger,
            identity,
            interval,
            page_size,
            delivery,
            shutdown_rx,
        }
    }

    /// Poll until shutdown. Query errors are logged and the loop continues
    /// on its next tick with the cursor unchanged; nothing here is fatal.
    pub async fn run(mut self) {
        // Start at the log's current tip so history is never replayed.
        let mut cursor: Option<EventCursor> = loop {
            match self.ledger.latest_cursor().await {
                Ok(cursor) => break cursor,
                Err(e) => {
                    warn!("Event poll bootstrap failed: {}", e);
                    if self.sleep_or_shutdown().await {
                        return;
                    }
                }
            }
        };
        debug!(
            "Polling events for {} from cursor {:?}",
            self.identity.short(),
            cursor
        );

        loop {
            match self
                .ledger
                .query_events_since(cursor.as_ref(), self.page_size)
                .await
            {
                Ok(page) => {
                    if !page.events.is_empty() {
                        debug!("Got {} new events", page.events.len());
                        if let Some(next) = page.next_cursor {
                            cursor = Some(next);
                        }
                        for envelope in page.events {
                            if envelope.to != self.identity {
                                continue;
                            }
                            if self.delivery.send(envelope).await.is_err() {
                                // Receiver gone; the manager is shutting down.
                                return;
                            }
                        }
                    }
                }
                Err(e) => warn!("Event query failed, cursor unchanged: {}", e),
            }

            if self.sleep_or_shutdown().await {
                return;
            }
        }
    }

    /// Sleep one interval; true means shutdown was requested meanwhile.
    async fn sleep_or_shutdown(&mut self) -> bool {
        tokio::select! {
            changed = self.shutdown_rx.changed() => match changed {
                Ok(()) => *self.shutdown_rx.borrow(),
                Err(_) => true,
            },
            _ = tokio::time::sleep(self.interval) => false,
        }
    }
}
