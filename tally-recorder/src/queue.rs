//! Bounded intake queue between exchanges and the batcher.
//!
//! Backed by a tokio bounded channel, which is runtime-agnostic on the
//! sending side: producers may live on the monoio data plane while the
//! receiver runs on tokio.

use crate::metrics::RecorderMetrics;
use std::sync::Arc;
use tally_core::LogEntry;
use tally_core::config::OverflowPolicy;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Result of handing an entry to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Queued,
    /// Queue full under a non-blocking path; entry discarded.
    Dropped,
    /// Recorder has shut down; entry discarded.
    Closed,
}

/// Producer half. Cheap to clone, one per worker or exchange.
#[derive(Clone)]
pub struct EntrySender {
    tx: mpsc::Sender<LogEntry>,
    policy: OverflowPolicy,
    metrics: Arc<RecorderMetrics>,
}

/// Consumer half, owned by the single batcher task.
pub struct EntryReceiver {
    rx: mpsc::Receiver<LogEntry>,
}

/// Create the intake queue with a fixed `capacity`.
pub fn intake_queue(
    capacity: usize,
    policy: OverflowPolicy,
    metrics: Arc<RecorderMetrics>,
) -> (EntrySender, EntryReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EntrySender {
            tx,
            policy,
            metrics,
        },
        EntryReceiver { rx },
    )
}

impl EntrySender {
    /// Hand one entry to the recorder.
    ///
    /// Under [`OverflowPolicy::Block`] this waits for space when the queue
    /// is full; under [`OverflowPolicy::DropNewest`] it never waits.
    pub async fn submit(&self, entry: LogEntry) -> Submit {
        self.reserve().await.submit(entry)
    }

    /// Wait for room in the queue without giving up an entry yet.
    ///
    /// A caller that may be cancelled while waiting keeps ownership of its
    /// entry until the returned [`Slot`] is in hand, so nothing is lost if
    /// the wait is abandoned. Under [`OverflowPolicy::DropNewest`] this
    /// returns at once and the slot falls back to [`Self::try_submit`].
    pub async fn reserve(&self) -> Slot<'_> {
        let permit = match self.policy {
            OverflowPolicy::Block => self.tx.reserve().await.ok(),
            OverflowPolicy::DropNewest => None,
        };
        Slot {
            sender: self,
            permit,
        }
    }

    /// Never waits. Used where awaiting is impossible (drop guards).
    pub fn try_submit(&self, entry: LogEntry) -> Submit {
        match self.tx.try_send(entry) {
            Ok(()) => {
                self.metrics.record_enqueued();
                Submit::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.record_dropped();
                warn!(capacity = self.capacity(), "Intake queue full, dropping log entry");
                Submit::Dropped
            }
            Err(TrySendError::Closed(_)) => self.closed(),
        }
    }

    fn closed(&self) -> Submit {
        self.metrics.record_dropped();
        debug!("Recorder closed, discarding log entry");
        Submit::Closed
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Fixed queue capacity.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Entries currently waiting for the batcher.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Room for one entry, obtained from [`EntrySender::reserve`].
pub struct Slot<'a> {
    sender: &'a EntrySender,
    permit: Option<mpsc::Permit<'a, LogEntry>>,
}

impl Slot<'_> {
    /// Never waits.
    pub fn submit(self, entry: LogEntry) -> Submit {
        match self.permit {
            Some(permit) => {
                permit.send(entry);
                self.sender.metrics.record_enqueued();
                Submit::Queued
            }
            None => self.sender.try_submit(entry),
        }
    }
}

impl EntryReceiver {
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    /// Refuse further entries; already-queued ones can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use std::time::Duration;
    use tally_core::{HeaderMultimap, RequestSnapshot, ResponseSnapshot};

    fn entry(uri: &str) -> LogEntry {
        LogEntry::new(
            RequestSnapshot {
                method: "GET".into(),
                host: "example.com".into(),
                uri: uri.into(),
                header: HeaderMultimap::new(),
                body: Bytes::new(),
            },
            ResponseSnapshot {
                status: 200,
                header: HeaderMultimap::new(),
                body: Bytes::new(),
            },
            Utc::now(),
        )
    }

    fn metrics() -> Arc<RecorderMetrics> {
        Arc::new(RecorderMetrics::new(true).unwrap())
    }

    #[tokio::test]
    async fn submit_preserves_fifo_order() {
        let (tx, mut rx) = intake_queue(8, OverflowPolicy::Block, metrics());
        for i in 0..5 {
            assert_eq!(tx.submit(entry(&format!("/{i}"))).await, Submit::Queued);
        }
        assert_eq!(tx.depth(), 5);
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().request.uri, format!("/{i}"));
        }
        assert_eq!(tx.depth(), 0);
    }

    #[tokio::test]
    async fn drop_newest_discards_when_full_and_counts() {
        let m = metrics();
        let (tx, mut rx) = intake_queue(2, OverflowPolicy::DropNewest, Arc::clone(&m));
        assert_eq!(tx.submit(entry("/a")).await, Submit::Queued);
        assert_eq!(tx.submit(entry("/b")).await, Submit::Queued);
        assert_eq!(tx.submit(entry("/c")).await, Submit::Dropped);

        assert_eq!(m.entries_dropped.as_ref().unwrap().get(), 1);
        assert_eq!(m.entries_enqueued.as_ref().unwrap().get(), 2);
        assert_eq!(rx.recv().await.unwrap().request.uri, "/a");
        assert_eq!(rx.recv().await.unwrap().request.uri, "/b");
    }

    #[tokio::test]
    async fn block_waits_for_space_instead_of_dropping() {
        let (tx, mut rx) = intake_queue(1, OverflowPolicy::Block, metrics());
        tx.submit(entry("/first")).await;

        let producer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.submit(entry("/second")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished(), "producer must block while the queue is full");

        assert_eq!(rx.recv().await.unwrap().request.uri, "/first");
        assert_eq!(producer.await.unwrap(), Submit::Queued);
        assert_eq!(rx.recv().await.unwrap().request.uri, "/second");
    }

    #[tokio::test]
    async fn abandoned_reserve_keeps_entry_with_caller() {
        let m = metrics();
        let (tx, mut rx) = intake_queue(1, OverflowPolicy::Block, Arc::clone(&m));
        tx.submit(entry("/first")).await;

        let waited = tokio::time::timeout(Duration::from_millis(20), tx.reserve()).await;
        assert!(waited.is_err(), "reserve must wait while the queue is full");

        assert_eq!(rx.recv().await.unwrap().request.uri, "/first");
        let slot = tx.reserve().await;
        assert_eq!(slot.submit(entry("/second")), Submit::Queued);
        assert_eq!(rx.recv().await.unwrap().request.uri, "/second");
        assert_eq!(m.entries_enqueued.as_ref().unwrap().get(), 2);
        assert_eq!(m.entries_dropped.as_ref().unwrap().get(), 0);
    }

    #[tokio::test]
    async fn slot_after_close_reports_closed() {
        let (tx, mut rx) = intake_queue(4, OverflowPolicy::Block, metrics());
        rx.close();
        assert_eq!(tx.reserve().await.submit(entry("/late")), Submit::Closed);
    }

    #[tokio::test]
    async fn submit_after_close_reports_closed() {
        let (tx, mut rx) = intake_queue(4, OverflowPolicy::Block, metrics());
        tx.submit(entry("/kept")).await;
        rx.close();
        assert!(tx.is_closed());
        assert_eq!(tx.submit(entry("/late")).await, Submit::Closed);
        assert_eq!(tx.try_submit(entry("/later")), Submit::Closed);
        // Entries queued before close are still delivered.
        assert_eq!(rx.recv().await.unwrap().request.uri, "/kept");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn capacity_is_fixed() {
        let (tx, _rx) = intake_queue(1000, OverflowPolicy::Block, Arc::new(RecorderMetrics::disabled()));
        assert_eq!(tx.capacity(), 1000);
        assert_eq!(tx.policy(), OverflowPolicy::Block);
    }
}
