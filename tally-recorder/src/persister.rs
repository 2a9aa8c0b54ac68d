use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tally_core::{LogEntry, TallyError};

/// One bulk write per flush.
///
/// Implementations must treat the batch as atomic-or-nothing; the batcher
/// discards it afterwards regardless of the result and never retries.
#[async_trait]
pub trait Persister: Send + Sync + 'static {
    /// Write `batch` (non-empty, in arrival order) to the store.
    async fn persist(&self, batch: &[LogEntry]) -> Result<(), TallyError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// In-memory persister, for tests and dry runs.
///
/// Keeps every successful batch; can be switched into a failing or slow
/// mode to simulate a store outage.
#[derive(Default)]
pub struct MemoryPersister {
    batches: Mutex<Vec<Vec<LogEntry>>>,
    attempts: Mutex<Vec<usize>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `persist` call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Sleep this long inside every `persist` call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Successfully written batches, in flush order.
    pub fn batches(&self) -> Vec<Vec<LogEntry>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Size of every batch handed to `persist`, including failed ones.
    pub fn attempts(&self) -> Vec<usize> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// All persisted entries flattened in write order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn persist(&self, batch: &[LogEntry]) -> Result<(), TallyError> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch.len());

        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(TallyError::Persistence("simulated store outage".into()));
        }

        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch.to_vec());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
