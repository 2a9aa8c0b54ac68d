use crate::metrics::RecorderMetrics;
use crate::persister::Persister;
use crate::queue::EntryReceiver;
use std::sync::Arc;
use std::time::Duration;
use tally_core::LogEntry;
use tally_core::config::RecorderConfig;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, error, info};

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Batch reached `batch_size`.
    Size,
    /// Periodic timer fired.
    Tick,
    /// Final flush while stopping.
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Tick => "tick",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Batch accumulator and flush scheduler.
///
/// Exactly one runs per process. It alone owns the batch, so no lock
/// guards it; producers only ever touch the intake queue.
pub struct Batcher {
    rx: EntryReceiver,
    persister: Arc<dyn Persister>,
    metrics: Arc<RecorderMetrics>,
    batch: Vec<LogEntry>,
    batch_size: usize,
    flush_interval: Duration,
    flush_timeout: Duration,
}

impl Batcher {
    pub fn new(
        rx: EntryReceiver,
        persister: Arc<dyn Persister>,
        config: &RecorderConfig,
        metrics: Arc<RecorderMetrics>,
    ) -> Self {
        Self {
            rx,
            persister,
            metrics,
            batch: Vec::with_capacity(config.batch_size),
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            flush_timeout: config.flush_timeout(),
        }
    }

    /// Run until `shutdown` fires (or its sender is dropped), then drain the
    /// queue and flush one last time.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    self.drain().await;
                    return;
                }
                maybe = self.rx.recv() => match maybe {
                    Some(entry) => {
                        self.batch.push(entry);
                        if self.batch.len() >= self.batch_size {
                            self.flush(FlushTrigger::Size).await;
                            ticker.reset();
                        }
                    }
                    // Every sender is gone; nothing more can arrive.
                    None => {
                        self.flush(FlushTrigger::Shutdown).await;
                        return;
                    }
                },
                _ = ticker.tick() => {
                    self.flush(FlushTrigger::Tick).await;
                    ticker.reset();
                }
            }
        }
    }

    /// Close the queue and persist everything still in it.
    async fn drain(&mut self) {
        self.rx.close();
        let mut drained = 0usize;
        while let Some(entry) = self.rx.recv().await {
            drained += 1;
            self.batch.push(entry);
            if self.batch.len() >= self.batch_size {
                self.flush(FlushTrigger::Shutdown).await;
            }
        }
        self.flush(FlushTrigger::Shutdown).await;
        info!(drained, "Recorder drained intake queue");
    }

    /// Persist the current batch, then clear it whatever the outcome.
    async fn flush(&mut self, trigger: FlushTrigger) {
        if self.batch.is_empty() {
            return;
        }

        let mut batch = std::mem::take(&mut self.batch);
        let count = batch.len();
        let started = Instant::now();

        let outcome = match timeout(self.flush_timeout, self.persister.persist(&batch)).await {
            Ok(Ok(())) => {
                debug!(count, trigger = trigger.as_str(), store = self.persister.name(), "Flushed request logs");
                "ok"
            }
            Ok(Err(e)) => {
                error!(count, trigger = trigger.as_str(), error = %e, "Failed to insert request logs, discarding batch");
                "error"
            }
            Err(_) => {
                error!(
                    count,
                    trigger = trigger.as_str(),
                    timeout_ms = self.flush_timeout.as_millis() as u64,
                    "Request log insert timed out, discarding batch"
                );
                "timeout"
            }
        };

        self.metrics.record_flush(
            trigger.as_str(),
            outcome,
            count,
            started.elapsed().as_secs_f64(),
        );

        // Reuse the allocation; never carry entries into the next flush.
        batch.clear();
        self.batch = batch;
    }
}
