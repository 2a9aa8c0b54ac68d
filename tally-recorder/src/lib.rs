//! The capture-to-store pipeline behind the proxy.
//!
//! Producers (one per exchange) push [`LogEntry`] values through an
//! [`EntrySender`]; exactly one [`Batcher`] task drains them into batches
//! and hands each batch to a [`Persister`].

pub mod batcher;
pub mod metrics;
pub mod persister;
pub mod queue;

pub use batcher::{Batcher, FlushTrigger};
pub use metrics::RecorderMetrics;
pub use persister::{MemoryPersister, Persister};
pub use queue::{EntryReceiver, EntrySender, Slot, Submit, intake_queue};

use std::sync::Arc;
use tally_core::config::RecorderConfig;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Owner of the running pipeline. Created once at startup by the process
/// root; the sender half is handed to whatever builds the capture layer.
pub struct RecorderHandle {
    sender: EntrySender,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RecorderHandle {
    /// Spawn the batcher task on the current tokio runtime.
    pub fn start(
        config: &RecorderConfig,
        persister: Arc<dyn Persister>,
        metrics: Arc<RecorderMetrics>,
    ) -> Self {
        let (sender, receiver) =
            intake_queue(config.queue_capacity, config.overflow, Arc::clone(&metrics));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let batcher = Batcher::new(receiver, persister, config, metrics);

        info!(
            queue_capacity = config.queue_capacity,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval_ms,
            overflow = ?config.overflow,
            "Recorder started"
        );

        let task = tokio::spawn(batcher.run(shutdown_rx));
        Self {
            sender,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// A producer handle for capture middleware.
    pub fn sender(&self) -> EntrySender {
        self.sender.clone()
    }

    /// Stop accepting entries, flush everything still queued, and wait for
    /// the batcher to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Recorder task ended abnormally");
        }
        info!("Recorder stopped");
    }
}
