use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Pipeline counters, gated behind `enabled`.
///
/// When disabled, no registry is created and every `record_*` call returns
/// immediately, so producers on the data plane pay nothing.
pub struct RecorderMetrics {
    enabled: bool,
    registry: Option<Registry>,
    pub entries_enqueued: Option<IntCounter>,
    pub entries_dropped: Option<IntCounter>,
    pub entries_persisted: Option<IntCounter>,
    pub entries_lost: Option<IntCounter>,
    pub flushes: Option<IntCounterVec>,
    pub flush_duration: Option<Histogram>,
}

impl RecorderMetrics {
    /// Create a new collector. When `enabled = false`, everything is None.
    pub fn new(enabled: bool) -> anyhow::Result<Self> {
        if !enabled {
            return Ok(Self::disabled());
        }

        let registry = Registry::new();

        let entries_enqueued = IntCounter::with_opts(
            Opts::new("entries_enqueued_total", "Log entries accepted by the intake queue")
                .namespace("tally"),
        )?;
        let entries_dropped = IntCounter::with_opts(
            Opts::new("entries_dropped_total", "Log entries discarded because the intake queue was full or closed")
                .namespace("tally"),
        )?;
        let entries_persisted = IntCounter::with_opts(
            Opts::new("entries_persisted_total", "Log entries written to the store")
                .namespace("tally"),
        )?;
        let entries_lost = IntCounter::with_opts(
            Opts::new("entries_lost_total", "Log entries discarded after a failed flush")
                .namespace("tally"),
        )?;
        let flushes = IntCounterVec::new(
            Opts::new("flushes_total", "Flush attempts").namespace("tally"),
            &["trigger", "outcome"],
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("flush_duration_seconds", "Bulk insert latency")
                .namespace("tally")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        registry.register(Box::new(entries_enqueued.clone()))?;
        registry.register(Box::new(entries_dropped.clone()))?;
        registry.register(Box::new(entries_persisted.clone()))?;
        registry.register(Box::new(entries_lost.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;

        Ok(Self {
            enabled: true,
            registry: Some(registry),
            entries_enqueued: Some(entries_enqueued),
            entries_dropped: Some(entries_dropped),
            entries_persisted: Some(entries_persisted),
            entries_lost: Some(entries_lost),
            flushes: Some(flushes),
            flush_duration: Some(flush_duration),
        })
    }

    /// No-op collector.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            registry: None,
            entries_enqueued: None,
            entries_dropped: None,
            entries_persisted: None,
            entries_lost: None,
            flushes: None,
            flush_duration: None,
        }
    }

    #[inline]
    pub fn record_enqueued(&self) {
        if let Some(ref c) = self.entries_enqueued {
            c.inc();
        }
    }

    #[inline]
    pub fn record_dropped(&self) {
        if let Some(ref c) = self.entries_dropped {
            c.inc();
        }
    }

    /// Record one flush attempt of `count` entries.
    pub fn record_flush(&self, trigger: &str, outcome: &str, count: usize, duration_secs: f64) {
        if !self.enabled {
            return;
        }
        if let Some(ref flushes) = self.flushes {
            flushes.with_label_values(&[trigger, outcome]).inc();
        }
        if let Some(ref hist) = self.flush_duration {
            hist.observe(duration_secs);
        }
        let counter = if outcome == "ok" {
            &self.entries_persisted
        } else {
            &self.entries_lost
        };
        if let Some(c) = counter {
            c.inc_by(count as u64);
        }
    }

    /// Render prometheus text exposition format.
    pub fn render(&self) -> String {
        if let Some(ref registry) = self.registry {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();
            encoder.encode(&metric_families, &mut buffer).unwrap_or(());
            String::from_utf8(buffer).unwrap_or_default()
        } else {
            String::new()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
