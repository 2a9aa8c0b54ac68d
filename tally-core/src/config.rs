use crate::error::TallyError;
use figment::providers::{Env, Format, Yaml};
use figment::value::{Uncased, UncasedStr};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest batch a single multi-row INSERT can carry (3 binds per row,
/// 65535 bind parameters per statement).
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Data plane listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker threads. 0 = number of CPU cores.
    #[serde(default)]
    pub workers: usize,
    /// Largest request body buffered for capture.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Largest request head (request line + headers).
    #[serde(default = "default_max_head_bytes")]
    pub max_head_bytes: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    Http,
    Https,
}

impl UpstreamScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            UpstreamScheme::Http => 80,
            UpstreamScheme::Https => 443,
        }
    }
}

/// Backend the proxy forwards to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// `host` or `host:port`. Required.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_scheme")]
    pub scheme: UpstreamScheme,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Max idle keep-alive connections per worker.
    #[serde(default = "default_keepalive_pool")]
    pub keepalive_pool_size: usize,
}

/// Log store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// PostgreSQL connection string. Required.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// What a producer does when the intake queue is full.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for space: the exchange feels backpressure, no entry is lost.
    Block,
    /// Discard the new entry and count it.
    DropNewest,
}

/// Intake queue and batch flush settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,
    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,
}

/// Admin endpoint (`/health`, `/metrics`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_addr")]
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// When false, no prometheus counters are updated.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// ── Defaults ──────────────────────────────────────────────────

fn default_port() -> u16 { 8080 }
fn default_max_body_bytes() -> usize { 10 * 1024 * 1024 }
fn default_max_head_bytes() -> usize { 64 * 1024 }
fn default_scheme() -> UpstreamScheme { UpstreamScheme::Http }
fn default_connect_timeout() -> u64 { 5000 }
fn default_keepalive_pool() -> usize { 64 }
fn default_table() -> String { "request_logs".into() }
fn default_max_connections() -> u32 { 4 }
fn default_queue_capacity() -> usize { 1000 }
fn default_batch_size() -> usize { 100 }
fn default_flush_interval() -> u64 { 1000 }
fn default_flush_timeout() -> u64 { 10_000 }
fn default_overflow() -> OverflowPolicy { OverflowPolicy::Block }
fn default_admin_addr() -> String { "127.0.0.1:9180".into() }
fn default_true() -> bool { true }

// ── Impls ─────────────────────────────────────────────────────

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            upstream: UpstreamConfig::default(),
            store: StoreConfig::default(),
            recorder: RecorderConfig::default(),
            admin: AdminConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            workers: 0,
            max_body_bytes: default_max_body_bytes(),
            max_head_bytes: default_max_head_bytes(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: None,
            scheme: default_scheme(),
            connect_timeout_ms: default_connect_timeout(),
            keepalive_pool_size: default_keepalive_pool(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            table: default_table(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
            flush_timeout_ms: default_flush_timeout(),
            overflow: default_overflow(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_admin_addr(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl RecorderConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// The plain variables the proxy has always been configured with. An empty
/// value counts as unset, so the default (or the required-field error)
/// applies.
fn legacy_env_key(key: &UncasedStr) -> Option<Uncased<'_>> {
    if std::env::var_os(key.as_str()).is_none_or(|v| v.is_empty()) {
        return None;
    }
    let mapped = match key.as_str().to_ascii_uppercase().as_str() {
        "PORT" => "proxy.port",
        "UPSTREAM_HOST" => "upstream.host",
        "UPSTREAM_SCHEME" => "upstream.scheme",
        "DB_URL" => "store.url",
        _ => return None,
    };
    Some(mapped.into())
}

impl TallyConfig {
    /// Layered sources: defaults, optional YAML file, `TALLY_*` env
    /// (`__` separates sections), then `PORT`/`UPSTREAM_HOST`/
    /// `UPSTREAM_SCHEME`/`DB_URL`.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("TALLY_").split("__"))
            .merge(Env::raw().filter_map(legacy_env_key))
    }

    /// Load and validate configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, TallyError> {
        let config: TallyConfig = Self::figment(path)
            .extract()
            .map_err(|e| TallyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup checks. Any error here is fatal before binding.
    pub fn validate(&self) -> Result<(), TallyError> {
        match self.upstream.host.as_deref() {
            Some(h) if !h.trim().is_empty() => {}
            _ => return Err(TallyError::Config("UPSTREAM_HOST is required".into())),
        }
        match self.store.url.as_deref() {
            Some(u) if !u.trim().is_empty() => {}
            _ => return Err(TallyError::Config("DB_URL is required".into())),
        }
        let r = &self.recorder;
        if r.queue_capacity == 0 {
            return Err(TallyError::Config("recorder.queue_capacity must be > 0".into()));
        }
        if r.batch_size == 0 || r.batch_size > MAX_BATCH_SIZE {
            return Err(TallyError::Config(format!(
                "recorder.batch_size must be in 1..={MAX_BATCH_SIZE}"
            )));
        }
        if r.flush_interval_ms == 0 || r.flush_timeout_ms == 0 {
            return Err(TallyError::Config(
                "recorder flush interval and timeout must be > 0".into(),
            ));
        }
        if self.store.table.is_empty()
            || !self
                .store
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(TallyError::Config(format!(
                "invalid store.table: {:?}",
                self.store.table
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.proxy.port)
    }

    /// `scheme://host` for logging.
    pub fn upstream_url(&self) -> String {
        format!(
            "{}://{}",
            self.upstream.scheme.as_str(),
            self.upstream.host.as_deref().unwrap_or("")
        )
    }

    /// Effective worker count (0 → available CPUs).
    pub fn effective_workers(&self) -> usize {
        if self.proxy.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.proxy.workers
        }
    }
}
