// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tally: recording reverse proxy
//
//  Data plane:  monoio thread-per-core workers (capture + forward)
//  Recorder:    tokio runtime, one batcher task, PostgreSQL bulk insert
//  Admin:       axum /health and /metrics on the same tokio runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tally_core::TallyConfig;
use tally_core::config::UpstreamScheme;
use tally_proxy::{
    Capture, ConnLimits, HttpTransport, HttpsTransport, Upstream, WorkerConfig, spawn_workers,
};
use tally_recorder::{EntrySender, RecorderHandle, RecorderMetrics};
use tally_server::admin::{self, AdminState};
use tally_store::PgPersister;
use tracing::{error, info};

/// Global shutdown flag, set by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "tally", version, about = "Tally: reverse proxy that records every exchange")]
struct Cli {
    /// Path to a YAML configuration file (optional; env vars always apply)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Tally starting");

    // ── Config ──
    if let Some(path) = &cli.config {
        info!(path = %path.display(), "Loading config file");
    }
    let config = TallyConfig::load(cli.config.as_deref())?;
    let num_workers = config.effective_workers();

    #[cfg(unix)]
    raise_fd_limit();

    // ── Recorder runtime ──
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("tally-recorder")
        .enable_all()
        .build()?;

    let metrics = Arc::new(RecorderMetrics::new(config.metrics.enabled)?);
    let (recorder, store) = rt.block_on(async {
        let store = Arc::new(PgPersister::connect_lazy(&config.store)?);
        let recorder =
            RecorderHandle::start(&config.recorder, store.clone(), Arc::clone(&metrics));
        Ok::<_, anyhow::Error>((recorder, store))
    })?;

    // ── Admin endpoint ──
    if config.admin.enabled {
        let state = Arc::new(AdminState {
            metrics: Arc::clone(&metrics),
            sender: recorder.sender(),
            recorder: config.recorder.clone(),
            upstream: config.upstream_url(),
        });
        let admin_config = config.admin.clone();
        rt.spawn(async move {
            if let Err(e) = admin::start_admin(admin_config, state).await {
                error!(error = %e, "Admin endpoint failed");
            }
        });
    }

    // ── Spawn monoio worker threads ──
    let stop = Arc::new(AtomicBool::new(false));
    let worker_config = WorkerConfig {
        addr: config.listen_addr(),
        workers: num_workers,
        limits: ConnLimits {
            max_head_bytes: config.proxy.max_head_bytes,
            ..ConnLimits::default()
        },
    };
    let workers = match start_data_plane(&config, worker_config, recorder.sender(), &stop) {
        Ok(handles) => handles,
        Err(e) => {
            rt.block_on(recorder.shutdown());
            return Err(e);
        }
    };

    info!(
        port = config.proxy.port,
        upstream = %config.upstream_url(),
        workers = num_workers,
        "Tally is ready, serving traffic"
    );

    // ── Graceful shutdown: wait for SIGTERM/SIGINT ──
    setup_signal_handler();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    info!("Shutdown signal received, stopping...");

    // Workers first, so cancelled exchanges land in the queue before the
    // final flush.
    stop.store(true, Ordering::Relaxed);
    for handle in workers {
        if handle.join().is_err() {
            error!("Worker thread panicked");
        }
    }

    rt.block_on(async {
        recorder.shutdown().await;
        store.close().await;
    });

    info!("Tally stopped");
    Ok(())
}

/// Build the per-worker handler for the configured scheme and start the
/// workers.
fn start_data_plane(
    config: &TallyConfig,
    worker_config: WorkerConfig,
    sender: EntrySender,
    stop: &Arc<AtomicBool>,
) -> anyhow::Result<Vec<std::thread::JoinHandle<()>>> {
    let upstream = &config.upstream;
    let scheme = upstream.scheme;
    let host = upstream.host.clone().unwrap_or_default();
    let authority = if host.contains(':') {
        host.clone()
    } else {
        format!("{host}:{}", scheme.default_port())
    };
    let timeout = upstream.connect_timeout();
    let pool_size = upstream.keepalive_pool_size;
    let max_body = config.proxy.max_body_bytes;
    let stop = Arc::clone(stop);

    let handles = match scheme {
        UpstreamScheme::Http => {
            let transport = HttpTransport::new(authority, timeout);
            spawn_workers(
                worker_config,
                move |_| {
                    Capture::new(
                        Upstream::new(transport.clone(), pool_size),
                        sender.clone(),
                        max_body,
                    )
                },
                stop,
            )?
        }
        UpstreamScheme::Https => {
            let sni = host.split(':').next().unwrap_or_default().to_string();
            let transport = HttpsTransport::new(&sni, authority, timeout)?;
            spawn_workers(
                worker_config,
                move |_| {
                    Capture::new(
                        Upstream::new(transport.clone(), pool_size),
                        sender.clone(),
                        max_body,
                    )
                },
                stop,
            )?
        }
    };
    Ok(handles)
}

/// Raise RLIMIT_NOFILE to min(hard_limit, 65536) so workers can hold client
/// connections plus their upstream keep-alive pools.
#[cfg(unix)]
fn raise_fd_limit() {
    unsafe {
        let mut rl = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) != 0 {
            tracing::warn!("getrlimit(RLIMIT_NOFILE) failed, fd limit unchanged");
            return;
        }
        let hard = rl.rlim_max;
        let target: libc::rlim_t = if hard == libc::RLIM_INFINITY || hard > 65536 {
            65536
        } else {
            hard
        };
        if rl.rlim_cur >= target {
            tracing::debug!(limit = rl.rlim_cur, "fd limit already sufficient");
            return;
        }
        rl.rlim_cur = target;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &rl) != 0 {
            tracing::warn!(tried = target, "setrlimit(RLIMIT_NOFILE) failed");
        } else {
            tracing::info!(limit = target, "File descriptor limit raised");
        }
    }
}

fn setup_signal_handler() {
    // SIGTERM (docker stop) + SIGINT (Ctrl+C)
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
