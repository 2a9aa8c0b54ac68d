use crate::capture::Handler;
use crate::connection::{ConnLimits, handle_connection};
use monoio::net::TcpListener;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

/// How often an idle accept loop checks the stop flag.
const ACCEPT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub addr: String,
    pub workers: usize,
    pub limits: ConnLimits,
}

/// Spawn monoio worker threads, one per core.
///
/// Each thread runs an independent monoio runtime with its own listener
/// (SO_REUSEPORT), event loop, and handler built by `make_handler`. Returns
/// once every worker is listening, or the first bind error.
///
/// Setting `stop` makes every worker stop accepting and drop its runtime;
/// exchanges still in flight are cancelled and record partial entries.
pub fn spawn_workers<F, H>(
    config: WorkerConfig,
    make_handler: F,
    stop: Arc<AtomicBool>,
) -> io::Result<Vec<JoinHandle<()>>>
where
    F: Fn(usize) -> H + Send + Sync + 'static,
    H: Handler + 'static,
{
    let num_workers = config.workers.max(1);
    let make_handler = Arc::new(make_handler);
    let (ready_tx, ready_rx) = mpsc::channel::<io::Result<()>>();
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let make_handler = Arc::clone(&make_handler);
        let stop = Arc::clone(&stop);
        let ready = ready_tx.clone();
        let addr = config.addr.clone();
        let limits = config.limits;

        let handle = std::thread::Builder::new()
            .name(format!("tally-worker-{worker_id}"))
            .spawn(move || {
                let mut rt = match monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                };
                let handler = Rc::new(make_handler(worker_id));
                rt.block_on(worker_loop(worker_id, addr, handler, limits, stop, ready));
            })?;
        handles.push(handle);
    }
    drop(ready_tx);

    for _ in 0..num_workers {
        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(io::Error::other("worker exited during startup")));
        if let Err(e) = started {
            stop.store(true, Ordering::Relaxed);
            return Err(e);
        }
    }

    info!(workers = num_workers, addr = %config.addr, "Workers spawned");
    Ok(handles)
}

async fn worker_loop<H: Handler + 'static>(
    worker_id: usize,
    addr: String,
    handler: Rc<H>,
    limits: ConnLimits,
    stop: Arc<AtomicBool>,
    ready: mpsc::Sender<io::Result<()>>,
) {
    let listener = match TcpListener::bind(addr.as_str()) {
        Ok(listener) => {
            let _ = ready.send(Ok(()));
            listener
        }
        Err(e) => {
            error!(worker = worker_id, addr = %addr, error = %e, "Worker failed to bind");
            let _ = ready.send(Err(e));
            return;
        }
    };
    drop(ready);

    info!(worker = worker_id, addr = %addr, "Worker listening");

    while !stop.load(Ordering::Relaxed) {
        match monoio::time::timeout(ACCEPT_POLL, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok((stream, peer))) => {
                let _ = stream.set_nodelay(true);
                let handler = Rc::clone(&handler);
                monoio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, handler, limits).await {
                        debug!(error = %e, "Connection closed");
                    }
                });
            }
            Ok(Err(e)) => {
                error!(worker = worker_id, error = %e, "Accept error");
            }
        }
    }

    info!(worker = worker_id, "Worker stopped accepting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;
    use crate::sink::ResponseSink;
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use std::io::{Read, Write};

    struct Hello;

    impl Handler for Hello {
        async fn serve<B: Body, S: ResponseSink>(
            &self,
            _req: Request<B>,
            sink: &mut S,
        ) -> io::Result<()> {
            sink.headers_mut()
                .insert("content-length", http::HeaderValue::from_static("5"));
            sink.write_head(StatusCode::OK).await?;
            sink.write_body(Bytes::from_static(b"hello")).await
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn workers_serve_and_stop() {
        let addr = format!("127.0.0.1:{}", free_port());
        let stop = Arc::new(AtomicBool::new(false));
        let config = WorkerConfig {
            addr: addr.clone(),
            workers: 2,
            limits: ConnLimits::default(),
        };
        let handles = spawn_workers(config, |_| Hello, Arc::clone(&stop)).unwrap();
        assert_eq!(handles.len(), 2);

        let mut client = std::net::TcpStream::connect(&addr).unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nhost: t\r\nconnection: close\r\n\r\n")
            .unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "got {out:?}");
        assert!(out.ends_with("hello"));

        stop.store(true, Ordering::Relaxed);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let config = WorkerConfig {
            addr,
            workers: 1,
            limits: ConnLimits::default(),
        };
        // std listeners do not set SO_REUSEPORT, so the worker cannot share it.
        let result = spawn_workers(config, |_| Hello, Arc::new(AtomicBool::new(false)));
        assert!(result.is_err());
    }
}
