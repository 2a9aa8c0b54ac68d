use monoio::io::{AsyncReadRent, AsyncWriteRent};
use monoio::net::TcpStream;
use monoio_rustls::{ClientTlsStream, TlsConnector};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Opens connections to the upstream host.
#[allow(async_fn_in_trait)]
pub trait Transport {
    type Conn: AsyncReadRent + AsyncWriteRent;

    async fn connect(&self) -> io::Result<Self::Conn>;

    /// `host:port` of the upstream, used when a request carries no `Host`.
    fn authority(&self) -> &str;
}

/// Resolve `addr` (e.g. `"backend:8080"`), IPv4 addresses first.
///
/// Resolution is a blocking std lookup. It only runs when the pool has no
/// idle connection, never on the pooled fast path.
fn resolve_addrs(addr: &str) -> Vec<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return vec![sa];
    }
    use std::net::ToSocketAddrs;
    let all: Vec<SocketAddr> = match addr.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return vec![],
    };
    let mut v4: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv4()).collect();
    v4.extend(all.iter().copied().filter(|a| a.is_ipv6()));
    v4
}

/// Plain TCP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    authority: String,
    connect_timeout: Duration,
}

impl HttpTransport {
    pub fn new(authority: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            authority: authority.into(),
            connect_timeout,
        }
    }
}

impl Transport for HttpTransport {
    type Conn = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let candidates = resolve_addrs(&self.authority);
        if candidates.is_empty() {
            warn!(addr = %self.authority, "Upstream address resolve failed");
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("cannot resolve {}", self.authority),
            ));
        }

        let mut last_err = None;
        for sa in &candidates {
            match monoio::time::timeout(self.connect_timeout, TcpStream::connect(*sa)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(addr = %self.authority, resolved = %sa, "Upstream connected");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(addr = %self.authority, resolved = %sa, error = %e, "Upstream candidate failed, trying next");
                    last_err = Some(e);
                }
                Err(_) => {
                    debug!(addr = %self.authority, resolved = %sa, "Upstream connect timed out, trying next");
                    last_err = Some(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
                }
            }
        }
        warn!(addr = %self.authority, tried = candidates.len(), "Upstream connect failed on all candidates");
        Err(last_err.unwrap_or_else(|| io::Error::other("upstream connect failed")))
    }

    fn authority(&self) -> &str {
        &self.authority
    }
}

/// TLS over TCP, verified against the webpki root set.
#[derive(Clone)]
pub struct HttpsTransport {
    tcp: HttpTransport,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl HttpsTransport {
    /// `host` is the upstream host name (used for SNI and verification);
    /// `authority` is what to dial.
    pub fn new(host: &str, authority: impl Into<String>, connect_timeout: Duration) -> io::Result<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Self {
            tcp: HttpTransport::new(authority, connect_timeout),
            connector: TlsConnector::from(client_config()?),
            server_name,
        })
    }
}

fn client_config() -> io::Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(io::Error::other)?
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

impl Transport for HttpsTransport {
    type Conn = ClientTlsStream<TcpStream>;

    async fn connect(&self) -> io::Result<Self::Conn> {
        let tcp = self.tcp.connect().await?;
        self.connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn authority(&self) -> &str {
        self.tcp.authority()
    }
}
