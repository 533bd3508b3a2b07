//! Producing established channel transports for endpoints
//!
//! A connector runs the `Connecting` phase of a channel: TCP connect with the
//! endpoint's socket policy, TLS handshake (resuming when the session cache
//! has something for the endpoint) and the authentication preface.

use crate::config::TcpPolicy;
use crate::crypto::tls::{ClientTlsContext, TlsContextBuilder};
use crate::endpoint::{EndpointDescriptor, IdentityHash};
use crate::error::{Result, TunnelError};
use crate::protocol::Preface;
use async_trait::async_trait;
use rustls::HandshakeKind;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};

/// Transport a channel can run over
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ChannelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIo = Box<dyn ChannelIo>;

/// Opens an authenticated transport to one endpoint
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Connect, handshake and send the preface. `icmp` requests the ICMP
    /// sub-channel from the server.
    async fn connect(&self, endpoint: &EndpointDescriptor, icmp: bool) -> Result<BoxedIo>;
}

/// Handshake counters, split by resumption
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeStats {
    pub full: u64,
    pub resumed: u64,
}

/// Connector over real TCP and TLS
pub struct TlsChannelConnector {
    builder: TlsContextBuilder,
    contexts: Mutex<HashMap<IdentityHash, ClientTlsContext>>,
    full_handshakes: AtomicU64,
    resumed_handshakes: AtomicU64,
}

impl TlsChannelConnector {
    pub fn new(builder: TlsContextBuilder) -> Self {
        Self {
            builder,
            contexts: Mutex::new(HashMap::new()),
            full_handshakes: AtomicU64::new(0),
            resumed_handshakes: AtomicU64::new(0),
        }
    }

    /// Client context for `endpoint`, built on first use
    pub fn context(&self, endpoint: &EndpointDescriptor) -> Result<ClientTlsContext> {
        let mut contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(context) = contexts.get(&endpoint.identity_hash()) {
            return Ok(context.clone());
        }
        let context = self.builder.build_client(endpoint)?;
        contexts.insert(endpoint.identity_hash(), context.clone());
        Ok(context)
    }

    pub fn handshake_stats(&self) -> HandshakeStats {
        HandshakeStats {
            full: self.full_handshakes.load(Ordering::Relaxed),
            resumed: self.resumed_handshakes.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl ChannelConnector for TlsChannelConnector {
    async fn connect(&self, endpoint: &EndpointDescriptor, icmp: bool) -> Result<BoxedIo> {
        let context = self.context(endpoint)?;
        let tcp = connect_tcp(endpoint).await?;

        let mut tls = context
            .connector()
            .connect(context.server_name().clone(), tcp)
            .await
            .map_err(|e| TunnelError::Handshake(format!("{}: {e}", endpoint.label())))?;

        let (_, session) = tls.get_ref();
        let resumed = session.handshake_kind() == Some(HandshakeKind::Resumed);
        if resumed {
            self.resumed_handshakes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.full_handshakes.fetch_add(1, Ordering::Relaxed);
        }
        log::info!(
            "TLS {} handshake with {} ({:?}, ALPN {})",
            if resumed { "resumed" } else { "full" },
            endpoint.label(),
            session.protocol_version(),
            session
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_else(|| "none".to_string())
        );

        Preface::new(endpoint.credential(), icmp)
            .write_to(&mut tls)
            .await?;
        Ok(Box::new(tls))
    }
}

/// Resolve and connect, trying addresses in policy order
pub(crate) async fn connect_tcp(endpoint: &EndpointDescriptor) -> Result<TcpStream> {
    let policy = endpoint.tcp();
    let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host((endpoint.address(), endpoint.port()))
        .await?
        .collect();
    if policy.prefer_ipv4 {
        addrs.sort_by_key(|addr| !addr.is_ipv4());
    }

    let mut last_error = None;
    for addr in addrs {
        match connect_addr(addr, policy).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!("Connect to {addr} failed: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no address", endpoint.address()),
            )
        })
        .into())
}

async fn connect_addr(addr: SocketAddr, policy: &TcpPolicy) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(policy.keep_alive)?;
    #[cfg(unix)]
    if policy.reuse_port {
        socket.set_reuseport(true)?;
    }
    #[cfg(target_os = "linux")]
    if policy.fast_open {
        enable_fast_open_connect(&socket);
    }

    let stream = socket.connect(addr).await?;
    stream.set_nodelay(policy.no_delay)?;
    Ok(stream)
}

#[cfg(target_os = "linux")]
fn enable_fast_open_connect(socket: &TcpSocket) {
    use std::os::fd::AsRawFd;

    let enable: libc::c_int = 1;
    // SAFETY: valid socket fd and a correctly sized option value
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN_CONNECT,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        log::debug!(
            "TCP fast open unavailable: {}",
            io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SslPolicy;
    use crate::crypto::session_cache::SessionCache;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_tcp_applies_policy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let tcp = TcpPolicy {
            no_delay: true,
            prefer_ipv4: true,
            ..TcpPolicy::default()
        };
        let endpoint =
            EndpointDescriptor::new("localhost", port, "pw", SslPolicy::default(), tcp).unwrap();

        let (stream, accepted) = tokio::join!(connect_tcp(&endpoint), listener.accept());
        let stream = stream.unwrap();
        accepted.unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(stream.peer_addr().unwrap().is_ipv4());
    }

    #[tokio::test]
    async fn test_refused_connect_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = EndpointDescriptor::new(
            "127.0.0.1",
            port,
            "pw",
            SslPolicy::default(),
            TcpPolicy::default(),
        )
        .unwrap();
        let connector = TlsChannelConnector::new(TlsContextBuilder::new(Arc::new(SessionCache::new())));
        let result = connector.connect(&endpoint, false).await;
        assert!(matches!(result, Err(TunnelError::Io(_))));
        assert_eq!(connector.handshake_stats(), HandshakeStats::default());
    }

    #[test]
    fn test_context_is_cached_per_identity() {
        let connector = TlsChannelConnector::new(TlsContextBuilder::new(Arc::new(SessionCache::new())));
        let endpoint = EndpointDescriptor::new(
            "example.com",
            443,
            "pw",
            SslPolicy::default(),
            TcpPolicy::default(),
        )
        .unwrap();
        let first = connector.context(&endpoint).unwrap();
        let second = connector.context(&endpoint).unwrap();
        assert!(Arc::ptr_eq(first.config(), second.config()));
    }
}
