//! Server side: accepting channels
//!
//! Every accepted connection goes through TLS accept, ALPN routing and the
//! authentication preface before it becomes a server-role channel. Peers
//! that fail TLS or authentication get the camouflage response and nothing
//! else.

use super::channel::{ChannelOptions, ChannelRole, PipelineChannel};
use super::stream::StreamHandle;
use crate::accounting::{AccountingSink, LogAccounting};
use crate::config::TcpPolicy;
use crate::crypto::tls::{AlpnRoute, ServerTlsContext};
use crate::error::{Result, TunnelError};
use crate::protocol::{Authenticator, Frame, Preface};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;

/// First byte of a TLS handshake record
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

const LISTEN_BACKLOG: u32 = 1024;

/// Inbound ICMP packets buffered per channel before they are dropped
const ICMP_QUEUE_DEPTH: usize = 256;

/// Channel settings applied to every accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub ack_window_size: u32,
    pub icmp_proxy_enabled: bool,
    /// Bound for the TLS handshake and, separately, for reading the preface
    pub handshake_timeout: Duration,
    pub shutdown_wait: Duration,
    /// Socket tuning for the listener and every accepted connection
    pub tcp: TcpPolicy,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ack_window_size: 64,
            icmp_proxy_enabled: false,
            handshake_timeout: Duration::from_secs(10),
            shutdown_wait: Duration::from_secs(3),
            tcp: TcpPolicy::default(),
        }
    }
}

/// Way back to the channel an ICMP packet arrived on
#[derive(Debug, Clone)]
pub struct IcmpReply {
    channel_id: u64,
    channel: Weak<PipelineChannel>,
}

impl IcmpReply {
    pub fn new(channel: &Arc<PipelineChannel>) -> Self {
        Self {
            channel_id: channel.id(),
            channel: Arc::downgrade(channel),
        }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Send `packet` on the originating channel's ICMP sub-channel
    pub async fn send(&self, packet: Bytes) -> Result<()> {
        let channel = self.channel.upgrade().ok_or_else(|| {
            TunnelError::ChannelUnavailable(format!("channel {} is gone", self.channel_id))
        })?;
        channel.send_icmp(packet).await
    }
}

/// An ICMP frame from a client channel, with its reply path
#[derive(Debug)]
pub struct InboundIcmp {
    pub frame: Frame,
    pub reply: IcmpReply,
}

/// What became of one accepted connection
#[derive(Debug)]
pub enum Accepted {
    Channel(Arc<PipelineChannel>),
    /// Handed to a local port by ALPN
    Redirected(u16),
    /// Served the camouflage response
    Rejected,
}

/// Turns accepted TCP connections into authenticated channels
pub struct PipelineAcceptor {
    context: ServerTlsContext,
    settings: ServerSettings,
    authenticator: Arc<dyn Authenticator>,
    accounting: Arc<dyn AccountingSink>,
    icmp_sink: Option<mpsc::Sender<InboundIcmp>>,
}

impl PipelineAcceptor {
    pub fn new(
        context: ServerTlsContext,
        settings: ServerSettings,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            context,
            settings,
            authenticator,
            accounting: Arc::new(LogAccounting),
            icmp_sink: None,
        }
    }

    pub fn with_accounting(mut self, accounting: Arc<dyn AccountingSink>) -> Self {
        self.accounting = accounting;
        self
    }

    /// Where ICMP packets from clients that asked for the sub-channel go
    pub fn with_icmp_sink(mut self, sink: mpsc::Sender<InboundIcmp>) -> Self {
        self.icmp_sink = Some(sink);
        self
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Run one connection up to the point where it carries frames
    pub async fn accept(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<Accepted> {
        let timeout = self.settings.handshake_timeout;
        tune_accepted(&stream, &self.settings.tcp);

        let mut first = [0u8; 1];
        let peeked = tokio::time::timeout(timeout, stream.peek(&mut first))
            .await
            .map_err(|_| TunnelError::Timeout(format!("no data from {peer}")))??;
        if peeked == 0 {
            return Ok(Accepted::Rejected);
        }
        if first[0] != TLS_HANDSHAKE_RECORD {
            log::info!("Plain connection from {peer}, serving camouflage");
            self.camouflage(&mut stream).await;
            return Ok(Accepted::Rejected);
        }

        let handshake = self.context.acceptor().accept(stream).into_fallible();
        let mut tls = match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(tls)) => tls,
            Ok(Err((e, mut raw))) => {
                log::info!("TLS handshake from {peer} failed: {e}");
                self.camouflage(&mut raw).await;
                return Ok(Accepted::Rejected);
            }
            Err(_) => {
                return Err(TunnelError::Timeout(format!("TLS handshake from {peer}")));
            }
        };

        let alpn = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
        if let AlpnRoute::Redirect(port) = self.context.router().route(alpn.as_deref()) {
            log::info!(
                "Redirecting {peer} (ALPN {}) to local port {port}",
                String::from_utf8_lossy(alpn.as_deref().unwrap_or_default())
            );
            let mut local = tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port)))
                .await
                .map_err(|_| TunnelError::Timeout(format!("connecting to local port {port}")))??;
            let (up, down) = tokio::io::copy_bidirectional(&mut tls, &mut local).await?;
            log::debug!("Redirect for {peer} done, {up} bytes up, {down} bytes down");
            return Ok(Accepted::Redirected(port));
        }

        let preface = match tokio::time::timeout(timeout, Preface::read_from(&mut tls)).await {
            Ok(Ok(preface)) if self.authenticator.authenticate(&preface.credential) => preface,
            Ok(Ok(_)) => {
                log::warn!("Authentication from {peer} failed");
                self.camouflage(&mut tls).await;
                return Ok(Accepted::Rejected);
            }
            Ok(Err(e)) => {
                log::info!("Bad preface from {peer}: {e}");
                self.camouflage(&mut tls).await;
                return Ok(Accepted::Rejected);
            }
            Err(_) => {
                log::info!("No preface from {peer} within {timeout:?}");
                self.camouflage(&mut tls).await;
                return Ok(Accepted::Rejected);
            }
        };

        let mut options = ChannelOptions::new(ChannelRole::Server, self.settings.ack_window_size)
            .with_peer(peer.to_string())
            .with_shutdown_wait(self.settings.shutdown_wait)
            .with_accounting(self.accounting.clone());
        let icmp = match (preface.icmp, &self.icmp_sink, self.settings.icmp_proxy_enabled) {
            (true, Some(sink), true) => {
                let (frames_tx, frames_rx) = mpsc::channel(ICMP_QUEUE_DEPTH);
                options = options.with_icmp_sink(frames_tx);
                Some((sink.clone(), frames_rx))
            }
            (true, _, _) => {
                log::debug!("{peer} asked for ICMP, which is disabled");
                None
            }
            _ => None,
        };

        let channel = Arc::new(PipelineChannel::spawn(tls, options));
        if let Some((sink, frames)) = icmp {
            tokio::spawn(tag_icmp(IcmpReply::new(&channel), frames, sink));
        }
        Ok(Accepted::Channel(channel))
    }

    /// Accept loop; inbound streams of every channel go to `incoming`
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        incoming: mpsc::Sender<StreamHandle>,
    ) -> Result<()> {
        log::info!("Accepting channels on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            let acceptor = self.clone();
            let incoming = incoming.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream, peer).await {
                    Ok(Accepted::Channel(channel)) => forward_streams(channel, incoming).await,
                    Ok(_) => {}
                    Err(e) => log::debug!("Connection from {peer} dropped: {e}"),
                }
            });
        }
    }

    async fn camouflage<W: AsyncWrite + Unpin>(&self, writer: &mut W) {
        let response = self.context.camouflage_response();
        if !response.is_empty() {
            if let Err(e) = writer.write_all(response).await {
                log::debug!("Camouflage write failed: {e}");
                return;
            }
        }
        let _ = writer.shutdown().await;
    }
}

/// Pair each ICMP frame of one channel with the way back to it
async fn tag_icmp(
    reply: IcmpReply,
    mut frames: mpsc::Receiver<Frame>,
    sink: mpsc::Sender<InboundIcmp>,
) {
    while let Some(frame) = frames.recv().await {
        let inbound = InboundIcmp {
            frame,
            reply: reply.clone(),
        };
        if sink.try_send(inbound).is_err() {
            log::debug!("ICMP queue full, packet from channel {} dropped", reply.channel_id());
        }
    }
}

/// Bind a listener for `host:port` with the socket policy applied
pub async fn bind_listener(host: &str, port: u16, policy: &TcpPolicy) -> Result<TcpListener> {
    let mut last_error = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        match listen_on(addr, policy) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                log::debug!("Listen on {addr} failed: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{host} resolved to no address"))
        })
        .into())
}

fn listen_on(addr: SocketAddr, policy: &TcpPolicy) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    if policy.reuse_port {
        socket.set_reuseport(true)?;
    }
    socket.bind(addr)?;
    #[cfg(target_os = "linux")]
    if policy.fast_open {
        enable_fast_open_listen(&socket, policy.fast_open_queue_length);
    }
    socket.listen(LISTEN_BACKLOG)
}

#[cfg(target_os = "linux")]
fn enable_fast_open_listen(socket: &TcpSocket, queue_length: u32) {
    use std::os::fd::AsRawFd;

    let qlen = libc::c_int::try_from(queue_length).unwrap_or(libc::c_int::MAX);
    // SAFETY: valid socket fd and a correctly sized option value
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &qlen as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        log::debug!(
            "TCP fast open listen queue unavailable: {}",
            io::Error::last_os_error()
        );
    }
}

/// Apply the per-connection part of the policy to an accepted socket
pub fn tune_accepted(stream: &TcpStream, policy: &TcpPolicy) {
    if let Err(e) = stream.set_nodelay(policy.no_delay) {
        log::debug!("TCP_NODELAY not applied: {e}");
    }
    if let Err(e) = socket2::SockRef::from(stream).set_keepalive(policy.keep_alive) {
        log::debug!("SO_KEEPALIVE not applied: {e}");
    }
}

/// Hand the channel's inbound streams to the application until it ends
async fn forward_streams(channel: Arc<PipelineChannel>, incoming: mpsc::Sender<StreamHandle>) {
    let Some(mut streams) = channel.take_incoming() else {
        return;
    };
    while let Some(handle) = streams.recv().await {
        if incoming.send(handle).await.is_err() {
            log::debug!("Stream consumer gone, closing channel {}", channel.id());
            return;
        }
    }
    let state = channel.closed().await;
    log::debug!("Channel {} from {} ended ({state:?})", channel.id(), channel.peer());
}
