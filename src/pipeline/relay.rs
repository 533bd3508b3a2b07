//! Pumping bytes between sockets and streams
//!
//! Both directions run concurrently and each side is half-closed on its own,
//! so a peer that shuts down writing still receives the rest of the reply.

use super::group::GroupStream;
use super::stream::{StreamEvent, StreamHandle};
use crate::error::{Result, TunnelError};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Socket to stream
    pub sent: u64,
    /// Stream to socket
    pub received: u64,
}

/// Client side: a local connection against a group stream
pub async fn relay_client<S>(socket: S, mut stream: GroupStream) -> Result<RelayStats>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(socket);
    let upstream = stream.writer();

    let to_stream = async move {
        let mut buf = BytesMut::with_capacity(RELAY_BUFFER_SIZE);
        let mut sent = 0u64;
        loop {
            buf.reserve(RELAY_BUFFER_SIZE);
            if reader.read_buf(&mut buf).await? == 0 {
                upstream.close_write().await;
                return Ok::<_, TunnelError>(sent);
            }
            sent += buf.len() as u64;
            upstream.send(buf.split().freeze()).await?;
        }
    };

    let to_socket = async {
        let mut received = 0u64;
        while let Some(chunk) = stream.recv().await? {
            received += chunk.len() as u64;
            writer.write_all(&chunk).await?;
        }
        writer.shutdown().await?;
        Ok::<_, TunnelError>(received)
    };

    let (sent, received) = tokio::try_join!(to_stream, to_socket)?;
    Ok(RelayStats { sent, received })
}

/// Server side: connect to the stream's target and relay
pub async fn relay_to_target(handle: StreamHandle, connect_timeout: Duration) -> Result<RelayStats> {
    let target = handle.target().to_string();
    let socket = tokio::time::timeout(connect_timeout, TcpStream::connect(target.as_str()))
        .await
        .map_err(|_| TunnelError::Timeout(format!("connecting to {target}")))??;
    socket.set_nodelay(true)?;
    log::debug!("Stream {} connected to {target}", handle.id());
    relay_stream(handle, socket).await
}

/// Relay a plain stream handle against any socket
pub async fn relay_stream<S>(mut handle: StreamHandle, socket: S) -> Result<RelayStats>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(socket);
    let sender = handle.sender();

    let to_stream = async move {
        let mut buf = BytesMut::with_capacity(RELAY_BUFFER_SIZE);
        let mut sent = 0u64;
        loop {
            buf.reserve(RELAY_BUFFER_SIZE);
            if reader.read_buf(&mut buf).await? == 0 {
                sender.close_write();
                return Ok::<_, TunnelError>(sent);
            }
            sent += buf.len() as u64;
            sender.send(buf.split().freeze()).await?;
        }
    };

    let to_socket = async {
        let mut received = 0u64;
        while let Some(event) = handle.recv().await {
            match event {
                StreamEvent::Data(chunk) => {
                    received += chunk.len() as u64;
                    writer.write_all(&chunk).await?;
                }
                StreamEvent::Close => break,
                StreamEvent::Failed(reason) => return Err(TunnelError::ChannelFailed(reason)),
            }
        }
        writer.shutdown().await?;
        Ok::<_, TunnelError>(received)
    };

    let (sent, received) = tokio::try_join!(to_stream, to_socket)?;
    Ok(RelayStats { sent, received })
}
