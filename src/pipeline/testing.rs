//! In-memory connector for pipeline tests

use super::channel::{ChannelOptions, ChannelRole, PipelineChannel};
use super::connector::{BoxedIo, ChannelConnector};
use super::stream::{StreamEvent, StreamHandle};
use crate::config::{SslPolicy, TcpPolicy};
use crate::endpoint::EndpointDescriptor;
use crate::error::{Result, TunnelError};
use crate::protocol::Frame;
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Endpoint on 127.0.0.1 identified by `port`
pub fn endpoint(port: u16) -> EndpointDescriptor {
    EndpointDescriptor::new("127.0.0.1", port, "pw", SslPolicy::default(), TcpPolicy::default())
        .unwrap()
}

/// Connects to in-process server channels; ports listed as failing refuse
#[derive(Default)]
pub struct MockConnector {
    failing: Mutex<HashSet<u16>>,
    attempts: Mutex<Vec<u16>>,
    servers: Mutex<Vec<(u16, Arc<PipelineChannel>)>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(ports: &[u16]) -> Arc<Self> {
        let connector = Self::default();
        connector.failing.lock().unwrap().extend(ports);
        Arc::new(connector)
    }

    /// Ports in connect order
    pub fn attempts(&self) -> Vec<u16> {
        self.attempts.lock().unwrap().clone()
    }

    /// Abort every server channel behind `port`
    pub fn kill(&self, port: u16) {
        for (server_port, channel) in self.servers.lock().unwrap().iter() {
            if *server_port == port {
                channel.abort();
            }
        }
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(&self, endpoint: &EndpointDescriptor, _icmp: bool) -> Result<BoxedIo> {
        let port = endpoint.port();
        self.attempts.lock().unwrap().push(port);
        if self.failing.lock().unwrap().contains(&port) {
            return Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            )));
        }

        let (client, server) = tokio::io::duplex(1 << 16);
        let (icmp_tx, mut icmp_rx) = mpsc::channel::<Frame>(16);
        let channel = Arc::new(PipelineChannel::spawn(
            server,
            ChannelOptions::new(ChannelRole::Server, 4)
                .with_peer(format!("client-{port}"))
                .with_shutdown_wait(Duration::from_millis(100))
                .with_icmp_sink(icmp_tx),
        ));
        let mut incoming = channel.take_incoming().unwrap();
        tokio::spawn(async move {
            while let Some(handle) = incoming.recv().await {
                tokio::spawn(echo_on_close(handle));
            }
        });
        // ICMP packets are reflected as they are
        let reflector = Arc::downgrade(&channel);
        tokio::spawn(async move {
            while let Some(frame) = icmp_rx.recv().await {
                let Some(channel) = reflector.upgrade() else { return };
                let _ = channel.send_icmp(frame.payload).await;
            }
        });
        self.servers.lock().unwrap().push((port, channel));
        Ok(Box::new(client))
    }
}

/// Collect everything, send it back once the client half-closes
async fn echo_on_close(mut handle: StreamHandle) {
    let mut collected = BytesMut::new();
    while let Some(event) = handle.recv().await {
        match event {
            StreamEvent::Data(bytes) => collected.extend_from_slice(&bytes),
            StreamEvent::Close => {
                if !collected.is_empty() {
                    let _ = handle.send(collected.split().freeze()).await;
                }
                handle.close_write();
            }
            StreamEvent::Failed(_) => return,
        }
    }
}

/// Poll `condition` every few milliseconds for up to two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
