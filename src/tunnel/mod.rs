//! Virtual network device side of the tunnel
//!
//! Device creation and teardown belong to the host application. The tunnel
//! only needs whole IP packets in and out, through [`PacketDevice`]. The
//! server side, which has no interface, uses the host's raw ICMP socket.

pub mod icmp;
#[cfg(unix)]
mod raw;

pub use icmp::IcmpRelay;
#[cfg(unix)]
pub use raw::RawIcmpDevice;

use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

/// A TUN-like device exchanging whole IP packets
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Next packet from the device; `None` once it is gone
    async fn read_packet(&self) -> Result<Option<Bytes>>;

    /// Deliver a packet to the device
    async fn write_packet(&self, packet: Bytes) -> Result<()>;
}

/// Device backed by two queues, for hosts that own the real interface
pub struct QueueDevice {
    from_host: Mutex<mpsc::Receiver<Bytes>>,
    to_host: mpsc::Sender<Bytes>,
}

impl QueueDevice {
    /// The device plus the host's ends: a sender for packets read from the
    /// interface and a receiver for packets to write to it
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        let (host_tx, from_host) = mpsc::channel(capacity);
        let (to_host, host_rx) = mpsc::channel(capacity);
        (
            Self {
                from_host: Mutex::new(from_host),
                to_host,
            },
            host_tx,
            host_rx,
        )
    }
}

#[async_trait]
impl PacketDevice for QueueDevice {
    async fn read_packet(&self) -> Result<Option<Bytes>> {
        Ok(self.from_host.lock().await.recv().await)
    }

    async fn write_packet(&self, packet: Bytes) -> Result<()> {
        self.to_host
            .send(packet)
            .await
            .map_err(|_| TunnelError::InvalidState("device closed".to_string()))
    }
}
