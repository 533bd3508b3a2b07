//! The host's own ICMP socket as a packet device
//!
//! Used on the server, which has no TUN interface: a written packet has its
//! ICMP part sent to the packet's destination, and reads return whole IPv4
//! packets as the kernel hands them to a raw socket. Needs `CAP_NET_RAW`.

use super::PacketDevice;
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::io::unix::AsyncFd;

const MAX_PACKET_SIZE: usize = 65535;

/// Raw IPv4 ICMP socket
pub struct RawIcmpDevice {
    socket: AsyncFd<Socket>,
}

impl RawIcmpDevice {
    pub fn open() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(|e| TunnelError::Capability(format!("raw ICMP socket: {e}")))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: AsyncFd::new(socket)?,
        })
    }
}

#[async_trait]
impl PacketDevice for RawIcmpDevice {
    async fn read_packet(&self) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let mut guard = self.socket.readable().await?;
            let read = guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(&mut buf)
            });
            match read {
                Ok(Ok(len)) => {
                    buf.truncate(len);
                    return Ok(Some(Bytes::from(buf)));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&self, packet: Bytes) -> Result<()> {
        let header_len = packet
            .first()
            .filter(|first| *first >> 4 == 4)
            .map(|first| usize::from(first & 0x0f) * 4)
            .filter(|len| *len >= 20 && *len < packet.len())
            .ok_or_else(|| TunnelError::InvalidState("not an IPv4 packet".to_string()))?;
        let destination = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
        let target = SockAddr::from(SocketAddrV4::new(destination, 0));
        let message = &packet[header_len..];

        loop {
            let mut guard = self.socket.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(message, &target)) {
                Ok(sent) => {
                    sent?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}
