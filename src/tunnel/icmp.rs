//! ICMP over the pipeline
//!
//! Setup has two phases: [`IcmpRelay::prepare`] probes once per address
//! family whether the host can open an ICMP socket at all, then
//! [`IcmpRelay::try_enable`] is asked per family. A family that fails the
//! probe is disabled instead of failing the tunnel. Packets travel as opaque
//! payloads on the reserved stream; only IP addresses are ever looked at.

use super::PacketDevice;
use crate::error::{Result, TunnelError};
use crate::pipeline::{IcmpReply, InboundIcmp, PipelineGroup};
use crate::protocol::{Frame, FrameType, ICMP_STREAM_ID};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;

/// How long a reply route outlives the last request through it
const ROUTE_TTL: Duration = Duration::from_secs(60);
/// Table size at which expired routes are swept
const ROUTE_SWEEP_AT: usize = 1024;

/// Capability-gated ICMP adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpRelay {
    ipv4: bool,
    ipv6: bool,
}

impl IcmpRelay {
    /// Probe the host once per family; `enabled = false` skips probing
    pub fn prepare(enabled: bool) -> Self {
        if !enabled {
            return Self::disabled();
        }
        let relay = Self {
            ipv4: probe(true),
            ipv6: probe(false),
        };
        log::info!(
            "ICMP relay: IPv4 {}, IPv6 {}",
            if relay.ipv4 { "available" } else { "unavailable" },
            if relay.ipv6 { "available" } else { "unavailable" }
        );
        relay
    }

    pub fn disabled() -> Self {
        Self {
            ipv4: false,
            ipv6: false,
        }
    }

    /// Skip probing when the host already knows its capabilities
    pub fn with_capabilities(ipv4: bool, ipv6: bool) -> Self {
        Self { ipv4, ipv6 }
    }

    pub fn is_enabled(&self) -> bool {
        self.ipv4 || self.ipv6
    }

    pub fn supports(&self, is_ipv4: bool) -> bool {
        if is_ipv4 {
            self.ipv4
        } else {
            self.ipv6
        }
    }

    pub fn try_enable(&self, is_ipv4: bool) -> Result<()> {
        if self.supports(is_ipv4) {
            Ok(())
        } else {
            Err(TunnelError::Capability(format!(
                "no ICMP socket for {}",
                if is_ipv4 { "IPv4" } else { "IPv6" }
            )))
        }
    }

    /// Wrap a raw packet; the channel assigns the sequence number on send
    pub fn encode(raw: Bytes) -> Frame {
        Frame::icmp(0, raw)
    }

    pub fn decode(frame: &Frame) -> Result<Bytes> {
        if frame.frame_type != FrameType::Icmp || frame.stream_id != ICMP_STREAM_ID {
            return Err(TunnelError::FrameProtocol(format!(
                "{:?} frame on stream {} is not ICMP",
                frame.frame_type, frame.stream_id
            )));
        }
        Ok(frame.payload.clone())
    }

    /// Pump ICMP packets between `device` and `group` until the device closes
    ///
    /// Packets of other protocols, or of a family without capability, are
    /// skipped in both directions.
    pub async fn run<D>(&self, device: &D, group: &PipelineGroup) -> Result<()>
    where
        D: PacketDevice + ?Sized,
    {
        if !self.is_enabled() {
            return Err(TunnelError::Capability("ICMP relay is not enabled".to_string()));
        }
        let mut inbound = group.take_icmp_receiver().ok_or_else(|| {
            TunnelError::InvalidState("ICMP receiver already taken".to_string())
        })?;

        let to_group = async {
            while let Some(packet) = device.read_packet().await? {
                if !self.accepts(&packet) {
                    log::trace!("Skipping {} byte device packet", packet.len());
                    continue;
                }
                if let Err(e) = group.send_icmp(Self::encode(packet)).await {
                    log::debug!("ICMP packet dropped: {e}");
                }
            }
            Ok::<_, TunnelError>(())
        };

        let to_device = async {
            while let Some(frame) = inbound.recv().await {
                match Self::decode(&frame) {
                    Ok(packet) if self.accepts(&packet) => device.write_packet(packet).await?,
                    Ok(packet) => log::trace!("Skipping {} byte ICMP payload", packet.len()),
                    Err(e) => log::debug!("{e}"),
                }
            }
            Ok::<_, TunnelError>(())
        };

        tokio::select! {
            result = to_group => result,
            result = to_device => result,
        }
    }

    /// Server half: hand client packets to `device` and send each device
    /// packet back on the channel it answers, until either side closes
    ///
    /// Replies are matched by address: a packet from host B goes to the
    /// channel that last sent something to B, readdressed to that packet's
    /// source.
    pub async fn serve<D>(&self, device: &D, mut inbound: mpsc::Receiver<InboundIcmp>) -> Result<()>
    where
        D: PacketDevice + ?Sized,
    {
        if !self.is_enabled() {
            return Err(TunnelError::Capability("ICMP relay is not enabled".to_string()));
        }
        let routes = Mutex::new(RouteTable::default());

        let to_device = async {
            while let Some(InboundIcmp { frame, reply }) = inbound.recv().await {
                let packet = match Self::decode(&frame) {
                    Ok(packet) if self.accepts(&packet) => packet,
                    Ok(packet) => {
                        log::trace!("Skipping {} byte ICMP payload", packet.len());
                        continue;
                    }
                    Err(e) => {
                        log::debug!("{e}");
                        continue;
                    }
                };
                let Some((source, destination)) = addresses(&packet) else {
                    continue;
                };
                routes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(destination, source, reply);
                device.write_packet(packet).await?;
            }
            Ok::<_, TunnelError>(())
        };

        let from_device = async {
            while let Some(packet) = device.read_packet().await? {
                if !self.accepts(&packet) {
                    continue;
                }
                let Some((source, _)) = addresses(&packet) else {
                    continue;
                };
                let route = routes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&source);
                let Some((client, reply)) = route else {
                    log::trace!("No route for ICMP from {source}");
                    continue;
                };
                if let Err(e) = reply.send(readdress(&packet, client)).await {
                    log::debug!("ICMP reply from {source} dropped: {e}");
                }
            }
            Ok::<_, TunnelError>(())
        };

        tokio::select! {
            result = to_device => result,
            result = from_device => result,
        }
    }

    fn accepts(&self, packet: &[u8]) -> bool {
        icmp_family(packet).is_some_and(|is_ipv4| self.supports(is_ipv4))
    }
}

struct Route {
    client: IpAddr,
    reply: IcmpReply,
    last_used: Instant,
}

/// Remote host -> the client address and channel that last talked to it
#[derive(Default)]
struct RouteTable {
    routes: HashMap<IpAddr, Route>,
}

impl RouteTable {
    fn insert(&mut self, remote: IpAddr, client: IpAddr, reply: IcmpReply) {
        if self.routes.len() >= ROUTE_SWEEP_AT {
            self.routes.retain(|_, route| route.last_used.elapsed() < ROUTE_TTL);
        }
        self.routes.insert(
            remote,
            Route {
                client,
                reply,
                last_used: Instant::now(),
            },
        );
    }

    fn get(&self, remote: &IpAddr) -> Option<(IpAddr, IcmpReply)> {
        self.routes
            .get(remote)
            .filter(|route| route.last_used.elapsed() < ROUTE_TTL)
            .map(|route| (route.client, route.reply.clone()))
    }
}

/// Source and destination of an ICMP or ICMPv6 packet
fn addresses(packet: &[u8]) -> Option<(IpAddr, IpAddr)> {
    match icmp_family(packet)? {
        true => {
            let source: [u8; 4] = packet[12..16].try_into().ok()?;
            let destination: [u8; 4] = packet[16..20].try_into().ok()?;
            Some((Ipv4Addr::from(source).into(), Ipv4Addr::from(destination).into()))
        }
        false => {
            let source: [u8; 16] = packet[8..24].try_into().ok()?;
            let destination: [u8; 16] = packet[24..40].try_into().ok()?;
            Some((Ipv6Addr::from(source).into(), Ipv6Addr::from(destination).into()))
        }
    }
}

/// Copy of `packet` sent to `destination`, checksums patched
///
/// IPv4 patches the header checksum; ICMPv6 covers the destination through
/// its pseudo-header, so its checksum is patched instead. A family mismatch
/// leaves the packet as it is.
fn readdress(packet: &[u8], destination: IpAddr) -> Bytes {
    let mut out = BytesMut::from(packet);
    match destination {
        IpAddr::V4(addr) if icmp_family(packet) == Some(true) => {
            let new = addr.octets();
            let checksum = u16::from_be_bytes([out[10], out[11]]);
            let patched = patch_checksum(checksum, &out[16..20], &new);
            out[16..20].copy_from_slice(&new);
            out[10..12].copy_from_slice(&patched.to_be_bytes());
        }
        IpAddr::V6(addr) if icmp_family(packet) == Some(false) && packet.len() >= 44 => {
            let new = addr.octets();
            let checksum = u16::from_be_bytes([out[42], out[43]]);
            let patched = patch_checksum(checksum, &out[24..40], &new);
            out[24..40].copy_from_slice(&new);
            out[42..44].copy_from_slice(&patched.to_be_bytes());
        }
        _ => {}
    }
    out.freeze()
}

/// Incremental internet checksum update for a changed field (RFC 1624)
fn patch_checksum(checksum: u16, old: &[u8], new: &[u8]) -> u16 {
    let mut sum = u32::from(!checksum);
    for (old, new) in old.chunks_exact(2).zip(new.chunks_exact(2)) {
        sum += u32::from(!u16::from_be_bytes([old[0], old[1]]));
        sum += u32::from(u16::from_be_bytes([new[0], new[1]]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// `Some(is_ipv4)` for ICMP and ICMPv6 packets, `None` for anything else
fn icmp_family(packet: &[u8]) -> Option<bool> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 && packet[9] == IPPROTO_ICMP => Some(true),
        6 if packet.len() >= 40 && packet[6] == IPPROTO_ICMPV6 => Some(false),
        _ => None,
    }
}

#[cfg(unix)]
fn probe(ipv4: bool) -> bool {
    let (domain, protocol) = if ipv4 {
        (libc::AF_INET, libc::IPPROTO_ICMP)
    } else {
        (libc::AF_INET6, libc::IPPROTO_ICMPV6)
    };
    for kind in [libc::SOCK_RAW, libc::SOCK_DGRAM] {
        // SAFETY: plain socket(2); the descriptor is closed immediately
        let fd = unsafe { libc::socket(domain, kind, protocol) };
        if fd >= 0 {
            unsafe { libc::close(fd) };
            return true;
        }
    }
    log::debug!(
        "ICMP socket probe for {} failed: {}",
        if ipv4 { "IPv4" } else { "IPv6" },
        std::io::Error::last_os_error()
    );
    false
}

#[cfg(not(unix))]
fn probe(_ipv4: bool) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{endpoint, MockConnector};
    use crate::pipeline::{ChannelOptions, ChannelRole, PipelineChannel, PipelineGroupConfig};
    use crate::tunnel::QueueDevice;
    use std::sync::Arc;

    /// Ones' complement sum of the IPv4 header; `0xffff` when the checksum holds
    fn header_sum(packet: &[u8]) -> u16 {
        let mut sum: u32 = packet[..20]
            .chunks_exact(2)
            .map(|word| u32::from(u16::from_be_bytes([word[0], word[1]])))
            .sum();
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    fn ipv4_echo(source: [u8; 4], destination: [u8; 4]) -> Bytes {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[3] = 28;
        packet[8] = 64;
        packet[9] = IPPROTO_ICMP;
        packet[12..16].copy_from_slice(&source);
        packet[16..20].copy_from_slice(&destination);
        packet[20] = 8;
        let checksum = !header_sum(&packet);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());
        Bytes::from(packet)
    }

    fn ipv4_packet(protocol: u8) -> Bytes {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[9] = protocol;
        packet[20] = 8;
        Bytes::from(packet)
    }

    fn ipv6_packet(next_header: u8) -> Bytes {
        let mut packet = vec![0u8; 48];
        packet[0] = 0x60;
        packet[6] = next_header;
        Bytes::from(packet)
    }

    #[test]
    fn test_family_detection() {
        assert_eq!(icmp_family(&ipv4_packet(IPPROTO_ICMP)), Some(true));
        assert_eq!(icmp_family(&ipv4_packet(6)), None);
        assert_eq!(icmp_family(&ipv6_packet(IPPROTO_ICMPV6)), Some(false));
        assert_eq!(icmp_family(&ipv6_packet(17)), None);
        assert_eq!(icmp_family(&[0x45, 0, 0]), None);
        assert_eq!(icmp_family(&[]), None);
    }

    #[test]
    fn test_disabled_relay() {
        let relay = IcmpRelay::prepare(false);
        assert!(!relay.is_enabled());
        assert!(!relay.supports(true));
        assert!(matches!(relay.try_enable(false), Err(TunnelError::Capability(_))));
    }

    #[test]
    fn test_per_family_capability() {
        let relay = IcmpRelay::with_capabilities(true, false);
        assert!(relay.try_enable(true).is_ok());
        assert!(relay.try_enable(false).is_err());
        assert!(relay.accepts(&ipv4_packet(IPPROTO_ICMP)));
        assert!(!relay.accepts(&ipv6_packet(IPPROTO_ICMPV6)));
    }

    #[test]
    fn test_encode_decode() {
        let packet = ipv4_packet(IPPROTO_ICMP);
        let frame = IcmpRelay::encode(packet.clone());
        assert_eq!(frame.frame_type, FrameType::Icmp);
        assert_eq!(frame.stream_id, ICMP_STREAM_ID);
        assert_eq!(IcmpRelay::decode(&frame).unwrap(), packet);

        let data = Frame::data(1, 1, packet);
        assert!(matches!(IcmpRelay::decode(&data), Err(TunnelError::FrameProtocol(_))));
    }

    #[test]
    fn test_readdress_keeps_checksums_valid() {
        let packet = ipv4_echo([192, 0, 2, 9], [203, 0, 113, 5]);
        assert_eq!(header_sum(&packet), 0xffff);

        let client = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let readdressed = readdress(&packet, client);
        assert_eq!(&readdressed[16..20], &[10, 0, 0, 2]);
        assert_eq!(&readdressed[12..16], &[192, 0, 2, 9]);
        assert_eq!(header_sum(&readdressed), 0xffff);
        assert_eq!(readdressed[20..], packet[20..]);

        // Wrong family: untouched
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(readdress(&packet, v6), packet);
    }

    #[test]
    fn test_addresses() {
        let packet = ipv4_echo([10, 0, 0, 2], [192, 0, 2, 9]);
        assert_eq!(
            addresses(&packet),
            Some((
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9))
            ))
        );
        assert_eq!(addresses(&ipv4_packet(6)), None);
    }

    #[tokio::test]
    async fn test_serve_routes_replies_to_requesting_channel() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (client_tx, mut client_rx) = mpsc::channel(8);
        let _client = PipelineChannel::spawn(
            a,
            ChannelOptions::new(ChannelRole::Client, 8).with_icmp_sink(client_tx),
        );
        let server = Arc::new(PipelineChannel::spawn(
            b,
            ChannelOptions::new(ChannelRole::Server, 8),
        ));

        let (device, host_tx, mut host_rx) = QueueDevice::new(8);
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let relay = IcmpRelay::with_capabilities(true, false);
        let runner = tokio::spawn(async move { relay.serve(&device, inbound_rx).await });

        let request = ipv4_echo([10, 0, 0, 2], [192, 0, 2, 9]);
        inbound_tx
            .send(InboundIcmp {
                frame: IcmpRelay::encode(request.clone()),
                reply: IcmpReply::new(&server),
            })
            .await
            .unwrap();
        assert_eq!(host_rx.recv().await.unwrap(), request);

        // Nobody asked this host anything
        host_tx.send(ipv4_echo([198, 51, 100, 1], [203, 0, 113, 5])).await.unwrap();
        host_tx.send(ipv4_echo([192, 0, 2, 9], [203, 0, 113, 5])).await.unwrap();

        let reply = client_rx.recv().await.unwrap();
        assert_eq!(&reply.payload[12..16], &[192, 0, 2, 9]);
        assert_eq!(&reply.payload[16..20], &[10, 0, 0, 2]);
        assert_eq!(header_sum(&reply.payload), 0xffff);

        drop(inbound_tx);
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_relays_echo() {
        let config = PipelineGroupConfig::new(1, 4, vec![endpoint(1)]).with_icmp_proxy(true);
        let group = Arc::new(PipelineGroup::new(config, MockConnector::new()).unwrap());
        // Bring a channel up
        let _stream = group.open_stream("example.com:80").await.unwrap();

        let (device, host_tx, mut host_rx) = QueueDevice::new(8);
        let relay = IcmpRelay::with_capabilities(true, false);
        let runner = {
            let group = group.clone();
            tokio::spawn(async move { relay.run(&device, &group).await })
        };

        host_tx.send(ipv4_packet(6)).await.unwrap();
        host_tx.send(ipv6_packet(IPPROTO_ICMPV6)).await.unwrap();
        host_tx.send(ipv4_packet(IPPROTO_ICMP)).await.unwrap();

        assert_eq!(host_rx.recv().await.unwrap(), ipv4_packet(IPPROTO_ICMP));

        drop(host_tx);
        runner.await.unwrap().unwrap();
    }
}
