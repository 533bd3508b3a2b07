//! Frame encoding/decoding for the pipeline protocol
//!
//! Frame format (big endian):
//! ```text
//! +--------+-----------------------------------+
//! |  Type  |          Stream ID (4B)           |
//! +--------+-----------------------------------+
//! |              Sequence (8B)                 |
//! +--------------------+-----------------------+
//! |    Length (2B)     |        Payload        |
//! +--------------------+-----------------------+
//! ```
//!
//! DATA and ICMP frames are sequenced (sequence >= 1) and count against the
//! ack window. ACK carries the highest contiguous sequence received in the
//! sequence field. OPEN carries the target `host:port`; OPEN and CLOSE carry
//! sequence 0.

use crate::error::{Result, TunnelError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 1 + 4 + 8 + 2;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Stream id reserved for the ICMP sub-channel and for ACK frames
pub const ICMP_STREAM_ID: u32 = 0;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream payload
    Data = 0x00,
    /// Highest contiguous sequence received
    Ack = 0x01,
    /// Stream open request
    Open = 0x02,
    /// Stream close
    Close = 0x03,
    /// Raw ICMP packet on the reserved stream
    Icmp = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::Ack),
            0x02 => Ok(FrameType::Open),
            0x03 => Ok(FrameType::Close),
            0x04 => Ok(FrameType::Icmp),
            _ => Err(TunnelError::FrameProtocol(format!(
                "Unknown frame type: {value}"
            ))),
        }
    }
}

impl FrameType {
    /// Whether frames of this type consume a sequence number
    pub fn is_sequenced(self) -> bool {
        matches!(self, FrameType::Data | FrameType::Icmp)
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Stream ID (0 for ACK and ICMP)
    pub stream_id: u32,
    /// Sequence number (DATA/ICMP), acknowledged sequence (ACK), else 0
    pub sequence: u64,
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame
    pub fn data(stream_id: u32, sequence: u64, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            sequence,
            payload,
        }
    }

    /// Create an acknowledgement for everything up to `sequence`
    pub fn ack(sequence: u64) -> Self {
        Self {
            frame_type: FrameType::Ack,
            stream_id: ICMP_STREAM_ID,
            sequence,
            payload: Bytes::new(),
        }
    }

    /// Create a stream open frame
    pub fn open(stream_id: u32, target: &str) -> Self {
        Self {
            frame_type: FrameType::Open,
            stream_id,
            sequence: 0,
            payload: Bytes::copy_from_slice(target.as_bytes()),
        }
    }

    /// Create a stream close frame
    pub fn close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            sequence: 0,
            payload: Bytes::new(),
        }
    }

    /// Create an ICMP frame; the sequence is assigned by the channel
    pub fn icmp(sequence: u64, packet: Bytes) -> Self {
        Self {
            frame_type: FrameType::Icmp,
            stream_id: ICMP_STREAM_ID,
            sequence,
            payload: packet,
        }
    }

    /// Check the per-type rules every frame on the wire must satisfy
    pub fn validate(&self) -> Result<()> {
        let bad = |why: &str| {
            Err(TunnelError::FrameProtocol(format!(
                "{:?} frame on stream {}: {why}",
                self.frame_type, self.stream_id
            )))
        };

        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return bad("payload too large");
        }
        match self.frame_type {
            FrameType::Data if self.stream_id == ICMP_STREAM_ID => bad("reserved stream id"),
            FrameType::Data | FrameType::Icmp if self.sequence == 0 => bad("missing sequence"),
            FrameType::Icmp if self.stream_id != ICMP_STREAM_ID => bad("not on reserved stream"),
            FrameType::Ack if self.stream_id != ICMP_STREAM_ID || !self.payload.is_empty() => {
                bad("ack must be bare")
            }
            FrameType::Open | FrameType::Close if self.stream_id == ICMP_STREAM_ID => {
                bad("reserved stream id")
            }
            FrameType::Open | FrameType::Close if self.sequence != 0 => bad("unexpected sequence"),
            FrameType::Open if self.payload.is_empty() => bad("missing target"),
            FrameType::Close if !self.payload.is_empty() => bad("unexpected payload"),
            _ => Ok(()),
        }
    }

    /// Encode the frame, appending it to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        self.validate()?;
        buf.reserve(self.encoded_size());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u64(self.sequence);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` until a whole frame is buffered.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Reject garbage before waiting on a bogus length
        let frame_type = FrameType::try_from(buf[0])?;
        let payload_len = u16::from_be_bytes([buf[13], buf[14]]) as usize;
        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(1);
        let stream_id = buf.get_u32();
        let sequence = buf.get_u64();
        buf.advance(2);
        let payload = buf.split_to(payload_len).freeze();

        let frame = Self {
            frame_type,
            stream_id,
            sequence,
            payload,
        };
        frame.validate()?;
        Ok(Some(frame))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: &Frame) -> Frame {
        let mut encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert!(encoded.is_empty());
        decoded
    }

    #[test]
    fn test_data_frame_payload_extremes() {
        for payload in [Bytes::new(), Bytes::from(vec![0xA5; MAX_PAYLOAD_SIZE])] {
            let original = Frame::data(7, 1, payload);
            let decoded = round_trip(&original);
            assert_eq!(decoded.stream_id, 7);
            assert_eq!(decoded.payload, original.payload);
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = Frame::data(1, 1, Bytes::from(vec![0; MAX_PAYLOAD_SIZE + 1]));
        assert!(matches!(frame.encode(), Err(TunnelError::FrameProtocol(_))));
    }

    #[test]
    fn test_partial_frames_wait() {
        let encoded = Frame::open(3, "example.com:443").encode().unwrap();
        let mut partial = BytesMut::from(&encoded[..FRAME_HEADER_SIZE + 4]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&encoded[FRAME_HEADER_SIZE + 4..]);
        let decoded = Frame::decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Open);
        assert_eq!(&decoded.payload[..], b"example.com:443");
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        Frame::data(1, 1, Bytes::from_static(b"one")).encode_into(&mut buf).unwrap();
        Frame::ack(9).encode_into(&mut buf).unwrap();
        Frame::close(1).encode_into(&mut buf).unwrap();

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        let third = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Data);
        assert_eq!(second, Frame::ack(9));
        assert_eq!(third, Frame::close(1));
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let mut buf = BytesMut::from(&[0x09u8; FRAME_HEADER_SIZE][..]);
        assert!(matches!(Frame::decode(&mut buf), Err(TunnelError::FrameProtocol(_))));
    }

    #[test]
    fn test_rule_violations_rejected_on_decode() {
        let cases = [
            // DATA on the reserved stream
            (FrameType::Data, ICMP_STREAM_ID, 1u64, &b"x"[..]),
            // unsequenced DATA
            (FrameType::Data, 1, 0, &b"x"[..]),
            // ICMP off the reserved stream
            (FrameType::Icmp, 5, 1, &b"x"[..]),
            // ACK with payload
            (FrameType::Ack, 0, 1, &b"x"[..]),
            // OPEN without target
            (FrameType::Open, 1, 0, &b""[..]),
            // CLOSE carrying a sequence
            (FrameType::Close, 1, 4, &b""[..]),
        ];
        for (frame_type, stream_id, sequence, payload) in cases {
            let mut buf = BytesMut::new();
            buf.put_u8(frame_type as u8);
            buf.put_u32(stream_id);
            buf.put_u64(sequence);
            buf.put_u16(payload.len() as u16);
            buf.extend_from_slice(payload);
            assert!(
                matches!(Frame::decode(&mut buf), Err(TunnelError::FrameProtocol(_))),
                "{frame_type:?} on {stream_id} seq {sequence} accepted"
            );
        }
    }

    #[test]
    fn test_icmp_frame_uses_reserved_stream() {
        let frame = Frame::icmp(3, Bytes::from_static(&[8, 0, 0, 0]));
        let decoded = round_trip(&frame);
        assert_eq!(decoded.stream_id, ICMP_STREAM_ID);
        assert!(decoded.frame_type.is_sequenced());
        assert_eq!(decoded.encoded_size(), FRAME_HEADER_SIZE + 4);
    }
}
