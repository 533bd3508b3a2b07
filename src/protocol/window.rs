//! Sliding acknowledgement window
//!
//! The sender side ([`FlowWindow`]) hands out sequence numbers while fewer
//! than `size` frames are unacknowledged. The receiver side
//! ([`ReceiveTracker`]) checks that sequence numbers arrive contiguously and
//! decides when an ACK is due. A frame still waiting in a stream queue is
//! held and caps the acknowledgement below its sequence, so the peer's window
//! bounds what a slow consumer can have buffered.

use crate::error::{Result, TunnelError};
use std::collections::BTreeSet;

/// Sender-side sequence and window accounting for one channel
///
/// `last_acked_seq <= last_sent_seq` and
/// `last_sent_seq - last_acked_seq <= size` hold at all times.
#[derive(Debug, Clone)]
pub struct FlowWindow {
    size: u32,
    last_sent_seq: u64,
    last_acked_seq: u64,
    peak_in_flight: u64,
}

impl FlowWindow {
    pub fn new(size: u32) -> Self {
        Self {
            size: size.max(1),
            last_sent_seq: 0,
            last_acked_seq: 0,
            peak_in_flight: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn in_flight(&self) -> u64 {
        self.last_sent_seq - self.last_acked_seq
    }

    pub fn has_room(&self) -> bool {
        self.in_flight() < u64::from(self.size)
    }

    /// Assign the next sequence number, or `None` when the window is full
    pub fn try_advance(&mut self) -> Option<u64> {
        if !self.has_room() {
            return None;
        }
        self.last_sent_seq += 1;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight());
        Some(self.last_sent_seq)
    }

    /// Apply an ACK; returns whether it opened window space
    ///
    /// Stale and duplicate acknowledgements are no-ops. Acknowledging a
    /// sequence that was never sent is a protocol violation.
    pub fn acknowledge(&mut self, sequence: u64) -> Result<bool> {
        if sequence > self.last_sent_seq {
            return Err(TunnelError::FrameProtocol(format!(
                "ack for {sequence} but only {} sent",
                self.last_sent_seq
            )));
        }
        if sequence <= self.last_acked_seq {
            return Ok(false);
        }
        self.last_acked_seq = sequence;
        Ok(true)
    }

    pub fn last_sent_seq(&self) -> u64 {
        self.last_sent_seq
    }

    pub fn last_acked_seq(&self) -> u64 {
        self.last_acked_seq
    }

    /// Largest number of unacknowledged frames ever observed
    pub fn peak_in_flight(&self) -> u64 {
        self.peak_in_flight
    }
}

/// Receiver-side sequence tracking for one channel
#[derive(Debug, Clone, Default)]
pub struct ReceiveTracker {
    last_received: u64,
    last_ack_sent: u64,
    /// Accepted but not yet taken by a consumer
    held: BTreeSet<u64>,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the next sequenced frame; anything but `last + 1` is fatal
    pub fn accept(&mut self, sequence: u64) -> Result<()> {
        let expected = self.last_received + 1;
        if sequence != expected {
            return Err(TunnelError::FrameProtocol(format!(
                "expected sequence {expected}, got {sequence}"
            )));
        }
        self.last_received = sequence;
        Ok(())
    }

    /// Keep `sequence` unacknowledged until [`release`](Self::release)
    pub fn hold(&mut self, sequence: u64) {
        self.held.insert(sequence);
    }

    pub fn release(&mut self, sequence: u64) {
        self.held.remove(&sequence);
    }

    /// Highest sequence that may be acknowledged right now
    pub fn ack_point(&self) -> u64 {
        match self.held.first() {
            Some(first) => first - 1,
            None => self.last_received,
        }
    }

    /// Acknowledgeable sequences not yet covered by an ACK
    pub fn unacked(&self) -> u64 {
        self.ack_point().saturating_sub(self.last_ack_sent)
    }

    /// Sequence to acknowledge now, if the ack point moved since the last ACK
    pub fn take_pending_ack(&mut self) -> Option<u64> {
        let point = self.ack_point();
        if point > self.last_ack_sent {
            self.last_ack_sent = point;
            Some(point)
        } else {
            None
        }
    }

    pub fn last_received(&self) -> u64 {
        self.last_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_blocks_at_size() {
        let mut window = FlowWindow::new(4);
        for expected in 1..=4 {
            assert_eq!(window.try_advance(), Some(expected));
        }
        assert!(!window.has_room());
        assert_eq!(window.try_advance(), None);
        assert_eq!(window.in_flight(), 4);

        assert!(window.acknowledge(2).unwrap());
        assert_eq!(window.try_advance(), Some(5));
        assert_eq!(window.in_flight(), 3);
        assert_eq!(window.peak_in_flight(), 4);
    }

    #[test]
    fn test_duplicate_ack_is_noop() {
        let mut window = FlowWindow::new(8);
        for _ in 0..3 {
            window.try_advance();
        }
        assert!(window.acknowledge(2).unwrap());
        let snapshot = (window.last_sent_seq(), window.last_acked_seq());
        assert!(!window.acknowledge(2).unwrap());
        assert!(!window.acknowledge(1).unwrap());
        assert_eq!((window.last_sent_seq(), window.last_acked_seq()), snapshot);
    }

    #[test]
    fn test_ack_beyond_sent_rejected() {
        let mut window = FlowWindow::new(8);
        window.try_advance();
        assert!(matches!(window.acknowledge(2), Err(TunnelError::FrameProtocol(_))));
    }

    #[test]
    fn test_invariant_under_mixed_traffic() {
        let mut window = FlowWindow::new(3);
        let mut acked = 0;
        for step in 0..200u64 {
            if step % 3 == 2 && window.last_sent_seq() > acked {
                acked += 1;
                window.acknowledge(acked).unwrap();
            } else {
                window.try_advance();
            }
            assert!(window.last_acked_seq() <= window.last_sent_seq());
            assert!(window.in_flight() <= 3);
        }
    }

    #[test]
    fn test_receiver_requires_contiguous_sequences() {
        let mut tracker = ReceiveTracker::new();
        tracker.accept(1).unwrap();
        tracker.accept(2).unwrap();
        assert!(tracker.accept(4).is_err());
        assert!(tracker.accept(2).is_err());
        assert_eq!(tracker.last_received(), 2);
    }

    #[test]
    fn test_pending_ack_once_per_batch() {
        let mut tracker = ReceiveTracker::new();
        assert_eq!(tracker.take_pending_ack(), None);
        tracker.accept(1).unwrap();
        tracker.accept(2).unwrap();
        assert_eq!(tracker.take_pending_ack(), Some(2));
        assert_eq!(tracker.take_pending_ack(), None);
        tracker.accept(3).unwrap();
        assert_eq!(tracker.take_pending_ack(), Some(3));
    }

    #[test]
    fn test_held_frames_cap_ack() {
        let mut tracker = ReceiveTracker::new();
        for sequence in 1..=5 {
            tracker.accept(sequence).unwrap();
        }
        tracker.hold(2);
        tracker.hold(4);
        assert_eq!(tracker.take_pending_ack(), Some(1));
        assert_eq!(tracker.take_pending_ack(), None);

        // Releasing out of order only moves the point past the lowest hold
        tracker.release(4);
        assert_eq!(tracker.unacked(), 0);
        tracker.release(2);
        assert_eq!(tracker.unacked(), 4);
        assert_eq!(tracker.take_pending_ack(), Some(5));
    }
}
