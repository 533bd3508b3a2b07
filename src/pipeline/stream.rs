//! Logical streams multiplexed over a pipeline channel

use super::channel::ChannelShared;
use crate::error::Result;
use crate::protocol::MAX_PAYLOAD_SIZE;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream half-close state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Local side has closed
    HalfClosedLocal,
    /// Remote side has closed
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

/// Bookkeeping the channel keeps for every stream it carries
#[derive(Debug, Clone)]
pub struct LogicalStream {
    id: u32,
    target: String,
    state: StreamState,
    bytes_sent: u64,
    bytes_received: u64,
}

impl LogicalStream {
    pub fn new(id: u32, target: impl Into<String>) -> Self {
        Self {
            id,
            target: target.into(),
            state: StreamState::Open,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Destination `host:port`
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Close local side
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Close remote side
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Check if stream is fully closed
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

/// Event delivered to the owner of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Data received for stream
    Data(Bytes),
    /// Stream closed by remote; no more data follows
    Close,
    /// The carrying channel failed
    Failed(String),
}

/// One queued event; sequenced data is acknowledged once it is taken
pub(crate) struct Delivery {
    pub(crate) sequence: Option<u64>,
    pub(crate) event: StreamEvent,
}

impl Delivery {
    pub(crate) fn data(sequence: u64, payload: Bytes) -> Self {
        Self {
            sequence: Some(sequence),
            event: StreamEvent::Data(payload),
        }
    }

    pub(crate) fn event(event: StreamEvent) -> Self {
        Self {
            sequence: None,
            event,
        }
    }
}

/// Shared by a handle and its senders; the stream is released when the
/// last of them goes away
pub(crate) struct StreamCore {
    id: u32,
    target: String,
    channel: Arc<ChannelShared>,
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        self.channel.release_stream(self.id);
    }
}

/// Stream handle for application use
pub struct StreamHandle {
    core: Arc<StreamCore>,
    events: mpsc::UnboundedReceiver<Delivery>,
    finished: bool,
}

impl StreamHandle {
    pub(crate) fn new(
        id: u32,
        target: String,
        channel: Arc<ChannelShared>,
        events: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            core: Arc::new(StreamCore {
                id,
                target,
                channel,
            }),
            events,
            finished: false,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Destination `host:port`
    pub fn target(&self) -> &str {
        &self.core.target
    }

    /// Id of the channel carrying this stream
    pub fn channel_id(&self) -> u64 {
        self.core.channel.id()
    }

    /// A sending half that can be driven from another task
    pub fn sender(&self) -> StreamSender {
        StreamSender {
            core: self.core.clone(),
        }
    }

    /// Send data on this stream, suspending while the ack window is full
    pub async fn send(&self, data: Bytes) -> Result<()> {
        send_chunked(&self.core, data).await
    }

    /// Signal end of outbound data; inbound data keeps flowing
    pub fn close_write(&self) {
        self.core.channel.close_write(self.core.id);
    }

    /// Receive the next event
    ///
    /// Returns `None` after `Close` or `Failed` has been delivered. A queue
    /// that ends without either is reported as `Failed` once.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = match self.events.recv().await {
            Some(Delivery { sequence, event }) => {
                if let Some(sequence) = sequence {
                    self.core
                        .channel
                        .consumed(sequence, self.events.is_empty());
                }
                event
            }
            None => StreamEvent::Failed("channel closed".to_string()),
        };
        if !matches!(event, StreamEvent::Data(_)) {
            self.finished = true;
        }
        Some(event)
    }

    /// Close this stream in both directions
    pub fn close(self) {}
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        // Queued frames nobody will read still count as consumed
        self.events.close();
        let mut unread = Vec::new();
        while let Ok(delivery) = self.events.try_recv() {
            unread.extend(delivery.sequence);
        }
        if !unread.is_empty() {
            self.core.channel.discard_unread(&unread);
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.core.id)
            .field("target", &self.core.target)
            .field("channel", &self.core.channel.id())
            .finish()
    }
}

/// Sending half of a stream
#[derive(Clone)]
pub struct StreamSender {
    core: Arc<StreamCore>,
}

impl StreamSender {
    pub fn id(&self) -> u32 {
        self.core.id
    }

    pub async fn send(&self, data: Bytes) -> Result<()> {
        send_chunked(&self.core, data).await
    }

    pub fn close_write(&self) {
        self.core.channel.close_write(self.core.id);
    }
}

async fn send_chunked(core: &StreamCore, data: Bytes) -> Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + MAX_PAYLOAD_SIZE).min(data.len());
        core.channel
            .send_data(core.id, data.slice(offset..end))
            .await?;
        offset = end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_states() {
        let mut stream = LogicalStream::new(1, "example.com:80");
        assert_eq!(stream.state(), StreamState::Open);

        stream.close_local();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(!stream.can_send());
        assert!(stream.can_recv());

        stream.close_remote();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.is_closed());
    }

    #[test]
    fn test_remote_close_keeps_sending() {
        let mut stream = LogicalStream::new(3, "example.com:80");
        stream.close_remote();
        assert!(stream.can_send());
        assert!(!stream.can_recv());
        stream.close_remote();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn test_byte_counters() {
        let mut stream = LogicalStream::new(5, "example.com:80");
        stream.record_sent(10);
        stream.record_sent(5);
        stream.record_received(7);
        assert_eq!(stream.bytes_sent(), 15);
        assert_eq!(stream.bytes_received(), 7);
        assert_eq!(stream.target(), "example.com:80");
    }
}
