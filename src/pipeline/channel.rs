//! Pipeline channel: one persistent connection multiplexing many streams
//!
//! A channel owns its transport exclusively. The transport is split into a
//! reader task, which decodes frames, feeds stream queues and emits ACKs, and
//! a writer task fed by an unbounded queue. Sequence numbers are assigned
//! and frames queued under the channel lock, so wire order always matches
//! sequence order.
//!
//! The reader never waits on a stream's consumer. Stream queues are
//! unbounded; a data frame is acknowledged only once its consumer has taken
//! it, so what a stream can have buffered is bounded by the peer's window.

use super::stream::{Delivery, LogicalStream, StreamEvent, StreamHandle};
use crate::accounting::{AccountingEvent, AccountingSink, LogAccounting};
use crate::error::{Result, TunnelError};
use crate::protocol::{
    FlowWindow, Frame, FrameType, ReceiveTracker, CLIENT_FIRST_STREAM_ID, MAX_PAYLOAD_SIZE,
    SERVER_FIRST_STREAM_ID,
};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::AbortHandle;

/// Consumed-but-unacknowledged frames that trigger an ACK from the
/// consuming side even while its queue is not yet empty
const CONSUMER_ACK_BATCH: u64 = 32;

const READ_BUFFER_SIZE: usize = 32 * 1024;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// TCP connect, TLS handshake and preface in progress
    Connecting,
    Established,
    /// No new streams; existing ones finish
    Draining,
    Closed,
    Failed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }
}

/// Which end of the channel we are; decides stream id parity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Client,
    Server,
}

impl ChannelRole {
    fn first_stream_id(self) -> u32 {
        match self {
            ChannelRole::Client => CLIENT_FIRST_STREAM_ID,
            ChannelRole::Server => SERVER_FIRST_STREAM_ID,
        }
    }

    /// Whether `stream_id` belongs to the id space of this side
    fn owns(self, stream_id: u32) -> bool {
        match self {
            ChannelRole::Client => stream_id % 2 == 1,
            ChannelRole::Server => stream_id % 2 == 0,
        }
    }
}

/// Settings for one channel
#[derive(Clone)]
pub struct ChannelOptions {
    pub role: ChannelRole,
    pub ack_window_size: u32,
    /// Upper bound for [`PipelineChannel::shutdown`]
    pub shutdown_wait: Duration,
    /// Remote end, for logs and accounting
    pub peer: String,
    /// Where inbound ICMP packets go; `None` drops them
    pub icmp_sink: Option<mpsc::Sender<Frame>>,
    pub accounting: Arc<dyn AccountingSink>,
}

impl ChannelOptions {
    pub fn new(role: ChannelRole, ack_window_size: u32) -> Self {
        Self {
            role,
            ack_window_size,
            shutdown_wait: Duration::from_secs(3),
            peer: "unknown".to_string(),
            icmp_sink: None,
            accounting: Arc::new(LogAccounting),
        }
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn with_shutdown_wait(mut self, wait: Duration) -> Self {
        self.shutdown_wait = wait;
        self
    }

    pub fn with_icmp_sink(mut self, sink: mpsc::Sender<Frame>) -> Self {
        self.icmp_sink = Some(sink);
        self
    }

    pub fn with_accounting(mut self, accounting: Arc<dyn AccountingSink>) -> Self {
        self.accounting = accounting;
        self
    }
}

/// Point-in-time view of a channel's send window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub size: u32,
    pub last_sent_seq: u64,
    pub last_acked_seq: u64,
    pub peak_in_flight: u64,
}

impl WindowSnapshot {
    pub fn in_flight(&self) -> u64 {
        self.last_sent_seq - self.last_acked_seq
    }
}

enum WriterMsg {
    Frame(Frame),
    Shutdown,
}

struct StreamSlot {
    stream: LogicalStream,
    events: mpsc::UnboundedSender<Delivery>,
}

struct Inner {
    state: ChannelState,
    window: FlowWindow,
    recv: ReceiveTracker,
    streams: HashMap<u32, StreamSlot>,
    next_stream_id: u32,
    incoming: Option<mpsc::UnboundedSender<StreamHandle>>,
    icmp_sink: Option<mpsc::Sender<Frame>>,
}

/// State shared by the channel handle, its tasks and its streams
pub(crate) struct ChannelShared {
    id: u64,
    role: ChannelRole,
    peer: String,
    shutdown_wait: Duration,
    inner: Mutex<Inner>,
    /// Window space opened, a stream closed, or the channel ended
    window_changed: Notify,
    /// A stream was released or the channel ended
    streams_changed: Notify,
    state_tx: watch::Sender<ChannelState>,
    writer: mpsc::UnboundedSender<WriterMsg>,
    reader_task: Mutex<Option<AbortHandle>>,
    accounting: Arc<dyn AccountingSink>,
}

impl ChannelShared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn queue(&self, frame: Frame) {
        log::trace!(
            "channel {} -> {:?} stream {} seq {} len {}",
            self.id,
            frame.frame_type,
            frame.stream_id,
            frame.sequence,
            frame.payload.len()
        );
        // A closed queue means the writer is gone and the channel already ended
        let _ = self.writer.send(WriterMsg::Frame(frame));
    }

    fn set_state(&self, inner: &mut Inner, state: ChannelState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn unavailable(&self, state: ChannelState) -> TunnelError {
        match state {
            ChannelState::Failed => TunnelError::ChannelFailed(format!("channel {} failed", self.id)),
            other => TunnelError::ChannelUnavailable(format!("channel {} is {other:?}", self.id)),
        }
    }

    fn open_stream(self: &Arc<Self>, target: &str) -> Result<StreamHandle> {
        if target.is_empty() || target.len() > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::InvalidState(format!("invalid stream target '{target}'")));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream_id = {
            let mut inner = self.lock();
            if inner.state != ChannelState::Established {
                return Err(self.unavailable(inner.state));
            }
            let stream_id = inner.next_stream_id;
            let Some(next) = stream_id.checked_add(2) else {
                // Existing streams finish; new ones go elsewhere
                log::info!("Channel {} ran out of stream ids, draining", self.id);
                self.set_state(&mut inner, ChannelState::Draining);
                let shared = self.clone();
                tokio::spawn(async move { shared.drain(shared.shutdown_wait).await });
                return Err(TunnelError::ChannelUnavailable(format!(
                    "channel {} ran out of stream ids",
                    self.id
                )));
            };
            inner.next_stream_id = next;
            inner.streams.insert(
                stream_id,
                StreamSlot {
                    stream: LogicalStream::new(stream_id, target),
                    events: events_tx,
                },
            );
            self.queue(Frame::open(stream_id, target));
            stream_id
        };

        self.accounting.record(AccountingEvent::StreamOpened {
            channel_id: self.id,
            stream_id,
            target: target.to_string(),
        });
        Ok(StreamHandle::new(
            stream_id,
            target.to_string(),
            self.clone(),
            events_rx,
        ))
    }

    pub(crate) async fn send_data(&self, stream_id: u32, payload: Bytes) -> Result<()> {
        self.send_sequenced(Some(stream_id), payload).await
    }

    async fn send_icmp(&self, packet: Bytes) -> Result<()> {
        self.send_sequenced(None, packet).await
    }

    /// Assign a sequence number and queue the frame, suspending while the
    /// window is full. A stream closed meanwhile fails the send without
    /// consuming a sequence number.
    async fn send_sequenced(&self, stream_id: Option<u32>, payload: Bytes) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::InvalidState(format!(
                "payload of {} bytes exceeds frame limit",
                payload.len()
            )));
        }

        loop {
            let notified = self.window_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if !matches!(inner.state, ChannelState::Established | ChannelState::Draining) {
                    return Err(self.unavailable(inner.state));
                }
                if let Some(id) = stream_id {
                    match inner.streams.get(&id) {
                        Some(slot) if slot.stream.can_send() => {}
                        _ => return Err(TunnelError::StreamClosed(id)),
                    }
                }
                if let Some(sequence) = inner.window.try_advance() {
                    let frame = match stream_id {
                        Some(id) => {
                            if let Some(slot) = inner.streams.get_mut(&id) {
                                slot.stream.record_sent(payload.len());
                            }
                            Frame::data(id, sequence, payload)
                        }
                        None => Frame::icmp(sequence, payload),
                    };
                    self.queue(frame);
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Half-close: no more outbound data on the stream
    pub(crate) fn close_write(&self, stream_id: u32) {
        let finished = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            let Some(slot) = inner.streams.get_mut(&stream_id) else {
                return;
            };
            if !slot.stream.can_send() {
                return;
            }
            slot.stream.close_local();
            self.queue(Frame::close(stream_id));
            if slot.stream.is_closed() {
                inner.streams.remove(&stream_id)
            } else {
                None
            }
        };
        self.window_changed.notify_waiters();
        if let Some(slot) = finished {
            self.retire(&slot);
        }
    }

    /// Full close from the owning handle; inbound data is discarded from now on
    pub(crate) fn release_stream(&self, stream_id: u32) {
        let slot = {
            let mut inner = self.lock();
            let slot = inner.streams.remove(&stream_id);
            if let Some(slot) = &slot {
                if slot.stream.can_send() && !inner.state.is_terminal() {
                    self.queue(Frame::close(stream_id));
                }
            }
            slot
        };
        if let Some(slot) = slot {
            self.window_changed.notify_waiters();
            self.retire(&slot);
        }
    }

    /// Account for a stream that left the table
    fn retire(&self, slot: &StreamSlot) {
        self.record_stream_closed(&slot.stream);
        self.streams_changed.notify_waiters();
    }

    /// A consumer took a sequenced frame off its queue. `drained` says the
    /// queue is now empty, which is when the consumer side sends the ACK.
    pub(crate) fn consumed(&self, sequence: u64, drained: bool) {
        let ack = {
            let mut inner = self.lock();
            inner.recv.release(sequence);
            if inner.state.is_terminal() {
                return;
            }
            if drained || inner.recv.unacked() >= CONSUMER_ACK_BATCH {
                inner.recv.take_pending_ack()
            } else {
                None
            }
        };
        if let Some(sequence) = ack {
            self.queue(Frame::ack(sequence));
        }
    }

    /// Frames left in a dropped handle's queue
    pub(crate) fn discard_unread(&self, sequences: &[u64]) {
        let ack = {
            let mut inner = self.lock();
            for sequence in sequences {
                inner.recv.release(*sequence);
            }
            if inner.state.is_terminal() {
                return;
            }
            inner.recv.take_pending_ack()
        };
        if let Some(sequence) = ack {
            self.queue(Frame::ack(sequence));
        }
    }

    fn record_stream_closed(&self, stream: &LogicalStream) {
        self.accounting.record(AccountingEvent::StreamClosed {
            channel_id: self.id,
            stream_id: stream.id(),
            target: stream.target().to_string(),
            bytes_sent: stream.bytes_sent(),
            bytes_received: stream.bytes_received(),
        });
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<()> {
        log::trace!(
            "channel {} <- {:?} stream {} seq {} len {}",
            self.id,
            frame.frame_type,
            frame.stream_id,
            frame.sequence,
            frame.payload.len()
        );

        match frame.frame_type {
            FrameType::Ack => {
                let opened = self.lock().window.acknowledge(frame.sequence)?;
                if opened {
                    self.window_changed.notify_waiters();
                }
            }
            FrameType::Data => {
                let mut inner = self.lock();
                inner.recv.accept(frame.sequence)?;
                let delivered = match inner.streams.get_mut(&frame.stream_id) {
                    Some(slot) if slot.stream.can_recv() => {
                        slot.stream.record_received(frame.payload.len());
                        // A closed queue means the handle is going away
                        slot.events
                            .send(Delivery::data(frame.sequence, frame.payload))
                            .is_ok()
                    }
                    _ => false,
                };
                if delivered {
                    inner.recv.hold(frame.sequence);
                } else {
                    log::trace!(
                        "channel {}: discarding data for closed stream {}",
                        self.id,
                        frame.stream_id
                    );
                }
            }
            FrameType::Icmp => {
                let sink = {
                    let mut inner = self.lock();
                    inner.recv.accept(frame.sequence)?;
                    inner.icmp_sink.clone()
                };
                match sink {
                    Some(sink) => {
                        if sink.try_send(frame).is_err() {
                            log::debug!("channel {}: inbound ICMP queue full, packet dropped", self.id);
                        }
                    }
                    None => log::debug!("channel {}: ICMP sub-channel not enabled, packet dropped", self.id),
                }
            }
            FrameType::Open => self.accept_stream(frame)?,
            FrameType::Close => {
                let finished = {
                    let mut inner = self.lock();
                    match inner.streams.get_mut(&frame.stream_id) {
                        Some(slot) if slot.stream.can_recv() => {
                            slot.stream.close_remote();
                            let _ = slot.events.send(Delivery::event(StreamEvent::Close));
                            if slot.stream.is_closed() {
                                inner.streams.remove(&frame.stream_id)
                            } else {
                                None
                            }
                        }
                        _ => None,
                    }
                };
                if let Some(slot) = finished {
                    self.retire(&slot);
                }
            }
        }
        Ok(())
    }

    /// Peer-initiated stream
    fn accept_stream(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let stream_id = frame.stream_id;
        if self.role.owns(stream_id) {
            return Err(TunnelError::FrameProtocol(format!(
                "peer opened stream {stream_id} in our id space"
            )));
        }
        let target = String::from_utf8(frame.payload.to_vec()).map_err(|_| {
            TunnelError::FrameProtocol(format!("stream {stream_id} target is not UTF-8"))
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let incoming = {
            let mut inner = self.lock();
            if inner.streams.contains_key(&stream_id) {
                return Err(TunnelError::FrameProtocol(format!(
                    "stream {stream_id} opened twice"
                )));
            }
            if inner.state != ChannelState::Established {
                self.queue(Frame::close(stream_id));
                return Ok(());
            }
            inner.streams.insert(
                stream_id,
                StreamSlot {
                    stream: LogicalStream::new(stream_id, target.clone()),
                    events: events_tx,
                },
            );
            inner.incoming.clone()
        };

        self.accounting.record(AccountingEvent::StreamOpened {
            channel_id: self.id,
            stream_id,
            target: target.clone(),
        });
        let handle = StreamHandle::new(stream_id, target, self.clone(), events_rx);
        match incoming {
            Some(incoming) => {
                if incoming.send(handle).is_err() {
                    log::debug!("channel {}: nobody accepts stream {stream_id}", self.id);
                }
            }
            None => log::debug!("channel {}: inbound stream {stream_id} refused", self.id),
        }
        Ok(())
    }

    async fn read_loop<R: AsyncRead + Unpin>(self: Arc<Self>, mut reader: R) {
        match self.read_frames(&mut reader).await {
            Ok(()) => self.on_eof(),
            Err(e) => {
                log::warn!("Channel {} to {} failed: {e}", self.id, self.peer);
                self.finish(ChannelState::Failed, &e.to_string());
            }
        }
    }

    async fn read_frames<R: AsyncRead + Unpin>(self: &Arc<Self>, reader: &mut R) -> Result<()> {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            if buf.capacity() - buf.len() < READ_BUFFER_SIZE / 4 {
                buf.reserve(READ_BUFFER_SIZE);
            }
            if reader.read_buf(&mut buf).await? == 0 {
                if !buf.is_empty() {
                    return Err(TunnelError::FrameProtocol(
                        "connection closed mid-frame".to_string(),
                    ));
                }
                return Ok(());
            }

            while let Some(frame) = Frame::decode(&mut buf)? {
                self.dispatch(frame)?;
            }

            // One ACK per drained read buffer
            let ack = self.lock().recv.take_pending_ack();
            if let Some(sequence) = ack {
                self.queue(Frame::ack(sequence));
            }
        }
    }

    fn on_eof(&self) {
        let (state, open_streams) = {
            let inner = self.lock();
            (inner.state, inner.streams.len())
        };
        match state {
            ChannelState::Closed | ChannelState::Failed => {}
            _ if open_streams == 0 => {
                log::debug!("Channel {} closed by {}", self.id, self.peer);
                self.finish(ChannelState::Closed, "closed by peer");
            }
            _ => {
                log::warn!(
                    "Channel {} to {} lost with {open_streams} open streams",
                    self.id,
                    self.peer
                );
                self.finish(ChannelState::Failed, "connection closed by peer");
            }
        }
    }

    async fn write_loop<W: AsyncWrite + Unpin>(
        self: Arc<Self>,
        mut writer: W,
        mut queue: mpsc::UnboundedReceiver<WriterMsg>,
    ) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        while let Some(first) = queue.recv().await {
            let mut shutdown = false;
            let mut next = Some(first);
            // Batch whatever is already queued into one write
            while let Some(msg) = next.take() {
                match msg {
                    WriterMsg::Frame(frame) => {
                        if let Err(e) = frame.encode_into(&mut buf) {
                            self.finish(ChannelState::Failed, &e.to_string());
                            return;
                        }
                    }
                    WriterMsg::Shutdown => {
                        shutdown = true;
                        break;
                    }
                }
                next = queue.try_recv().ok();
            }

            if !buf.is_empty() {
                let written = async {
                    writer.write_all(&buf).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    if !shutdown {
                        self.finish(ChannelState::Failed, &format!("write failed: {e}"));
                    }
                    return;
                }
                buf.clear();
            }

            if shutdown {
                let _ = writer.shutdown().await;
                return;
            }
        }
    }

    /// Move to a terminal state and fail whatever is still open
    fn finish(&self, terminal: ChannelState, reason: &str) {
        let (slots, icmp_sink, incoming) = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            self.set_state(&mut inner, terminal);
            (
                std::mem::take(&mut inner.streams),
                inner.icmp_sink.take(),
                inner.incoming.take(),
            )
        };
        drop(icmp_sink);
        drop(incoming);

        for (_, slot) in slots {
            let _ = slot
                .events
                .send(Delivery::event(StreamEvent::Failed(reason.to_string())));
            self.record_stream_closed(&slot.stream);
        }

        let _ = self.writer.send(WriterMsg::Shutdown);
        let reader = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }

        self.window_changed.notify_waiters();
        self.streams_changed.notify_waiters();
        self.accounting.record(AccountingEvent::ChannelClosed {
            channel_id: self.id,
            peer: self.peer.clone(),
            failed: terminal == ChannelState::Failed,
        });
    }

    async fn drain(&self, wait: Duration) {
        {
            let mut inner = self.lock();
            match inner.state {
                ChannelState::Connecting | ChannelState::Established => {
                    self.set_state(&mut inner, ChannelState::Draining)
                }
                ChannelState::Draining => {}
                ChannelState::Closed | ChannelState::Failed => return,
            }
        }
        log::info!("Draining channel {} to {}", self.id, self.peer);

        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            let notified = self.streams_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.lock();
                if inner.state.is_terminal() {
                    return;
                }
                if inner.streams.is_empty() {
                    break;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = &mut deadline => {
                    log::warn!("Channel {} drain timed out", self.id);
                    break;
                }
            }
        }
        self.finish(ChannelState::Closed, "channel closed");
    }
}

/// One persistent connection carrying many logical streams
pub struct PipelineChannel {
    shared: Arc<ChannelShared>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<StreamHandle>>>,
}

impl PipelineChannel {
    /// Take ownership of an established, authenticated transport and start
    /// the reader and writer tasks
    pub fn spawn<IO>(io: IO, options: ChannelOptions) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ChannelState::Established);

        let shared = Arc::new(ChannelShared {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            role: options.role,
            peer: options.peer,
            shutdown_wait: options.shutdown_wait,
            inner: Mutex::new(Inner {
                state: ChannelState::Established,
                window: FlowWindow::new(options.ack_window_size),
                recv: ReceiveTracker::new(),
                streams: HashMap::new(),
                next_stream_id: options.role.first_stream_id(),
                incoming: Some(incoming_tx),
                icmp_sink: options.icmp_sink,
            }),
            window_changed: Notify::new(),
            streams_changed: Notify::new(),
            state_tx,
            writer: writer_tx,
            reader_task: Mutex::new(None),
            accounting: options.accounting,
        });

        tokio::spawn(shared.clone().write_loop(writer, writer_rx));
        let reader_task = tokio::spawn(shared.clone().read_loop(reader));
        *shared
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reader_task.abort_handle());

        shared.accounting.record(AccountingEvent::ChannelOpened {
            channel_id: shared.id,
            peer: shared.peer.clone(),
        });

        Self {
            shared,
            incoming: Mutex::new(Some(incoming_rx)),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn role(&self) -> ChannelRole {
        self.shared.role
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn state(&self) -> ChannelState {
        self.shared.lock().state
    }

    /// Streams currently open on this channel
    pub fn stream_count(&self) -> usize {
        self.shared.lock().streams.len()
    }

    pub fn window(&self) -> WindowSnapshot {
        let inner = self.shared.lock();
        WindowSnapshot {
            size: inner.window.size(),
            last_sent_seq: inner.window.last_sent_seq(),
            last_acked_seq: inner.window.last_acked_seq(),
            peak_in_flight: inner.window.peak_in_flight(),
        }
    }

    /// Open a stream to `target` (`host:port`)
    pub fn open_stream(&self, target: &str) -> Result<StreamHandle> {
        self.shared.open_stream(target)
    }

    /// Send one raw ICMP packet on the reserved stream
    pub async fn send_icmp(&self, packet: Bytes) -> Result<()> {
        self.shared.send_icmp(packet).await
    }

    /// Streams opened by the peer; available once
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<StreamHandle>> {
        self.incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Stop accepting streams, wait for open ones (bounded by the shutdown
    /// wait) and close
    pub async fn shutdown(&self) {
        self.shared.drain(self.shared.shutdown_wait).await;
    }

    /// Close immediately; open streams observe `Failed`
    pub fn abort(&self) {
        self.shared.finish(ChannelState::Closed, "channel aborted");
    }

    /// Wait until the channel reaches a terminal state
    pub async fn closed(&self) -> ChannelState {
        let mut state = self.shared.state_tx.subscribe();
        let terminal = match state.wait_for(|s| s.is_terminal()).await {
            Ok(terminal) => *terminal,
            Err(_) => ChannelState::Closed,
        };
        terminal
    }
}

impl Drop for PipelineChannel {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for PipelineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineChannel")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .finish()
    }
}
