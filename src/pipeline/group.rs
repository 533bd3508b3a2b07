//! Pipeline group: a bounded pool of channels over several endpoints
//!
//! Streams go to the established channel carrying the fewest streams. New
//! channels are opened on demand, up to `pipeline_count`, against endpoints
//! picked round-robin; an endpoint whose last connect attempt failed sits out
//! for `failure_cooldown`. A stream whose channel fails before any inbound
//! byte arrived is re-placed once and its outbound prefix replayed.

use super::channel::{ChannelOptions, ChannelRole, ChannelState, PipelineChannel};
use super::connector::{BoxedIo, ChannelConnector};
use super::stream::{StreamEvent, StreamHandle, StreamSender};
use crate::accounting::{AccountingSink, LogAccounting};
use crate::endpoint::EndpointDescriptor;
use crate::error::{Result, TunnelError};
use crate::protocol::{Frame, FrameType};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// Outbound bytes kept for replay; a longer prefix makes a stream non-replayable
pub const REPLAY_LIMIT: usize = 64 * 1024;

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const ICMP_QUEUE_DEPTH: usize = 256;

/// Settings for one group
#[derive(Clone)]
pub struct PipelineGroupConfig {
    /// Upper bound on channels, connecting ones included
    pub pipeline_count: usize,
    /// Unacknowledged sequenced frames allowed per channel
    pub ack_window_size: u32,
    /// Candidate endpoints in round-robin order
    pub endpoints: Vec<EndpointDescriptor>,
    pub icmp_proxy_enabled: bool,
    pub failure_cooldown: Duration,
    /// How long a stream request waits for a channel
    pub open_timeout: Duration,
    pub shutdown_wait: Duration,
}

impl PipelineGroupConfig {
    /// `open_timeout` starts as the largest endpoint connect timeout
    pub fn new(
        pipeline_count: usize,
        ack_window_size: u32,
        endpoints: Vec<EndpointDescriptor>,
    ) -> Self {
        let open_timeout = endpoints
            .iter()
            .map(|e| e.tcp().connect_timeout())
            .max()
            .unwrap_or(DEFAULT_OPEN_TIMEOUT);
        Self {
            pipeline_count,
            ack_window_size,
            endpoints,
            icmp_proxy_enabled: false,
            failure_cooldown: Duration::from_secs(30),
            open_timeout,
            shutdown_wait: Duration::from_secs(3),
        }
    }

    pub fn with_icmp_proxy(mut self, enabled: bool) -> Self {
        self.icmp_proxy_enabled = enabled;
        self
    }

    pub fn with_failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.failure_cooldown = cooldown;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_shutdown_wait(mut self, wait: Duration) -> Self {
        self.shutdown_wait = wait;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline_count == 0 {
            return Err(TunnelError::Config("pipeline_count must be at least 1".to_string()));
        }
        if self.ack_window_size == 0 {
            return Err(TunnelError::Config("ack_window_size must be at least 1".to_string()));
        }
        if self.endpoints.is_empty() {
            return Err(TunnelError::Config("no endpoints configured".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PipelineGroupConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGroupConfig")
            .field("pipeline_count", &self.pipeline_count)
            .field("ack_window_size", &self.ack_window_size)
            .field("endpoints", &self.endpoints.len())
            .field("icmp_proxy_enabled", &self.icmp_proxy_enabled)
            .field("failure_cooldown", &self.failure_cooldown)
            .field("open_timeout", &self.open_timeout)
            .finish()
    }
}

/// One row of [`PipelineGroup::channel_stats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    /// `None` while connecting
    pub channel_id: Option<u64>,
    pub endpoint: String,
    pub state: ChannelState,
    pub streams: usize,
    pub in_flight: u64,
    pub peak_in_flight: u64,
}

struct ChannelEntry {
    channel: Arc<PipelineChannel>,
    endpoint: usize,
}

struct Table {
    /// Creation order; the first entry is the oldest
    channels: Vec<ChannelEntry>,
    /// Endpoint indices with a connect in progress
    connecting: Vec<usize>,
    cursor: usize,
    last_failure: HashMap<usize, Instant>,
    last_error: Option<String>,
    closed: bool,
}

enum Decision {
    Use(Arc<PipelineChannel>),
    /// Nothing usable yet; wake no later than the given instant
    Wait(Option<Instant>),
}

pub(crate) struct GroupShared {
    config: PipelineGroupConfig,
    connector: Arc<dyn ChannelConnector>,
    accounting: Arc<dyn AccountingSink>,
    table: Mutex<Table>,
    changed: Notify,
    icmp_tx: mpsc::Sender<Frame>,
}

impl GroupShared {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a stream on the best channel, waiting up to `open_timeout`
    async fn place(self: &Arc<Self>, target: &str) -> Result<StreamHandle> {
        let deadline = Instant::now() + self.config.open_timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut table = self.lock();
                match self.decide(&mut table)? {
                    Decision::Use(channel) => match channel.open_stream(target) {
                        Ok(handle) => {
                            log::debug!(
                                "Stream {} to {target} placed on channel {}",
                                handle.id(),
                                channel.id()
                            );
                            return Ok(handle);
                        }
                        // Lost a race with the channel failing; decide again
                        Err(e) if e.is_channel_failure() => continue,
                        Err(e) => return Err(e),
                    },
                    Decision::Wait(wake_at) => wake_at,
                }
            };

            let now = Instant::now();
            if now >= deadline {
                let last_error = self.lock().last_error.clone();
                return Err(TunnelError::NoAvailableChannel(match last_error {
                    Some(e) => format!("no channel within {:?}, last error: {e}", self.config.open_timeout),
                    None => format!("no channel within {:?}", self.config.open_timeout),
                }));
            }
            let wake = wake_at.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    fn decide(self: &Arc<Self>, table: &mut Table) -> Result<Decision> {
        if table.closed {
            return Err(TunnelError::ChannelUnavailable("group is shut down".to_string()));
        }
        table.channels.retain(|e| !e.channel.state().is_terminal());

        let least_loaded = least_loaded(&table.channels);
        if let Some((channel, 0)) = &least_loaded {
            return Ok(Decision::Use(channel.clone()));
        }

        let total = table.channels.len() + table.connecting.len();
        if total < self.config.pipeline_count {
            if let Some(endpoint) = self.next_endpoint(table) {
                table.connecting.push(endpoint);
                self.start_connect(endpoint);
            }
            if !table.connecting.is_empty() {
                return Ok(Decision::Wait(self.next_cooldown_expiry(table)));
            }
        }

        Ok(match least_loaded {
            Some((channel, _)) => Decision::Use(channel),
            None => Decision::Wait(self.next_cooldown_expiry(table)),
        })
    }

    /// Round-robin from the cursor, skipping endpoints in cooldown
    fn next_endpoint(&self, table: &mut Table) -> Option<usize> {
        let count = self.config.endpoints.len();
        let now = Instant::now();
        for offset in 0..count {
            let index = (table.cursor + offset) % count;
            let cooling = table
                .last_failure
                .get(&index)
                .is_some_and(|failed| now.duration_since(*failed) < self.config.failure_cooldown);
            if !cooling {
                table.cursor = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }

    fn next_cooldown_expiry(&self, table: &Table) -> Option<Instant> {
        let now = Instant::now();
        table
            .last_failure
            .values()
            .map(|failed| *failed + self.config.failure_cooldown)
            .filter(|expiry| *expiry > now)
            .min()
    }

    fn start_connect(self: &Arc<Self>, endpoint: usize) {
        let shared = self.clone();
        tokio::spawn(async move {
            let descriptor = &shared.config.endpoints[endpoint];
            log::info!("Opening channel to {}", descriptor.label());
            let attempt = tokio::time::timeout(
                descriptor.tcp().connect_timeout(),
                shared
                    .connector
                    .connect(descriptor, shared.config.icmp_proxy_enabled),
            )
            .await;
            let result = attempt.unwrap_or_else(|_| {
                Err(TunnelError::Timeout(format!("connecting to {}", descriptor.label())))
            });
            shared.finish_connect(endpoint, result);
        });
    }

    fn finish_connect(self: &Arc<Self>, endpoint: usize, result: Result<BoxedIo>) {
        let label = self.config.endpoints[endpoint].label();
        {
            let mut table = self.lock();
            if let Some(pos) = table.connecting.iter().position(|e| *e == endpoint) {
                table.connecting.remove(pos);
            }
            match result {
                Ok(_) if table.closed => log::debug!("Group closed while connecting to {label}"),
                Ok(io) => {
                    let mut options =
                        ChannelOptions::new(ChannelRole::Client, self.config.ack_window_size)
                            .with_peer(label)
                            .with_shutdown_wait(self.config.shutdown_wait)
                            .with_accounting(self.accounting.clone());
                    if self.config.icmp_proxy_enabled {
                        options = options.with_icmp_sink(self.icmp_tx.clone());
                    }
                    let channel = Arc::new(PipelineChannel::spawn(io, options));
                    table.last_failure.remove(&endpoint);
                    table.channels.push(ChannelEntry {
                        channel: channel.clone(),
                        endpoint,
                    });
                    monitor(Arc::downgrade(self), channel);
                }
                Err(e) => {
                    log::warn!("Channel to {label} failed to open: {e}");
                    table.last_failure.insert(endpoint, Instant::now());
                    table.last_error = Some(e.to_string());
                }
            }
        }
        self.changed.notify_waiters();
    }

    fn on_channel_closed(&self, channel_id: u64, state: ChannelState) {
        log::debug!("Channel {channel_id} left the group ({state:?})");
        self.lock()
            .channels
            .retain(|e| !e.channel.state().is_terminal());
        self.changed.notify_waiters();
    }

    fn least_loaded_channel(&self) -> Option<Arc<PipelineChannel>> {
        least_loaded(&self.lock().channels).map(|(channel, _)| channel)
    }
}

/// Established channel with the fewest streams; ties go to the oldest
fn least_loaded(channels: &[ChannelEntry]) -> Option<(Arc<PipelineChannel>, usize)> {
    channels
        .iter()
        .filter(|e| e.channel.state() == ChannelState::Established)
        .map(|e| (e.channel.clone(), e.channel.stream_count()))
        .min_by_key(|(_, streams)| *streams)
}

/// Drop the channel from the table once it ends
fn monitor(group: Weak<GroupShared>, channel: Arc<PipelineChannel>) {
    tokio::spawn(async move {
        let state = channel.closed().await;
        if let Some(group) = group.upgrade() {
            group.on_channel_closed(channel.id(), state);
        }
    });
}

/// Load-balanced pool of pipeline channels
pub struct PipelineGroup {
    shared: Arc<GroupShared>,
    icmp_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
}

impl PipelineGroup {
    pub fn new(config: PipelineGroupConfig, connector: Arc<dyn ChannelConnector>) -> Result<Self> {
        Self::with_accounting(config, connector, Arc::new(LogAccounting))
    }

    pub fn with_accounting(
        config: PipelineGroupConfig,
        connector: Arc<dyn ChannelConnector>,
        accounting: Arc<dyn AccountingSink>,
    ) -> Result<Self> {
        config.validate()?;
        let (icmp_tx, icmp_rx) = mpsc::channel(ICMP_QUEUE_DEPTH);
        log::info!(
            "Pipeline group: {} channels, ack window {}, {} endpoints",
            config.pipeline_count,
            config.ack_window_size,
            config.endpoints.len()
        );
        Ok(Self {
            shared: Arc::new(GroupShared {
                config,
                connector,
                accounting,
                table: Mutex::new(Table {
                    channels: Vec::new(),
                    connecting: Vec::new(),
                    cursor: 0,
                    last_failure: HashMap::new(),
                    last_error: None,
                    closed: false,
                }),
                changed: Notify::new(),
                icmp_tx,
            }),
            icmp_rx: Mutex::new(Some(icmp_rx)),
        })
    }

    pub fn config(&self) -> &PipelineGroupConfig {
        &self.shared.config
    }

    /// Open a stream to `target`, placing it on the least-loaded channel
    pub async fn open_stream(&self, target: &str) -> Result<GroupStream> {
        let handle = self.shared.place(target).await?;
        Ok(GroupStream::new(self.shared.clone(), target, handle))
    }

    /// Send an ICMP frame through the least-loaded channel; the channel
    /// assigns its sequence number
    pub async fn send_icmp(&self, frame: Frame) -> Result<()> {
        if frame.frame_type != FrameType::Icmp {
            return Err(TunnelError::InvalidState(format!(
                "{:?} frame on the ICMP path",
                frame.frame_type
            )));
        }
        let channel = self.shared.least_loaded_channel().ok_or_else(|| {
            TunnelError::NoAvailableChannel("no established channel for ICMP".to_string())
        })?;
        channel.send_icmp(frame.payload).await
    }

    /// Inbound ICMP packets from every channel; available once
    pub fn take_icmp_receiver(&self) -> Option<mpsc::Receiver<Frame>> {
        self.icmp_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Connecting slots first, then channels in creation order
    pub fn channel_stats(&self) -> Vec<ChannelStats> {
        let table = self.shared.lock();
        let connecting = table.connecting.iter().map(|endpoint| ChannelStats {
            channel_id: None,
            endpoint: self.shared.config.endpoints[*endpoint].label(),
            state: ChannelState::Connecting,
            streams: 0,
            in_flight: 0,
            peak_in_flight: 0,
        });
        let channels = table.channels.iter().map(|entry| {
            let window = entry.channel.window();
            ChannelStats {
                channel_id: Some(entry.channel.id()),
                endpoint: self.shared.config.endpoints[entry.endpoint].label(),
                state: entry.channel.state(),
                streams: entry.channel.stream_count(),
                in_flight: window.in_flight(),
                peak_in_flight: window.peak_in_flight,
            }
        });
        connecting.chain(channels).collect()
    }

    pub fn channel_states(&self) -> Vec<ChannelState> {
        self.channel_stats().into_iter().map(|s| s.state).collect()
    }

    /// Open streams per channel, in creation order
    pub fn stream_counts(&self) -> Vec<usize> {
        self.channel_stats()
            .into_iter()
            .filter(|s| s.channel_id.is_some())
            .map(|s| s.streams)
            .collect()
    }

    /// Stop placing streams and drain every channel
    pub async fn shutdown(&self) {
        let channels: Vec<Arc<PipelineChannel>> = {
            let mut table = self.shared.lock();
            table.closed = true;
            table.channels.iter().map(|e| e.channel.clone()).collect()
        };
        log::info!("Shutting down pipeline group ({} channels)", channels.len());
        futures::future::join_all(channels.iter().map(|c| c.shutdown())).await;
        self.shared.changed.notify_waiters();
    }
}

impl Drop for PipelineGroup {
    fn drop(&mut self) {
        let mut table = self.shared.lock();
        table.closed = true;
        for entry in &table.channels {
            entry.channel.abort();
        }
    }
}

struct LinkState {
    sender: StreamSender,
    channel_id: u64,
    /// Outbound prefix, kept while the stream is replayable
    replay: BytesMut,
    replayable: bool,
    write_closed: bool,
}

/// State shared by a [`GroupStream`] and its writers
struct StreamLink {
    group: Arc<GroupShared>,
    target: String,
    received_any: AtomicBool,
    state: tokio::sync::Mutex<LinkState>,
}

impl StreamLink {
    async fn send(&self, data: Bytes) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.replayable {
            if self.received_any.load(Ordering::Acquire)
                || state.replay.len() + data.len() > REPLAY_LIMIT
            {
                state.replayable = false;
                state.replay = BytesMut::new();
            } else {
                state.replay.extend_from_slice(&data);
            }
        }

        match state.sender.send(data).await {
            Ok(()) => Ok(()),
            // The receiving side re-places the stream and replays these bytes
            Err(e) if e.is_channel_failure() && state.replayable => Ok(()),
            Err(e) if e.is_channel_failure() => Err(TunnelError::UpstreamUnavailable(format!(
                "stream to {}: {e}",
                self.target
            ))),
            Err(e) => Err(e),
        }
    }

    async fn close_write(&self) {
        let mut state = self.state.lock().await;
        state.write_closed = true;
        state.sender.close_write();
    }
}

/// A stream placed by the group, with one-shot failover
pub struct GroupStream {
    handle: StreamHandle,
    link: Arc<StreamLink>,
}

impl GroupStream {
    fn new(group: Arc<GroupShared>, target: &str, handle: StreamHandle) -> Self {
        let state = LinkState {
            sender: handle.sender(),
            channel_id: handle.channel_id(),
            replay: BytesMut::new(),
            replayable: true,
            write_closed: false,
        };
        Self {
            handle,
            link: Arc::new(StreamLink {
                group,
                target: target.to_string(),
                received_any: AtomicBool::new(false),
                state: tokio::sync::Mutex::new(state),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.link.target
    }

    /// Channel currently carrying the stream
    pub fn channel_id(&self) -> u64 {
        self.handle.channel_id()
    }

    /// Writing half for a separate upload task
    pub fn writer(&self) -> GroupStreamWriter {
        GroupStreamWriter {
            link: self.link.clone(),
        }
    }

    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.link.send(data).await
    }

    pub async fn close_write(&self) {
        self.link.close_write().await;
    }

    /// Next inbound chunk; `Ok(None)` once the remote side closed
    ///
    /// A channel failure is absorbed here when the stream is still
    /// replayable. Reading must run concurrently with writing, since writes
    /// that hit a failed channel rely on it.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.handle.recv().await {
                Some(StreamEvent::Data(bytes)) => {
                    self.link.received_any.store(true, Ordering::Release);
                    return Ok(Some(bytes));
                }
                Some(StreamEvent::Close) | None => return Ok(None),
                Some(StreamEvent::Failed(reason)) => self.fail_over(reason).await?,
            }
        }
    }

    async fn fail_over(&mut self, reason: String) -> Result<()> {
        let mut state = self.link.state.lock().await;
        let target = &self.link.target;
        if !state.replayable || self.link.received_any.load(Ordering::Acquire) {
            return Err(TunnelError::UpstreamUnavailable(format!(
                "stream to {target} lost with channel {}: {reason}",
                state.channel_id
            )));
        }
        // One retry only
        state.replayable = false;
        log::warn!(
            "Channel {} failed under stream to {target}, re-placing ({} bytes to replay): {reason}",
            state.channel_id,
            state.replay.len()
        );

        let handle = self
            .link
            .group
            .place(target)
            .await
            .map_err(|e| TunnelError::UpstreamUnavailable(format!("stream to {target}: {e}")))?;
        let sender = handle.sender();
        let replay = std::mem::take(&mut state.replay).freeze();
        if !replay.is_empty() {
            sender
                .send(replay)
                .await
                .map_err(|e| TunnelError::UpstreamUnavailable(format!("stream to {target}: {e}")))?;
        }
        if state.write_closed {
            sender.close_write();
        }
        state.channel_id = handle.channel_id();
        state.sender = sender;
        self.handle = handle;
        Ok(())
    }
}

impl std::fmt::Debug for GroupStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupStream")
            .field("target", &self.link.target)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Writing half of a [`GroupStream`]
#[derive(Clone)]
pub struct GroupStreamWriter {
    link: Arc<StreamLink>,
}

impl GroupStreamWriter {
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.link.send(data).await
    }

    pub async fn close_write(&self) {
        self.link.close_write().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{endpoint, wait_until, MockConnector};

    fn config(count: usize, window: u32, ports: &[u16]) -> PipelineGroupConfig {
        PipelineGroupConfig::new(count, window, ports.iter().map(|p| endpoint(*p)).collect())
            .with_open_timeout(Duration::from_secs(2))
    }

    async fn echo(stream: &mut GroupStream, payload: &'static [u8]) -> Vec<u8> {
        stream.send(Bytes::from_static(payload)).await.unwrap();
        stream.close_write().await;
        let mut received = Vec::new();
        while let Some(chunk) = stream.recv().await.unwrap() {
            received.extend_from_slice(&chunk);
        }
        received
    }

    #[test]
    fn test_config_defaults() {
        let config = PipelineGroupConfig::new(2, 8, vec![endpoint(1)]);
        assert_eq!(config.failure_cooldown, Duration::from_secs(30));
        assert_eq!(config.open_timeout, endpoint(1).tcp().connect_timeout());
        assert!(PipelineGroupConfig::new(0, 8, vec![endpoint(1)]).validate().is_err());
        assert!(PipelineGroupConfig::new(1, 0, vec![endpoint(1)]).validate().is_err());
        assert!(PipelineGroupConfig::new(1, 8, Vec::new()).validate().is_err());
    }

    #[tokio::test]
    async fn test_echo_through_group() {
        let group = PipelineGroup::new(config(1, 4, &[1]), MockConnector::new()).unwrap();
        let mut stream = group.open_stream("example.com:80").await.unwrap();
        assert_eq!(echo(&mut stream, b"ping").await, b"ping");
    }

    #[tokio::test]
    async fn test_ten_streams_spread_over_two_channels() {
        let connector = MockConnector::new();
        let group = PipelineGroup::new(config(2, 4, &[1, 2]), connector.clone()).unwrap();

        let mut streams = Vec::new();
        for i in 0..10 {
            let stream = group.open_stream(&format!("host{i}:80")).await.unwrap();
            for _ in 0..6 {
                stream.send(Bytes::from_static(b"chunk")).await.unwrap();
            }
            streams.push(stream);
        }

        assert_eq!(group.stream_counts(), vec![5, 5]);
        assert_eq!(
            group.channel_states(),
            vec![ChannelState::Established, ChannelState::Established]
        );
        assert_eq!(connector.attempts(), vec![1, 2]);
        for stats in group.channel_stats() {
            assert!(stats.peak_in_flight <= 4);
            assert!(stats.in_flight <= 4);
        }
    }

    #[tokio::test]
    async fn test_idle_channel_preferred_over_busy() {
        let group = PipelineGroup::new(config(2, 4, &[1, 2]), MockConnector::new()).unwrap();
        let first = group.open_stream("a:1").await.unwrap();
        let second = group.open_stream("b:1").await.unwrap();
        let third = group.open_stream("c:1").await.unwrap();
        assert_ne!(first.channel_id(), second.channel_id());
        // Tie goes to the oldest channel
        assert_eq!(third.channel_id(), first.channel_id());

        let emptied = second.channel_id();
        drop(second);
        let fourth = group.open_stream("d:1").await.unwrap();
        assert_eq!(fourth.channel_id(), emptied);
    }

    #[tokio::test]
    async fn test_failing_endpoints_are_skipped_and_cooled_down() {
        let connector = MockConnector::failing(&[1, 2]);
        let group = PipelineGroup::new(config(1, 4, &[1, 2, 3]), connector.clone()).unwrap();

        let stream = group.open_stream("a:1").await.unwrap();
        assert_eq!(connector.attempts(), vec![1, 2, 3]);
        drop(stream);

        connector.kill(3);
        wait_until(|| group.channel_states().is_empty()).await;

        // 1 and 2 are still cooling down, so 3 is tried again
        let _stream = group.open_stream("b:1").await.unwrap();
        assert_eq!(connector.attempts(), vec![1, 2, 3, 3]);
    }

    #[tokio::test]
    async fn test_failover_replays_prefix() {
        let connector = MockConnector::failing(&[1]);
        let group = PipelineGroup::new(config(1, 4, &[1, 2, 3]), connector.clone()).unwrap();

        let mut stream = group.open_stream("a:1").await.unwrap();
        let first_channel = stream.channel_id();
        stream.send(Bytes::from_static(b"hello ")).await.unwrap();
        stream.send(Bytes::from_static(b"world")).await.unwrap();

        connector.kill(2);
        stream.close_write().await;
        let mut received = Vec::new();
        while let Some(chunk) = stream.recv().await.unwrap() {
            received.extend_from_slice(&chunk);
        }

        assert_eq!(received, b"hello world");
        assert_ne!(stream.channel_id(), first_channel);
        assert_eq!(connector.attempts(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_second_failure_reaches_caller() {
        let connector = MockConnector::new();
        let group = PipelineGroup::new(config(1, 4, &[1, 2]), connector.clone()).unwrap();

        let mut stream = group.open_stream("a:1").await.unwrap();
        stream.send(Bytes::from_static(b"x")).await.unwrap();

        connector.kill(1);
        let recv = tokio::spawn(async move { stream.recv().await });
        wait_until(|| connector.attempts().len() == 2).await;
        wait_until(|| group.channel_states() == vec![ChannelState::Established]).await;
        wait_until(|| group.stream_counts() == vec![1]).await;
        connector.kill(2);

        let result = recv.await.unwrap();
        assert!(matches!(result, Err(TunnelError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn test_no_failover_after_inbound_data() {
        let connector = MockConnector::new();
        let group = PipelineGroup::new(config(1, 4, &[1, 2]), connector.clone()).unwrap();

        let mut stream = group.open_stream("a:1").await.unwrap();
        stream.send(Bytes::from_static(b"abc")).await.unwrap();
        stream.close_write().await;
        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from_static(b"abc")));

        // Close already seen, so the stream ends cleanly despite the kill
        connector.kill(1);
        assert_eq!(stream.recv().await.unwrap(), None);
        assert_eq!(connector.attempts(), vec![1]);
    }

    #[tokio::test]
    async fn test_no_available_channel() {
        let connector = MockConnector::failing(&[1, 2]);
        let group = PipelineGroup::new(
            config(2, 4, &[1, 2]).with_open_timeout(Duration::from_millis(200)),
            connector,
        )
        .unwrap();
        let result = group.open_stream("a:1").await;
        assert!(matches!(result, Err(TunnelError::NoAvailableChannel(_))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels() {
        let group = PipelineGroup::new(
            config(1, 4, &[1]).with_shutdown_wait(Duration::from_millis(50)),
            MockConnector::new(),
        )
        .unwrap();
        let stream = group.open_stream("a:1").await.unwrap();
        drop(stream);

        group.shutdown().await;
        assert!(group
            .channel_states()
            .iter()
            .all(|state| state.is_terminal()));
        assert!(group.open_stream("b:1").await.is_err());
    }

    #[tokio::test]
    async fn test_icmp_without_channel() {
        let group = PipelineGroup::new(config(1, 4, &[1]), MockConnector::new()).unwrap();
        assert!(group.take_icmp_receiver().is_some());
        assert!(group.take_icmp_receiver().is_none());
        assert!(matches!(
            group.send_icmp(Frame::icmp(0, Bytes::from_static(&[8, 0]))).await,
            Err(TunnelError::NoAvailableChannel(_))
        ));
        assert!(matches!(
            group.send_icmp(Frame::close(1)).await,
            Err(TunnelError::InvalidState(_))
        ));
    }
}
