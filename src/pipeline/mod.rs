//! Stream multiplexing over a pool of TLS channels
//!
//! A [`PipelineChannel`] carries many logical streams over one transport,
//! with sequence numbers and a sliding acknowledgement window shared by all
//! of them. A [`PipelineGroup`] keeps up to `pipeline_count` channels open
//! across the configured endpoints, places each new stream on the
//! least-loaded one and replays a stream onto another channel when its
//! channel dies before any reply arrived. [`PipelineAcceptor`] is the server
//! half.

mod channel;
mod connector;
mod group;
mod relay;
mod server;
mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelOptions, ChannelRole, ChannelState, PipelineChannel, WindowSnapshot};
pub use connector::{BoxedIo, ChannelConnector, ChannelIo, HandshakeStats, TlsChannelConnector};
pub use group::{
    ChannelStats, GroupStream, GroupStreamWriter, PipelineGroup, PipelineGroupConfig, REPLAY_LIMIT,
};
pub use relay::{relay_client, relay_stream, relay_to_target, RelayStats};
pub use server::{
    bind_listener, tune_accepted, Accepted, IcmpReply, InboundIcmp, PipelineAcceptor,
    ServerSettings,
};
pub use stream::{LogicalStream, StreamEvent, StreamHandle, StreamSender, StreamState};
