//! camotun - TLS-camouflaged pipeline tunnel
//!
//! A client accepts local TCP connections and forwards each one as a logical
//! stream through a small pool of long-lived TLS channels to a server, which
//! opens the stream's target and relays bytes both ways. Streams share each
//! channel's sequence space and acknowledgement window; the pool spreads
//! streams over several endpoints and fails a stream over to another channel
//! when that is still safe. A server hides behind a canned HTTP response for
//! anything that is not an authenticated client.
//!
//! ## Layout
//! - [`config`]: TOML configuration and conversion into core value types
//! - [`endpoint`]: one upstream candidate and its identity hash
//! - [`crypto`]: rustls contexts, policies and the client session cache
//! - [`protocol`]: preface, frame codec and acknowledgement window
//! - [`pipeline`]: channels, the load-balanced group and the acceptor
//! - [`tunnel`]: packet device abstraction and the ICMP relay
//! - [`accounting`]: lifecycle events for external bookkeeping

pub mod accounting;
pub mod config;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod tunnel;

pub use config::{Config, RunType};
pub use endpoint::EndpointDescriptor;
pub use error::{Result, TunnelError};
pub use pipeline::{
    GroupStream, PipelineAcceptor, PipelineChannel, PipelineGroup, PipelineGroupConfig,
    ServerSettings, StreamHandle,
};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
