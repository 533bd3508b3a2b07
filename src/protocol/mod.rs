//! Pipeline wire protocol
//!
//! Provides:
//! - The authentication preface sent once per channel
//! - Frame encoding/decoding
//! - Sliding acknowledgement window accounting

mod frame;
mod preface;
mod window;

pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, ICMP_STREAM_ID, MAX_PAYLOAD_SIZE};
pub use preface::{
    Authenticator, PasswordAuthenticator, Preface, FLAG_ICMP, PREFACE_LEN, PROTOCOL_VERSION,
};
pub use window::{FlowWindow, ReceiveTracker};

/// First stream id used by the client; client ids stay odd
pub const CLIENT_FIRST_STREAM_ID: u32 = 1;

/// First stream id used by the server; server ids stay even
pub const SERVER_FIRST_STREAM_ID: u32 = 2;
