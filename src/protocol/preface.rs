//! Channel preface and authentication
//!
//! Right after the TLS handshake the client sends, once per channel:
//! ```text
//! <64 lowercase hex chars: SHA-256(password)> CR LF <version u8> <flags u8>
//! ```
//! The server checks the credential with an [`Authenticator`] before any
//! frame is exchanged.

use crate::crypto::{credential_digest, DIGEST_LEN};
use crate::error::{Result, TunnelError};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Version of the framing protocol spoken after the preface
pub const PROTOCOL_VERSION: u8 = 1;

/// Flag bit: the client wants the ICMP sub-channel
pub const FLAG_ICMP: u8 = 0x01;

const CREDENTIAL_LEN: usize = DIGEST_LEN * 2;

/// Total preface length on the wire
pub const PREFACE_LEN: usize = CREDENTIAL_LEN + 2 + 2;

/// First bytes of every channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preface {
    pub credential: String,
    pub icmp: bool,
}

impl Preface {
    pub fn new(credential: impl Into<String>, icmp: bool) -> Self {
        Self {
            credential: credential.into(),
            icmp,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PREFACE_LEN);
        buf.extend_from_slice(self.credential.as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(if self.icmp { FLAG_ICMP } else { 0 });
        buf.freeze()
    }

    /// Parse a preface; any deviation is a handshake failure
    pub fn decode(raw: &[u8; PREFACE_LEN]) -> Result<Self> {
        let (credential, rest) = raw.split_at(CREDENTIAL_LEN);
        if !credential
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
        {
            return Err(TunnelError::Handshake("malformed credential".to_string()));
        }
        if &rest[..2] != b"\r\n" {
            return Err(TunnelError::Handshake("missing preface terminator".to_string()));
        }
        if rest[2] != PROTOCOL_VERSION {
            return Err(TunnelError::Handshake(format!(
                "unsupported protocol version {}",
                rest[2]
            )));
        }
        Ok(Self {
            credential: String::from_utf8_lossy(credential).into_owned(),
            icmp: rest[3] & FLAG_ICMP != 0,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut raw = [0u8; PREFACE_LEN];
        reader.read_exact(&mut raw).await?;
        Self::decode(&raw)
    }
}

/// Decides whether a presented credential may open a channel
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credential: &str) -> bool;
}

/// Accepts the digests of a fixed set of passwords
#[derive(Debug, Clone, Default)]
pub struct PasswordAuthenticator {
    digests: HashSet<String>,
}

impl PasswordAuthenticator {
    pub fn new<S: AsRef<str>>(passwords: &[S]) -> Self {
        Self {
            digests: passwords
                .iter()
                .map(|p| credential_digest(p.as_ref()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

impl Authenticator for PasswordAuthenticator {
    fn authenticate(&self, credential: &str) -> bool {
        self.digests.contains(credential)
    }
}
