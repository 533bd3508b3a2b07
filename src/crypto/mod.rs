//! Cryptographic primitives shared by the TLS layer and the identity hash
//!
//! Both backends are selectable through cargo features; when both are
//! enabled ring wins (for CI `--all-features`).

use crate::error::{Result, TunnelError};
use rustls::crypto::CryptoProvider;
use rustls::server::ProducesTickets;
use std::sync::Arc;

#[cfg(feature = "ring-crypto")]
use ring::digest;

#[cfg(all(feature = "aws-lc-crypto", not(feature = "ring-crypto")))]
use aws_lc_rs::digest;

pub mod session_cache;
pub mod tls;

/// Length of a SHA-256 digest in bytes
pub const DIGEST_LEN: usize = 32;

/// The rustls provider for the enabled backend
pub fn provider() -> CryptoProvider {
    #[cfg(feature = "ring-crypto")]
    {
        rustls::crypto::ring::default_provider()
    }

    #[cfg(all(feature = "aws-lc-crypto", not(feature = "ring-crypto")))]
    {
        rustls::crypto::aws_lc_rs::default_provider()
    }
}

/// Session ticket encrypter for the server role
pub fn ticketer() -> Result<Arc<dyn ProducesTickets>> {
    #[cfg(feature = "ring-crypto")]
    let ticketer = rustls::crypto::ring::Ticketer::new();

    #[cfg(all(feature = "aws-lc-crypto", not(feature = "ring-crypto")))]
    let ticketer = rustls::crypto::aws_lc_rs::Ticketer::new();

    ticketer.map_err(|e| TunnelError::Tls(format!("Failed to create session ticketer: {e}")))
}

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; DIGEST_LEN] {
    let hash = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(hash.as_ref());
    out
}

/// The credential a client presents in its preface: lowercase hex SHA-256
/// of the password
pub fn credential_digest(password: &str) -> String {
    hex::encode(sha256(password.as_bytes()))
}
