//! Upstream endpoint descriptors and their identity hash
//!
//! An [`EndpointDescriptor`] is the immutable description of one load
//! balance candidate. Two descriptors are interchangeable exactly when their
//! [`IdentityHash`] matches; the hash is computed once, at construction,
//! over a canonical TOML rendering of every other field.

use crate::config::{SslPolicy, TcpPolicy};
use crate::crypto::{credential_digest, sha256, DIGEST_LEN};
use crate::error::{Result, TunnelError};
use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Stable digest identifying an endpoint configuration
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityHash([u8; DIGEST_LEN]);

impl IdentityHash {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        write!(f, "IdentityHash({})", &hex::encode(self.0)[..12])
    }
}

/// Fields covered by the identity hash, in canonical order
#[derive(Serialize)]
struct IdentityFields<'a> {
    address: &'a str,
    port: u16,
    credential: &'a str,
    ssl: &'a SslPolicy,
    tcp: &'a TcpPolicy,
}

/// One upstream target: address, credential and connection policies
#[derive(Clone)]
pub struct EndpointDescriptor {
    address: String,
    port: u16,
    credential: String,
    ssl: SslPolicy,
    tcp: TcpPolicy,
    identity_hash: IdentityHash,
}

impl EndpointDescriptor {
    /// Build a descriptor; the password is kept only as its digest
    pub fn new(
        address: impl Into<String>,
        port: u16,
        password: &str,
        ssl: SslPolicy,
        tcp: TcpPolicy,
    ) -> Result<Self> {
        let address = address.into();
        let credential = credential_digest(password);

        let canonical = toml::to_string(&IdentityFields {
            address: &address,
            port,
            credential: &credential,
            ssl: &ssl,
            tcp: &tcp,
        })
        .map_err(|e| TunnelError::Config(format!("Cannot serialize endpoint {address}: {e}")))?;
        let identity_hash = IdentityHash(sha256(canonical.as_bytes()));

        Ok(Self {
            address,
            port,
            credential,
            ssl,
            tcp,
            identity_hash,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hex digest sent in the channel preface
    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn ssl(&self) -> &SslPolicy {
        &self.ssl
    }

    pub fn tcp(&self) -> &TcpPolicy {
        &self.tcp
    }

    pub fn identity_hash(&self) -> IdentityHash {
        self.identity_hash
    }

    /// Name presented in SNI and checked against the certificate
    pub fn server_name(&self) -> &str {
        if self.ssl.sni.is_empty() {
            &self.address
        } else {
            &self.ssl.sni
        }
    }

    /// `address:port`, for logs
    pub fn label(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl PartialEq for EndpointDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.identity_hash == other.identity_hash
    }
}

impl Eq for EndpointDescriptor {}

impl Hash for EndpointDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity_hash.hash(state);
    }
}

impl fmt::Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("identity_hash", &self.identity_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};

    fn descriptor(ssl: SslPolicy) -> EndpointDescriptor {
        EndpointDescriptor::new("vpn.example.com", 443, "secret", ssl, TcpPolicy::default())
            .unwrap()
    }

    #[test]
    fn test_identical_fields_hash_equal() {
        let a = descriptor(SslPolicy::default());
        let b = descriptor(SslPolicy::default());
        assert_eq!(a.identity_hash(), b.identity_hash());
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_map_insertion_order_is_irrelevant() {
        let mut first = SslPolicy::default();
        first.alpn_port_overrides.insert("h2".into(), 8080);
        first.alpn_port_overrides.insert("http/1.1".into(), 8081);

        let mut reversed = BTreeMap::new();
        reversed.insert("http/1.1".to_string(), 8081);
        reversed.insert("h2".to_string(), 8080);
        let second = SslPolicy {
            alpn_port_overrides: reversed,
            ..SslPolicy::default()
        };

        assert_eq!(descriptor(first), descriptor(second));
    }

    #[test]
    fn test_whitespace_is_significant() {
        let plain = SslPolicy {
            sni: "www.example.com".into(),
            ..SslPolicy::default()
        };
        let padded = SslPolicy {
            sni: "www.example.com ".into(),
            ..SslPolicy::default()
        };
        assert_ne!(descriptor(plain), descriptor(padded));
    }

    #[test]
    fn test_every_field_participates() {
        let base = descriptor(SslPolicy::default());

        let other_password =
            EndpointDescriptor::new("vpn.example.com", 443, "other", SslPolicy::default(), TcpPolicy::default())
                .unwrap();
        assert_ne!(base, other_password);

        let other_port =
            EndpointDescriptor::new("vpn.example.com", 8443, "secret", SslPolicy::default(), TcpPolicy::default())
                .unwrap();
        assert_ne!(base, other_port);

        let tcp = TcpPolicy {
            no_delay: false,
            ..TcpPolicy::default()
        };
        let other_tcp =
            EndpointDescriptor::new("vpn.example.com", 443, "secret", SslPolicy::default(), tcp).unwrap();
        assert_ne!(base, other_tcp);
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let a = descriptor(SslPolicy::default());
        let rendered = a.identity_hash().to_string();
        assert_eq!(rendered.len(), 64);
        assert_eq!(rendered, descriptor(SslPolicy::default()).identity_hash().to_string());
    }

    #[test]
    fn test_server_name_falls_back_to_address() {
        assert_eq!(descriptor(SslPolicy::default()).server_name(), "vpn.example.com");
        let ssl = SslPolicy {
            sni: "cdn.example.net".into(),
            ..SslPolicy::default()
        };
        assert_eq!(descriptor(ssl).server_name(), "cdn.example.net");
    }
}
