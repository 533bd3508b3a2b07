//! Process-wide TLS session resumption cache
//!
//! One [`SessionCache`] is created at startup and handed to the
//! [`TlsContextBuilder`](super::tls::TlsContextBuilder). Each endpoint owns a
//! slot keyed by its identity hash; [`EndpointSessionStore`] plugs that slot
//! into rustls as a `ClientSessionStore`.

use crate::endpoint::IdentityHash;
use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;
use rustls::NamedGroup;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// TLS 1.3 tickets kept per endpoint
const MAX_TLS13_TICKETS: usize = 8;

/// Everything rustls needs to resume a session with one endpoint
#[derive(Debug, Clone, Default)]
pub struct SessionBlob {
    /// Key exchange group the server accepted last time
    pub kx_hint: Option<NamedGroup>,
    /// TLS 1.2 session (ID or ticket)
    pub tls12: Option<Tls12ClientSessionValue>,
    /// TLS 1.3 tickets, newest last; each is single-use
    pub tls13: VecDeque<Arc<Tls13ClientSessionValue>>,
}

impl SessionBlob {
    /// Whether the blob can resume a handshake at all
    pub fn is_resumable(&self) -> bool {
        self.tls12.is_some() || !self.tls13.is_empty()
    }
}

#[derive(Debug)]
struct Entry {
    blob: SessionBlob,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Thread-safe map from endpoint identity to resumption state
#[derive(Debug, Default)]
pub struct SessionCache {
    entries: RwLock<HashMap<IdentityHash, Entry>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the live blob for an endpoint; expired blobs are never
    /// returned
    pub fn get(&self, identity: &IdentityHash) -> Option<SessionBlob> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(identity)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.blob.clone())
    }

    /// Store a blob, replacing whatever was there
    pub fn put(&self, identity: IdentityHash, blob: SessionBlob, ttl: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            identity,
            Entry {
                blob,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every expired entry, returning how many were removed
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let evicted = before - entries.len();
        if evicted > 0 {
            log::debug!("Evicted {evicted} expired TLS sessions");
        }
        evicted
    }

    /// Number of entries, expired ones included until evicted
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-modify-write of one slot under the write lock
    ///
    /// An expired entry is treated as empty. A fresh write restarts the TTL.
    fn update(&self, identity: IdentityHash, ttl: Duration, f: impl FnOnce(&mut SessionBlob)) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(identity).or_insert_with(|| Entry {
            blob: SessionBlob::default(),
            expires_at: now,
        });
        if !entry.is_live(now) {
            entry.blob = SessionBlob::default();
        }
        f(&mut entry.blob);
        entry.expires_at = now + ttl;
    }

    /// Remove and return the newest live TLS 1.3 ticket
    fn take_tls13(&self, identity: &IdentityHash) -> Option<Tls13ClientSessionValue> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(identity).filter(|e| e.is_live(now))?;
        let ticket = entry.blob.tls13.pop_back()?;
        // A snapshot handed out by `get` may still share the ticket
        Arc::try_unwrap(ticket).ok()
    }

    fn read_slot<T>(&self, identity: &IdentityHash, f: impl FnOnce(&SessionBlob) -> Option<T>) -> Option<T> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(identity)
            .filter(|entry| entry.is_live(Instant::now()))
            .and_then(|entry| f(&entry.blob))
    }
}

/// rustls session store bound to one endpoint's slot in the cache
#[derive(Debug)]
pub struct EndpointSessionStore {
    cache: Arc<SessionCache>,
    identity: IdentityHash,
    ttl: Duration,
}

impl EndpointSessionStore {
    pub fn new(cache: Arc<SessionCache>, identity: IdentityHash, ttl: Duration) -> Self {
        Self {
            cache,
            identity,
            ttl,
        }
    }
}

// Every store serves exactly one endpoint, so the server name is not part of the key.
impl ClientSessionStore for EndpointSessionStore {
    fn set_kx_hint(&self, _server_name: ServerName<'static>, group: NamedGroup) {
        self.cache
            .update(self.identity, self.ttl, |blob| blob.kx_hint = Some(group));
    }

    fn kx_hint(&self, _server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.cache.read_slot(&self.identity, |blob| blob.kx_hint)
    }

    fn set_tls12_session(&self, _server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        log::trace!("Caching TLS 1.2 session for {}", self.identity);
        self.cache
            .update(self.identity, self.ttl, |blob| blob.tls12 = Some(value));
    }

    fn tls12_session(&self, _server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.cache
            .read_slot(&self.identity, |blob| blob.tls12.clone())
    }

    fn remove_tls12_session(&self, _server_name: &ServerName<'static>) {
        self.cache
            .update(self.identity, self.ttl, |blob| blob.tls12 = None);
    }

    fn insert_tls13_ticket(&self, _server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        log::trace!("Caching TLS 1.3 ticket for {}", self.identity);
        self.cache.update(self.identity, self.ttl, |blob| {
            if blob.tls13.len() == MAX_TLS13_TICKETS {
                blob.tls13.pop_front();
            }
            blob.tls13.push_back(Arc::new(value));
        });
    }

    fn take_tls13_ticket(&self, _server_name: &ServerName<'static>) -> Option<Tls13ClientSessionValue> {
        self.cache.take_tls13(&self.identity)
    }
}
