//! TLS context construction for both tunnel roles
//!
//! [`TlsContextBuilder`] turns an [`SslPolicy`] (or a whole
//! [`EndpointDescriptor`]) into ready rustls configurations. Everything that
//! can be wrong with a policy is rejected here, at build time, rather than
//! during a handshake.

use super::session_cache::{EndpointSessionStore, SessionCache};
use crate::config::SslPolicy;
use crate::endpoint::EndpointDescriptor;
use crate::error::{Result, TunnelError};
use bytes::Bytes;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{Resumption, Tls12Resumption, WebPkiServerVerifier};
use rustls::crypto::{CryptoProvider, SupportedKxGroup};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::{NoServerSessionStorage, ServerSessionMemoryCache};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    SupportedCipherSuite, SupportedProtocolVersion,
};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Sessions remembered by the server-side session-ID store
const SERVER_SESSION_CAPACITY: usize = 1024;

const DH_PARAMS_HEADER: &str = "-----BEGIN DH PARAMETERS-----";

/// Which side of the handshake a context is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// Decision taken for an accepted connection once ALPN is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnRoute {
    /// Carry on with the tunnel protocol
    Continue,
    /// Hand the connection to `127.0.0.1:port` untouched
    Redirect(u16),
}

type RouteFn = dyn Fn(Option<&[u8]>) -> AlpnRoute + Send + Sync;

/// Post-handshake, pre-data routing hook driven by the negotiated ALPN
#[derive(Clone)]
pub struct ConnectionRouter {
    route: Arc<RouteFn>,
}

impl ConnectionRouter {
    /// Route by the `alpn_port_overrides` table
    pub fn from_overrides(overrides: BTreeMap<String, u16>) -> Self {
        Self::custom(move |alpn| {
            alpn.and_then(|proto| std::str::from_utf8(proto).ok())
                .and_then(|proto| overrides.get(proto))
                .map_or(AlpnRoute::Continue, |port| AlpnRoute::Redirect(*port))
        })
    }

    pub fn custom(route: impl Fn(Option<&[u8]>) -> AlpnRoute + Send + Sync + 'static) -> Self {
        Self {
            route: Arc::new(route),
        }
    }

    /// Never redirects
    pub fn passthrough() -> Self {
        Self::custom(|_| AlpnRoute::Continue)
    }

    pub fn route(&self, negotiated_alpn: Option<&[u8]>) -> AlpnRoute {
        (self.route)(negotiated_alpn)
    }
}

impl std::fmt::Debug for ConnectionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectionRouter")
    }
}

/// Client side context for one endpoint
#[derive(Debug, Clone)]
pub struct ClientTlsContext {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    resumption: bool,
}

impl ClientTlsContext {
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    /// Whether handshakes through this context consult the session cache
    pub fn resumption_enabled(&self) -> bool {
        self.resumption
    }
}

/// Server side context: rustls config, camouflage payload and ALPN router
#[derive(Debug, Clone)]
pub struct ServerTlsContext {
    config: Arc<ServerConfig>,
    camouflage: Bytes,
    router: ConnectionRouter,
}

impl ServerTlsContext {
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Canned bytes served to peers that fail TLS or authentication; may be empty
    pub fn camouflage_response(&self) -> &Bytes {
        &self.camouflage
    }

    pub fn router(&self) -> &ConnectionRouter {
        &self.router
    }

    /// Replace the ALPN router (the default follows `alpn_port_overrides`)
    pub fn with_router(mut self, router: ConnectionRouter) -> Self {
        self.router = router;
        self
    }
}

/// A built context for either role
#[derive(Debug, Clone)]
pub enum TlsContext {
    Client(ClientTlsContext),
    Server(ServerTlsContext),
}

/// Cipher suites, groups and versions a policy resolves to
struct Selection {
    cipher_suites: Vec<SupportedCipherSuite>,
    kx_groups: Vec<&'static dyn SupportedKxGroup>,
    versions: Vec<&'static SupportedProtocolVersion>,
}

impl Selection {
    fn provider(&self) -> Arc<CryptoProvider> {
        Arc::new(CryptoProvider {
            cipher_suites: self.cipher_suites.clone(),
            kx_groups: self.kx_groups.clone(),
            ..super::provider()
        })
    }
}

/// Builds TLS contexts; holds the process-wide session cache
#[derive(Debug, Clone)]
pub struct TlsContextBuilder {
    sessions: Arc<SessionCache>,
}

impl TlsContextBuilder {
    pub fn new(sessions: Arc<SessionCache>) -> Self {
        Self { sessions }
    }

    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    /// Build a context for `endpoint` in the given role
    pub fn build(&self, endpoint: &EndpointDescriptor, role: TlsRole) -> Result<TlsContext> {
        match role {
            TlsRole::Client => self.build_client(endpoint).map(TlsContext::Client),
            TlsRole::Server => self.build_server(endpoint.ssl()).map(TlsContext::Server),
        }
    }

    /// Client context; resumption state lives under the endpoint's identity hash
    pub fn build_client(&self, endpoint: &EndpointDescriptor) -> Result<ClientTlsContext> {
        let ssl = endpoint.ssl();
        let selection = resolve_policy(ssl)?;
        let provider = selection.provider();

        let verifier: Arc<dyn ServerCertVerifier> = if ssl.verify_peer {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            if !ssl.cert_path.is_empty() {
                let (added, ignored) = roots.add_parsable_certificates(load_certs(&ssl.cert_path)?);
                log::debug!("Added {added} trust anchors from {} ({ignored} ignored)", ssl.cert_path);
            }
            let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| TunnelError::Config(format!("Cannot build certificate verifier: {e}")))?;
            if ssl.verify_hostname {
                webpki
            } else {
                Arc::new(NoHostnameVerifier { inner: webpki })
            }
        } else {
            log::warn!("Certificate verification disabled for {}", endpoint.label());
            Arc::new(AcceptAllVerifier::new(&provider))
        };

        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&selection.versions)
            .map_err(|e| TunnelError::Config(format!("Inconsistent TLS policy: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let mut config = if !ssl.key_path.is_empty() {
            if ssl.cert_path.is_empty() {
                return Err(TunnelError::Config(
                    "Client key_path requires cert_path".to_string(),
                ));
            }
            let chain = load_certs(&ssl.cert_path)?;
            let key = load_private_key(ssl)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| TunnelError::Credential(format!("Client certificate rejected: {e}")))?
        } else {
            builder.with_no_client_auth()
        };

        config.alpn_protocols = alpn_wire(ssl);
        config.resumption = if ssl.reuse_session {
            let store = EndpointSessionStore::new(
                self.sessions.clone(),
                endpoint.identity_hash(),
                ssl.session_timeout(),
            );
            let tls12 = if ssl.session_ticket_enabled {
                Tls12Resumption::SessionIdOrTickets
            } else {
                Tls12Resumption::SessionIdOnly
            };
            Resumption::store(Arc::new(store)).tls12_resumption(tls12)
        } else {
            Resumption::disabled()
        };

        let server_name = ServerName::try_from(endpoint.server_name().to_string()).map_err(|e| {
            TunnelError::Config(format!("Invalid server name {}: {e}", endpoint.server_name()))
        })?;

        log::debug!(
            "Built client TLS context for {} ({} suites, resumption {})",
            endpoint.label(),
            selection.cipher_suites.len(),
            ssl.reuse_session
        );

        Ok(ClientTlsContext {
            config: Arc::new(config),
            server_name,
            resumption: ssl.reuse_session,
        })
    }

    /// Server context: certificate, key, session policy and camouflage payload
    pub fn build_server(&self, ssl: &SslPolicy) -> Result<ServerTlsContext> {
        let selection = resolve_policy(ssl)?;
        if ssl.cert_path.is_empty() || ssl.key_path.is_empty() {
            return Err(TunnelError::Credential(
                "Server role requires cert_path and key_path".to_string(),
            ));
        }
        let chain = load_certs(&ssl.cert_path)?;
        let key = load_private_key(ssl)?;

        let mut config = ServerConfig::builder_with_provider(selection.provider())
            .with_protocol_versions(&selection.versions)
            .map_err(|e| TunnelError::Config(format!("Inconsistent TLS policy: {e}")))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| TunnelError::Credential(format!("Certificate/key rejected: {e}")))?;

        config.ignore_client_order = ssl.prefer_server_cipher;
        config.alpn_protocols = alpn_wire(ssl);
        config.session_storage = if ssl.reuse_session {
            ServerSessionMemoryCache::new(SERVER_SESSION_CAPACITY)
        } else {
            Arc::new(NoServerSessionStorage {})
        };
        if ssl.session_ticket_enabled {
            config.ticketer = super::ticketer()?;
        }
        if !ssl.reuse_session && !ssl.session_ticket_enabled {
            config.send_tls13_tickets = 0;
        }

        let camouflage = load_camouflage(&ssl.camouflage_http_response)?;
        if camouflage.is_empty() {
            log::warn!("No camouflage response configured; failed peers see a bare close");
        }

        Ok(ServerTlsContext {
            config: Arc::new(config),
            camouflage,
            router: ConnectionRouter::from_overrides(ssl.alpn_port_overrides.clone()),
        })
    }
}

/// Check a policy for structural errors and resolve its suites and groups
fn resolve_policy(ssl: &SslPolicy) -> Result<Selection> {
    let provider = super::provider();

    let mut cipher_suites = Vec::new();
    for name in split_list(&ssl.cipher_list_tls13).chain(split_list(&ssl.cipher_list)) {
        let wanted = rustls_suite_name(name);
        match provider
            .cipher_suites
            .iter()
            .find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(&wanted))
        {
            Some(suite) if !cipher_suites.contains(suite) => cipher_suites.push(*suite),
            Some(_) => {}
            None => log::warn!("Ignoring unsupported cipher suite {name}"),
        }
    }
    if cipher_suites.is_empty() {
        return Err(TunnelError::Config(
            "Cipher lists select no supported cipher suite".to_string(),
        ));
    }

    let has_tls13 = cipher_suites
        .iter()
        .any(|s| matches!(s, SupportedCipherSuite::Tls13(_)));
    let has_tls12 = cipher_suites
        .iter()
        .any(|s| matches!(s, SupportedCipherSuite::Tls12(_)));
    let mut versions = Vec::with_capacity(2);
    if has_tls13 {
        versions.push(&rustls::version::TLS13);
    }
    if has_tls12 {
        versions.push(&rustls::version::TLS12);
    }

    let kx_groups = if ssl.curve_list.trim().is_empty() {
        provider.kx_groups.clone()
    } else {
        let mut groups: Vec<&'static dyn SupportedKxGroup> = Vec::new();
        for name in split_list(&ssl.curve_list) {
            let wanted = rustls_group_name(name);
            match provider
                .kx_groups
                .iter()
                .find(|group| format!("{:?}", group.name()).eq_ignore_ascii_case(&wanted))
            {
                Some(group) if !groups.iter().any(|g| g.name() == group.name()) => {
                    groups.push(*group)
                }
                Some(_) => {}
                None => log::warn!("Ignoring unsupported curve {name}"),
            }
        }
        if groups.is_empty() {
            return Err(TunnelError::Config(format!(
                "Curve list '{}' names no supported group",
                ssl.curve_list
            )));
        }
        groups
    };

    if !ssl.dhparam_path.is_empty() {
        if !has_tls12 {
            return Err(TunnelError::Config(
                "dhparam_path only applies to TLS 1.2 but only TLS 1.3 suites are selected"
                    .to_string(),
            ));
        }
        let pem = fs::read_to_string(&ssl.dhparam_path).map_err(|e| {
            TunnelError::Credential(format!("Cannot read DH parameters {}: {e}", ssl.dhparam_path))
        })?;
        if !pem.contains(DH_PARAMS_HEADER) {
            return Err(TunnelError::Credential(format!(
                "{} does not contain DH PARAMETERS",
                ssl.dhparam_path
            )));
        }
        log::info!(
            "DH parameters from {} accepted but unused: key exchange is ECDHE only",
            ssl.dhparam_path
        );
    }

    for proto in ssl.alpn_port_overrides.keys() {
        if !ssl.alpn_protocols.contains(proto) {
            return Err(TunnelError::Config(format!(
                "alpn_port_overrides names '{proto}' which is not in alpn_protocols"
            )));
        }
    }

    Ok(Selection {
        cipher_suites,
        kx_groups,
        versions,
    })
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(':').map(str::trim).filter(|s| !s.is_empty())
}

/// Map an OpenSSL or IANA cipher name to the name rustls reports
fn rustls_suite_name(name: &str) -> String {
    let mapped = match name {
        "ECDHE-ECDSA-AES128-GCM-SHA256" => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
        "ECDHE-RSA-AES128-GCM-SHA256" => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
        "ECDHE-ECDSA-AES256-GCM-SHA384" => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
        "ECDHE-RSA-AES256-GCM-SHA384" => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
        "ECDHE-ECDSA-CHACHA20-POLY1305" => "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
        "ECDHE-RSA-CHACHA20-POLY1305" => "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
        other => other,
    };
    match mapped.strip_prefix("TLS_") {
        Some(rest) if rest.starts_with("AES_") || rest.starts_with("CHACHA20_") => {
            format!("TLS13_{rest}")
        }
        _ => mapped.to_string(),
    }
}

/// Map curve aliases to the name rustls reports
fn rustls_group_name(name: &str) -> String {
    match name {
        "P-256" | "prime256v1" => "secp256r1",
        "P-384" => "secp384r1",
        "P-521" => "secp521r1",
        other => other,
    }
    .to_string()
}

fn alpn_wire(ssl: &SslPolicy) -> Vec<Vec<u8>> {
    ssl.alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect()
}

/// Load a PEM certificate chain
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::Credential(format!("Cannot open certificate file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Credential(format!("Invalid certificate in {path}: {e}")))?;
    if certs.is_empty() {
        return Err(TunnelError::Credential(format!("No certificate found in {path}")));
    }
    Ok(certs)
}

/// Load the private key named by the policy
///
/// Encrypted PKCS#8 keys are decrypted with `key_password`. Legacy
/// OpenSSL-encrypted PEM keys cannot be used and surface as a credential
/// error rather than being silently skipped.
fn load_private_key(ssl: &SslPolicy) -> Result<PrivateKeyDer<'static>> {
    let path = &ssl.key_path;
    let pem = fs::read(path)
        .map_err(|e| TunnelError::Credential(format!("Cannot open key file {path}: {e}")))?;
    if contains(&pem, ENCRYPTED_PKCS8_LABEL.as_bytes()) {
        return decrypt_private_key(path, &pem, &ssl.key_password);
    }
    if contains(&pem, b"ENCRYPTED") {
        return Err(TunnelError::Credential(format!(
            "Private key {path} uses legacy PEM encryption; convert it to encrypted PKCS#8"
        )));
    }
    if !ssl.key_password.is_empty() {
        log::warn!("key_password set but {path} is not encrypted");
    }
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TunnelError::Credential(format!("Invalid private key in {path}: {e}")))?
        .ok_or_else(|| TunnelError::Credential(format!("No private key found in {path}")))
}

const ENCRYPTED_PKCS8_LABEL: &str = "ENCRYPTED PRIVATE KEY";

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn decrypt_private_key(path: &str, pem: &[u8], password: &str) -> Result<PrivateKeyDer<'static>> {
    if password.is_empty() {
        return Err(TunnelError::Credential(format!(
            "Private key {path} is encrypted but no key_password is set"
        )));
    }
    let text = std::str::from_utf8(pem)
        .map_err(|_| TunnelError::Credential(format!("Private key {path} is not PEM text")))?;
    let (label, document) = pkcs8::SecretDocument::from_pem(text)
        .map_err(|e| TunnelError::Credential(format!("Invalid private key in {path}: {e}")))?;
    if label != ENCRYPTED_PKCS8_LABEL {
        return Err(TunnelError::Credential(format!(
            "Unexpected {label} block in {path}"
        )));
    }
    let info = pkcs8::EncryptedPrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|e| TunnelError::Credential(format!("Invalid private key in {path}: {e}")))?;
    let decrypted = info.decrypt(password).map_err(|_| {
        TunnelError::Credential(format!("Cannot decrypt {path}: wrong key_password"))
    })?;
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        decrypted.as_bytes().to_vec(),
    )))
}

/// The camouflage value is either a file holding the response or the
/// response itself
fn load_camouflage(value: &str) -> Result<Bytes> {
    if value.is_empty() {
        return Ok(Bytes::new());
    }
    let path = Path::new(value);
    if path.is_file() {
        let body = fs::read(path).map_err(|e| {
            TunnelError::Credential(format!("Cannot read camouflage response {value}: {e}"))
        })?;
        return Ok(Bytes::from(body));
    }
    Ok(Bytes::copy_from_slice(value.as_bytes()))
}

/// Certificate verifier that accepts every certificate (`verify_peer = false`)
#[derive(Debug)]
struct AcceptAllVerifier {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAllVerifier {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// Full chain validation that tolerates a name mismatch (`verify_hostname = false`)
#[derive(Debug)]
struct NoHostnameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

fn is_name_mismatch(err: &rustls::Error) -> bool {
    // Covers NotValidForName and its context-carrying successor
    matches!(err, rustls::Error::InvalidCertificate(e) if format!("{e:?}").starts_with("NotValidForName"))
}

impl ServerCertVerifier for NoHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(e) if is_name_mismatch(&e) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
