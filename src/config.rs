//! Configuration module for the pipeline tunnel
//!
//! This module provides TOML-based configuration parsing and validation.
//! The loaded [`Config`] is converted into the owned value types the core
//! works with ([`EndpointDescriptor`], [`PipelineGroupConfig`],
//! [`ServerSettings`]); nothing below this layer reaches back into it.

use crate::endpoint::EndpointDescriptor;
use crate::error::{Result, TunnelError};
use crate::pipeline::{PipelineGroupConfig, ServerSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which side of the tunnel this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    /// Accept local TCP connections and forward them through the pipeline group
    #[default]
    Client,
    /// Accept pipeline channels and connect each stream to its target
    Server,
}

/// TLS policy for one endpoint (or for the local server)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslPolicy {
    /// Verify the peer certificate chain
    #[serde(default = "default_true", alias = "verify")]
    pub verify_peer: bool,
    /// Verify that the certificate matches the server name
    #[serde(default = "default_true")]
    pub verify_hostname: bool,
    /// Server: certificate chain. Client: extra trust anchors / client chain
    #[serde(default, alias = "cert")]
    pub cert_path: String,
    /// Private key (server, or client with mutual TLS)
    #[serde(default, alias = "key")]
    pub key_path: String,
    /// Password of an encrypted private key
    #[serde(default)]
    pub key_password: String,
    /// TLS 1.2 cipher suites, `:` separated, in preference order
    #[serde(default = "default_cipher_list", alias = "cipher")]
    pub cipher_list: String,
    /// TLS 1.3 cipher suites, `:` separated, in preference order
    #[serde(default = "default_cipher_list_tls13", alias = "cipher_tls13")]
    pub cipher_list_tls13: String,
    /// Server cipher order wins over the client's
    #[serde(default = "default_true")]
    pub prefer_server_cipher: bool,
    /// SNI sent by the client; empty means the endpoint address
    #[serde(default)]
    pub sni: String,
    /// ALPN protocols offered (client) or accepted (server)
    #[serde(default = "default_alpn", alias = "alpn")]
    pub alpn_protocols: Vec<String>,
    /// Server: redirect connections that negotiated a protocol to a local port
    #[serde(default, alias = "alpn_port_override")]
    pub alpn_port_overrides: BTreeMap<String, u16>,
    /// Enable session-ID based resumption
    #[serde(default = "default_true")]
    pub reuse_session: bool,
    /// Enable session tickets
    #[serde(default, alias = "session_ticket")]
    pub session_ticket_enabled: bool,
    /// Lifetime of cached sessions in seconds
    #[serde(default = "default_session_timeout", alias = "session_timeout")]
    pub session_timeout_seconds: u64,
    /// Upper bound for draining a channel, in milliseconds
    #[serde(default = "default_shutdown_wait", alias = "ssl_shutdown_wait_time")]
    pub shutdown_wait_ms: u64,
    /// Canned response served to unauthenticated peers (server only)
    #[serde(default, alias = "plain_http_response")]
    pub camouflage_http_response: String,
    /// Key exchange groups, `:` separated; empty keeps the provider default
    #[serde(default, alias = "curves")]
    pub curve_list: String,
    /// DH parameters file (TLS 1.2 only)
    #[serde(default, alias = "dhparam")]
    pub dhparam_path: String,
}

impl SslPolicy {
    /// Lifetime of resumption state
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_seconds)
    }

    /// Upper bound for the draining phase of a channel
    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_wait_ms)
    }
}

impl Default for SslPolicy {
    fn default() -> Self {
        Self {
            verify_peer: true,
            verify_hostname: true,
            cert_path: String::new(),
            key_path: String::new(),
            key_password: String::new(),
            cipher_list: default_cipher_list(),
            cipher_list_tls13: default_cipher_list_tls13(),
            prefer_server_cipher: true,
            sni: String::new(),
            alpn_protocols: default_alpn(),
            alpn_port_overrides: BTreeMap::new(),
            reuse_session: true,
            session_ticket_enabled: false,
            session_timeout_seconds: default_session_timeout(),
            shutdown_wait_ms: default_shutdown_wait(),
            camouflage_http_response: String::new(),
            curve_list: String::new(),
            dhparam_path: String::new(),
        }
    }
}

/// TCP tuning for upstream sockets and, on the server, the listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpPolicy {
    /// Try IPv4 addresses before IPv6 ones
    #[serde(default)]
    pub prefer_ipv4: bool,
    /// Disable Nagle's algorithm
    #[serde(default = "default_true")]
    pub no_delay: bool,
    /// Enable SO_KEEPALIVE
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    /// Enable SO_REUSEPORT
    #[serde(default)]
    pub reuse_port: bool,
    /// Enable TCP fast open
    #[serde(default)]
    pub fast_open: bool,
    /// Fast open queue length for the server listener
    #[serde(default = "default_fast_open_qlen", alias = "fast_open_qlen")]
    pub fast_open_queue_length: u32,
    /// Bound for one connect attempt (TCP + TLS + preface), in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl TcpPolicy {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for TcpPolicy {
    fn default() -> Self {
        Self {
            prefer_ipv4: false,
            no_delay: true,
            keep_alive: true,
            reuse_port: false,
            fast_open: false,
            fast_open_queue_length: default_fast_open_qlen(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// One extra load-balance candidate declared inline
///
/// Missing password/ssl/tcp sections inherit the main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub address: String,
    pub port: u16,
    pub password: Option<String>,
    pub ssl: Option<SslPolicy>,
    pub tcp: Option<TcpPolicy>,
}

/// Pipeline (multiplexing) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of concurrently open channels
    #[serde(default = "default_pipeline_num")]
    pub pipeline_num: u32,
    /// Maximum number of unacknowledged frames per channel
    #[serde(default = "default_ack_window")]
    pub pipeline_ack_window: u32,
    /// Carry ICMP packets from the TUN device through the pipeline
    #[serde(default)]
    pub pipeline_proxy_icmp: bool,
    /// How long an endpoint is skipped after a failed connect attempt
    #[serde(default = "default_failure_cooldown")]
    pub failure_cooldown_ms: u64,
    /// Further configuration files, each describing one extra endpoint
    #[serde(default)]
    pub loadbalance_configs: Vec<PathBuf>,
    /// Extra endpoints declared inline
    #[serde(default)]
    pub loadbalance: Vec<EndpointConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_num: default_pipeline_num(),
            pipeline_ack_window: default_ack_window(),
            pipeline_proxy_icmp: false,
            failure_cooldown_ms: default_failure_cooldown(),
            loadbalance_configs: Vec::new(),
            loadbalance: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run_type: RunType,
    /// Local listen address
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    #[serde(default)]
    pub local_port: u16,
    /// Primary upstream endpoint (client)
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub remote_port: u16,
    /// Destination every forwarded connection is opened to (client)
    #[serde(default)]
    pub target_addr: String,
    #[serde(default)]
    pub target_port: u16,
    /// Client: first entry authenticates. Server: every entry is accepted
    #[serde(default)]
    pub password: Vec<String>,
    #[serde(default)]
    pub ssl: SslPolicy,
    #[serde(default)]
    pub tcp: TcpPolicy,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Endpoints loaded from `pipeline.loadbalance_configs`
    #[serde(skip)]
    linked_endpoints: Vec<EndpointConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Relative `loadbalance_configs` paths are resolved against the
    /// directory of `path`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            TunnelError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        let mut config = <Self as FromStr>::from_str(&contents)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.load_linked_endpoints(base)?;
        Ok(config)
    }

    fn load_linked_endpoints(&mut self, base: &Path) -> Result<()> {
        let mut linked = Vec::with_capacity(self.pipeline.loadbalance_configs.len());
        for file in &self.pipeline.loadbalance_configs {
            let full = if file.is_absolute() {
                file.clone()
            } else {
                base.join(file)
            };
            let contents = fs::read_to_string(&full).map_err(|e| {
                TunnelError::Config(format!(
                    "Failed to read load balance config {}: {e}",
                    full.display()
                ))
            })?;
            let other = <Self as FromStr>::from_str(&contents)?;
            log::debug!(
                "Loaded load balance endpoint {}:{} from {}",
                other.remote_addr,
                other.remote_port,
                full.display()
            );
            linked.push(EndpointConfig {
                address: other.remote_addr,
                port: other.remote_port,
                password: other.password.into_iter().next(),
                ssl: Some(other.ssl),
                tcp: Some(other.tcp),
            });
        }
        self.linked_endpoints = linked;
        Ok(())
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TunnelError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.local_addr.is_empty() {
            return Err(TunnelError::Config(
                "Local address cannot be empty".to_string(),
            ));
        }

        if self.password.is_empty() || self.password.iter().any(String::is_empty) {
            return Err(TunnelError::Config(
                "At least one non-empty password is required".to_string(),
            ));
        }

        if self.pipeline.pipeline_num == 0 {
            return Err(TunnelError::Config(
                "pipeline_num must be at least 1".to_string(),
            ));
        }

        if self.pipeline.pipeline_ack_window == 0 {
            return Err(TunnelError::Config(
                "pipeline_ack_window must be at least 1".to_string(),
            ));
        }

        match self.run_type {
            RunType::Client => {
                if self.remote_addr.is_empty() {
                    return Err(TunnelError::Config(
                        "Remote address cannot be empty".to_string(),
                    ));
                }
                if self.remote_port == 0 {
                    return Err(TunnelError::Config("Remote port cannot be zero".to_string()));
                }
                if self.target_addr.is_empty() || self.target_port == 0 {
                    return Err(TunnelError::Config(
                        "Client requires target_addr and target_port".to_string(),
                    ));
                }
                for endpoint in self.pipeline.loadbalance.iter().chain(&self.linked_endpoints) {
                    if endpoint.address.is_empty() || endpoint.port == 0 {
                        return Err(TunnelError::Config(format!(
                            "Invalid load balance endpoint {}:{}",
                            endpoint.address, endpoint.port
                        )));
                    }
                }
            }
            RunType::Server => {
                if self.local_port == 0 {
                    return Err(TunnelError::Config("Local port cannot be zero".to_string()));
                }
                if self.ssl.cert_path.is_empty() || self.ssl.key_path.is_empty() {
                    return Err(TunnelError::Config(
                        "Server requires ssl.cert_path and ssl.key_path".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Build the load balance candidates: the primary remote first, then
    /// inline endpoints, then endpoints from linked configuration files
    pub fn endpoints(&self) -> Result<Vec<EndpointDescriptor>> {
        let primary_password = self
            .password
            .first()
            .ok_or_else(|| TunnelError::Config("No password configured".to_string()))?;

        let mut endpoints = vec![EndpointDescriptor::new(
            self.remote_addr.clone(),
            self.remote_port,
            primary_password,
            self.ssl.clone(),
            self.tcp.clone(),
        )?];

        for extra in self.pipeline.loadbalance.iter().chain(&self.linked_endpoints) {
            let descriptor = EndpointDescriptor::new(
                extra.address.clone(),
                extra.port,
                extra.password.as_deref().unwrap_or(primary_password),
                extra.ssl.clone().unwrap_or_else(|| self.ssl.clone()),
                extra.tcp.clone().unwrap_or_else(|| self.tcp.clone()),
            )?;
            if endpoints.contains(&descriptor) {
                log::warn!(
                    "Skipping duplicate load balance endpoint {}",
                    descriptor.label()
                );
                continue;
            }
            endpoints.push(descriptor);
        }

        Ok(endpoints)
    }

    /// Build the pipeline group configuration (client side)
    pub fn group_config(&self) -> Result<PipelineGroupConfig> {
        let endpoints = self.endpoints()?;
        Ok(PipelineGroupConfig::new(
            self.pipeline.pipeline_num as usize,
            self.pipeline.pipeline_ack_window,
            endpoints,
        )
        .with_icmp_proxy(self.pipeline.pipeline_proxy_icmp)
        .with_failure_cooldown(Duration::from_millis(self.pipeline.failure_cooldown_ms))
        .with_shutdown_wait(self.ssl.shutdown_wait()))
    }

    /// Build the acceptor settings (server side)
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            ack_window_size: self.pipeline.pipeline_ack_window,
            icmp_proxy_enabled: self.pipeline.pipeline_proxy_icmp,
            handshake_timeout: self.tcp.connect_timeout(),
            shutdown_wait: self.ssl.shutdown_wait(),
            tcp: self.tcp.clone(),
        }
    }

    /// A minimal client configuration pointing at a local server
    pub fn default_client() -> Self {
        Self {
            run_type: RunType::Client,
            local_addr: default_local_addr(),
            local_port: 1080,
            remote_addr: "127.0.0.1".to_string(),
            remote_port: 443,
            target_addr: "example.com".to_string(),
            target_port: 80,
            password: vec!["password".to_string()],
            ssl: SslPolicy::default(),
            tcp: TcpPolicy::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig::default(),
            linked_endpoints: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_client()
    }
}

impl FromStr for Config {
    type Err = TunnelError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TunnelError::Config(format!("Failed to parse TOML: {e}")))
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_local_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_cipher_list() -> String {
    "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
     ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305:\
     ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384"
        .to_string()
}

fn default_cipher_list_tls13() -> String {
    "TLS_AES_128_GCM_SHA256:TLS_CHACHA20_POLY1305_SHA256:TLS_AES_256_GCM_SHA384".to_string()
}

fn default_alpn() -> Vec<String> {
    vec!["h2".to_string(), "http/1.1".to_string()]
}

fn default_session_timeout() -> u64 {
    600
}

fn default_shutdown_wait() -> u64 {
    3000
}

fn default_fast_open_qlen() -> u32 {
    20
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_pipeline_num() -> u32 {
    1
}

fn default_ack_window() -> u32 {
    200
}

fn default_failure_cooldown() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}
