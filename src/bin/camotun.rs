//! camotun command-line entry point
//!
//! `camotun [--config] <path>` runs either side of the tunnel, as selected
//! by `run_type` in the configuration file.

use camotun::{
    config::{Config, RunType},
    crypto::{session_cache::SessionCache, tls::TlsContextBuilder},
    error::{IntoTunnelError, Result},
    pipeline::{
        bind_listener, relay_client, relay_to_target, InboundIcmp, PipelineAcceptor,
        PipelineGroup, TlsChannelConnector,
    },
    protocol::PasswordAuthenticator,
    tunnel::IcmpRelay,
};
use log::{debug, error, info, warn};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

/// How often expired client sessions are dropped from the cache
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// ICMP frames waiting for the host socket, across all channels
const ICMP_BACKLOG: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 2 && args[1] == "--config" {
        &args[2]
    } else if args.len() > 1 && !args[1].starts_with("--") {
        &args[1]
    } else {
        "config.toml"
    };

    let config = Config::from_file(config_path)?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    config.validate()?;

    info!("Starting {} v{}", camotun::NAME, camotun::VERSION);
    info!("Loaded configuration from: {config_path}");

    let sessions = Arc::new(SessionCache::new());
    tokio::spawn(sweep_sessions(sessions.clone()));
    let builder = TlsContextBuilder::new(sessions);

    match config.run_type {
        RunType::Client => run_client(config, builder).await,
        RunType::Server => run_server(config, builder).await,
    }
}

async fn run_client(config: Config, builder: TlsContextBuilder) -> Result<()> {
    let relay = IcmpRelay::prepare(config.pipeline.pipeline_proxy_icmp);
    if config.pipeline.pipeline_proxy_icmp {
        for (is_ipv4, family) in [(true, "IPv4"), (false, "IPv6")] {
            if let Err(e) = relay.try_enable(is_ipv4) {
                warn!("ICMP relay disabled for {family}: {e}");
            }
        }
    }
    let group_config = config.group_config()?.with_icmp_proxy(relay.is_enabled());
    for endpoint in &group_config.endpoints {
        debug!("Load balance candidate {}", endpoint.label());
    }

    let connector = Arc::new(TlsChannelConnector::new(builder));
    let group = Arc::new(PipelineGroup::new(group_config, connector)?);

    let listener = bind_listener(&config.local_addr, config.local_port, &config.tcp)
        .await
        .into_tunnel_error("Failed to bind local listener")?;
    let target = format!("{}:{}", config.target_addr, config.target_port);
    info!(
        "Forwarding {} to {target} over up to {} channels",
        listener.local_addr()?,
        config.pipeline.pipeline_num
    );

    let accept_loop = async {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {e}");
                    continue;
                }
            };
            let group = group.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let stream = match group.open_stream(&target).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("No stream for {peer}: {e}");
                        return;
                    }
                };
                let channel_id = stream.channel_id();
                match relay_client(socket, stream).await {
                    Ok(stats) => debug!(
                        "{peer} done on channel {channel_id}: {} bytes up, {} bytes down",
                        stats.sent, stats.received
                    ),
                    Err(e) => debug!("{peer} relay ended: {e}"),
                }
            });
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = shutdown_signal() => info!("Shutdown signal received"),
    }

    info!("Shutting down pipeline group...");
    group.shutdown().await;
    Ok(())
}

async fn run_server(config: Config, builder: TlsContextBuilder) -> Result<()> {
    let context = builder.build_server(&config.ssl)?;
    let authenticator = Arc::new(PasswordAuthenticator::new(&config.password));
    info!("Accepting {} password(s)", authenticator.len());

    let mut settings = config.server_settings();
    let icmp_sink = if settings.icmp_proxy_enabled {
        let sink = start_icmp_relay();
        settings.icmp_proxy_enabled = sink.is_some();
        sink
    } else {
        None
    };
    let acceptor = PipelineAcceptor::new(context, settings, authenticator);
    let acceptor = Arc::new(match icmp_sink {
        Some(sink) => acceptor.with_icmp_sink(sink),
        None => acceptor,
    });
    let listener = bind_listener(&config.local_addr, config.local_port, &config.tcp)
        .await
        .into_tunnel_error("Failed to bind local listener")?;

    let (incoming_tx, mut incoming) = mpsc::channel(1024);
    let serve = tokio::spawn(acceptor.serve(listener, incoming_tx));

    let connect_timeout = config.tcp.connect_timeout();
    let dispatch = async {
        while let Some(handle) = incoming.recv().await {
            tokio::spawn(async move {
                let target = handle.target().to_string();
                match relay_to_target(handle, connect_timeout).await {
                    Ok(stats) => debug!(
                        "Stream to {target} done: {} bytes up, {} bytes down",
                        stats.sent, stats.received
                    ),
                    Err(e) => debug!("Stream to {target} ended: {e}"),
                }
            });
        }
    };

    tokio::select! {
        _ = dispatch => warn!("Acceptor stopped"),
        _ = shutdown_signal() => info!("Shutdown signal received"),
    }
    serve.abort();
    Ok(())
}

/// Open the host ICMP socket and start relaying; `None` when unavailable
#[cfg(unix)]
fn start_icmp_relay() -> Option<mpsc::Sender<InboundIcmp>> {
    use camotun::tunnel::RawIcmpDevice;

    let relay = IcmpRelay::prepare(true);
    if let Err(e) = relay.try_enable(true) {
        warn!("ICMP relay disabled: {e}");
        return None;
    }
    let device = match RawIcmpDevice::open() {
        Ok(device) => device,
        Err(e) => {
            warn!("ICMP relay disabled: {e}");
            return None;
        }
    };
    let (tx, rx) = mpsc::channel(ICMP_BACKLOG);
    tokio::spawn(async move {
        let relay = IcmpRelay::with_capabilities(true, false);
        if let Err(e) = relay.serve(&device, rx).await {
            error!("ICMP relay stopped: {e}");
        }
    });
    info!("Relaying ICMP for clients through the host socket");
    Some(tx)
}

#[cfg(not(unix))]
fn start_icmp_relay() -> Option<mpsc::Sender<InboundIcmp>> {
    warn!("ICMP relay is not available on this platform");
    None
}

async fn sweep_sessions(sessions: Arc<SessionCache>) {
    let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let evicted = sessions.evict_expired();
        if evicted > 0 {
            debug!("Evicted {evicted} expired TLS session(s)");
        }
    }
}

async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C");
        }
        _ = terminate() => {
            debug!("Received SIGTERM");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {e}");
            futures::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    futures::future::pending::<()>().await;
}
