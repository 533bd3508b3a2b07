//! End-to-end pipeline tests over real TCP and TLS on loopback

use bytes::Bytes;
use camotun::config::{SslPolicy, TcpPolicy};
use camotun::crypto::{session_cache::SessionCache, tls::TlsContextBuilder};
use camotun::endpoint::EndpointDescriptor;
use camotun::pipeline::{
    PipelineAcceptor, PipelineGroup, PipelineGroupConfig, ServerSettings, StreamEvent,
    StreamHandle, TlsChannelConnector,
};
use camotun::protocol::{PasswordAuthenticator, PREFACE_LEN};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const CAMOUFLAGE: &str = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";

fn server_policy(dir: &Path) -> SslPolicy {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    fs::write(&cert_path, cert.cert.pem()).unwrap();
    fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
    SslPolicy {
        cert_path: cert_path.to_string_lossy().into_owned(),
        key_path: key_path.to_string_lossy().into_owned(),
        camouflage_http_response: CAMOUFLAGE.to_string(),
        ..SslPolicy::default()
    }
}

fn client_policy() -> SslPolicy {
    SslPolicy {
        verify_peer: false,
        verify_hostname: false,
        ..SslPolicy::default()
    }
}

/// Echo every data chunk straight back; mirror the half-close
async fn echo(mut handle: StreamHandle) {
    while let Some(event) = handle.recv().await {
        match event {
            StreamEvent::Data(bytes) => {
                if handle.send(bytes).await.is_err() {
                    return;
                }
            }
            StreamEvent::Close => handle.close_write(),
            StreamEvent::Failed(_) => return,
        }
    }
}

/// Start an echoing server; returns its address
async fn start_server(ssl: SslPolicy) -> SocketAddr {
    let context = TlsContextBuilder::new(Arc::new(SessionCache::new()))
        .build_server(&ssl)
        .unwrap();
    let settings = ServerSettings {
        handshake_timeout: Duration::from_secs(5),
        ..ServerSettings::default()
    };
    let acceptor = Arc::new(PipelineAcceptor::new(
        context,
        settings,
        Arc::new(PasswordAuthenticator::new(&["secret"])),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (incoming_tx, mut incoming) = mpsc::channel(64);
    tokio::spawn(acceptor.serve(listener, incoming_tx));
    tokio::spawn(async move {
        while let Some(handle) = incoming.recv().await {
            tokio::spawn(echo(handle));
        }
    });
    addr
}

fn endpoint(addr: SocketAddr, password: &str) -> EndpointDescriptor {
    EndpointDescriptor::new(
        "127.0.0.1",
        addr.port(),
        password,
        client_policy(),
        TcpPolicy::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_streams_over_tls_resume_second_channel() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(server_policy(dir.path())).await;

    let connector = Arc::new(TlsChannelConnector::new(TlsContextBuilder::new(Arc::new(
        SessionCache::new(),
    ))));
    let config = PipelineGroupConfig::new(2, 16, vec![endpoint(addr, "secret")]);
    let group = PipelineGroup::new(config, connector.clone()).unwrap();

    let mut first = group.open_stream("echo:7").await.unwrap();
    first.send(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(first.recv().await.unwrap(), Some(Bytes::from_static(b"ping")));

    // The first channel is busy, so this one gets a channel of its own
    let mut second = group.open_stream("echo:7").await.unwrap();
    assert_ne!(first.channel_id(), second.channel_id());
    second.send(Bytes::from_static(b"pong")).await.unwrap();
    second.close_write().await;
    assert_eq!(second.recv().await.unwrap(), Some(Bytes::from_static(b"pong")));
    assert_eq!(second.recv().await.unwrap(), None);

    let stats = connector.handshake_stats();
    assert_eq!(stats.full, 1);
    assert_eq!(stats.resumed, 1);

    first.close_write().await;
    assert_eq!(first.recv().await.unwrap(), None);
    group.shutdown().await;
}

#[tokio::test]
async fn test_expired_session_takes_full_handshake() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(server_policy(dir.path())).await;

    let connector = Arc::new(TlsChannelConnector::new(TlsContextBuilder::new(Arc::new(
        SessionCache::new(),
    ))));
    let short_lived = SslPolicy {
        session_timeout_seconds: 1,
        ..client_policy()
    };
    let descriptor =
        EndpointDescriptor::new("127.0.0.1", addr.port(), "secret", short_lived, TcpPolicy::default())
            .unwrap();
    let config = PipelineGroupConfig::new(2, 16, vec![descriptor]);
    let group = PipelineGroup::new(config, connector.clone()).unwrap();

    let mut first = group.open_stream("echo:7").await.unwrap();
    first.send(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(first.recv().await.unwrap(), Some(Bytes::from_static(b"ping")));

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // First channel still busy, so the second stream needs a new channel
    let mut second = group.open_stream("echo:7").await.unwrap();
    assert_ne!(first.channel_id(), second.channel_id());
    second.send(Bytes::from_static(b"pong")).await.unwrap();
    assert_eq!(second.recv().await.unwrap(), Some(Bytes::from_static(b"pong")));

    let stats = connector.handshake_stats();
    assert_eq!(stats.full, 2);
    assert_eq!(stats.resumed, 0);
    group.shutdown().await;
}

#[tokio::test]
async fn test_wrong_password_never_yields_a_channel() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(server_policy(dir.path())).await;

    let connector = Arc::new(TlsChannelConnector::new(TlsContextBuilder::new(Arc::new(
        SessionCache::new(),
    ))));
    let config = PipelineGroupConfig::new(1, 16, vec![endpoint(addr, "wrong")])
        .with_open_timeout(Duration::from_secs(2));
    let group = PipelineGroup::new(config, connector).unwrap();

    // The server answers with the camouflage and closes, so the stream
    // never sees an echo
    let attempt = async {
        let mut stream = group.open_stream("echo:7").await?;
        stream.send(Bytes::from_static(b"ping")).await?;
        stream.recv().await
    };
    let result = tokio::time::timeout(Duration::from_secs(10), attempt)
        .await
        .unwrap();
    assert!(!matches!(result, Ok(Some(_))));
}

#[tokio::test]
async fn test_plain_probe_gets_camouflage() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(server_policy(dir.path())).await;

    let mut probe = TcpStream::connect(addr).await.unwrap();
    probe
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    probe.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, CAMOUFLAGE.as_bytes());
}

#[tokio::test]
async fn test_broken_client_hello_gets_camouflage() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(server_policy(dir.path())).await;

    // A handshake record whose only message has an unknown type
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket
        .write_all(&[0x16, 0x03, 0x01, 0x00, 0x05, 0xff, 0xff, 0xff, 0xff, 0xff])
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, CAMOUFLAGE.as_bytes());
}

#[tokio::test]
async fn test_bad_preface_gets_camouflage_over_tls() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(server_policy(dir.path())).await;

    let context = TlsContextBuilder::new(Arc::new(SessionCache::new()))
        .build_client(&endpoint(addr, "secret"))
        .unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut tls = context
        .connector()
        .connect(context.server_name().clone(), tcp)
        .await
        .unwrap();

    let mut preface = vec![b'0'; PREFACE_LEN];
    preface[PREFACE_LEN - 4] = b'\r';
    preface[PREFACE_LEN - 3] = b'\n';
    preface[PREFACE_LEN - 2] = 1;
    preface[PREFACE_LEN - 1] = 0;
    tls.write_all(&preface).await.unwrap();

    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;
    assert!(String::from_utf8_lossy(&response).contains("404 Not Found"));
}

#[tokio::test]
async fn test_alpn_override_redirects_to_local_port() {
    // Plain echo service standing in for a co-hosted web server
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = local.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = local.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        socket.write_all(&buf[..n]).await.unwrap();
    });

    let dir = TempDir::new().unwrap();
    let mut ssl = server_policy(dir.path());
    ssl.alpn_port_overrides = BTreeMap::from([("http/1.1".to_string(), local_port)]);
    let addr = start_server(ssl).await;

    let client_ssl = SslPolicy {
        alpn_protocols: vec!["http/1.1".to_string()],
        ..client_policy()
    };
    let descriptor = EndpointDescriptor::new(
        "127.0.0.1",
        addr.port(),
        "secret",
        client_ssl,
        TcpPolicy::default(),
    )
    .unwrap();
    let context = TlsContextBuilder::new(Arc::new(SessionCache::new()))
        .build_client(&descriptor)
        .unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut tls = context
        .connector()
        .connect(context.server_name().clone(), tcp)
        .await
        .unwrap();

    tls.write_all(b"GET /").await.unwrap();
    let mut echoed = [0u8; 5];
    tls.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"GET /");
}
