//! End-to-end: plain HTTP and HTTPS on one port, driven by the mTLS client.

use multiplex::certs::generate_self_signed;
use multiplex::client::{create_mtls_client, fetch, ping_url, PROTOCOL_HTTP, PROTOCOL_HTTPS};
use multiplex::config::{ClientConfig, ServerConfig};
use multiplex::server;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const CERT_HOST: &str = "foobar.com";

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn stop(self) {
        let _ = self.stop.send(());
        let result = timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok(), "server failed: {:?}", result);
    }
}

fn write_pair(dir: &Path) -> (PathBuf, PathBuf) {
    let (cert_pem, key_pem) = generate_self_signed(&[CERT_HOST, "localhost", "127.0.0.1"]).unwrap();
    let cert_path = dir.join("server.crt");
    let key_path = dir.join("server.key");
    fs::write(&cert_path, cert_pem).unwrap();
    fs::write(&key_path, key_pem).unwrap();
    (cert_path, key_path)
}

async fn start(config: ServerConfig) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        server::serve(listener, &config, async move {
            let _ = stopped.await;
        })
        .await
    });

    Running { addr, stop, handle }
}

fn server_config(cert: &Path, key: &Path) -> ServerConfig {
    ServerConfig {
        port: 0,
        cert_path: cert.to_string_lossy().into_owned(),
        key_path: key.to_string_lossy().into_owned(),
        ..ServerConfig::default()
    }
}

fn client_config(cert: &Path, key: &Path, addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        cert_path: cert.to_string_lossy().into_owned(),
        key_path: key.to_string_lossy().into_owned(),
        server: addr.ip().to_string(),
        port: addr.port(),
        cert_host: CERT_HOST.to_string(),
        probe_url: None,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn test_http_and_https_share_a_port() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_pair(dir.path());
    let running = start(server_config(&cert, &key)).await;

    let config = client_config(&cert, &key, running.addr);
    let client = create_mtls_client(&config, &[running.addr]).unwrap();

    let plain = fetch(&client, &ping_url(PROTOCOL_HTTP, CERT_HOST, running.addr.port()))
        .await
        .unwrap();
    assert_eq!(plain.body, "pong");
    assert_eq!(plain.version, reqwest::Version::HTTP_11);

    let secure = fetch(&client, &ping_url(PROTOCOL_HTTPS, CERT_HOST, running.addr.port()))
        .await
        .unwrap();
    assert_eq!(secure.body, "pong");
    assert!(secure.status.is_success());

    running.stop().await;
}

#[tokio::test]
async fn test_client_certificate_required_when_ca_configured() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_pair(dir.path());
    let config = ServerConfig {
        client_ca_path: Some(cert.to_string_lossy().into_owned()),
        ..server_config(&cert, &key)
    };
    let running = start(config).await;
    let url = ping_url(PROTOCOL_HTTPS, CERT_HOST, running.addr.port());

    let client = create_mtls_client(&client_config(&cert, &key, running.addr), &[running.addr])
        .unwrap();
    let response = fetch(&client, &url).await.unwrap();
    assert_eq!(response.body, "pong");

    // Trusts the server but presents no certificate.
    let root = reqwest::Certificate::from_pem(&fs::read(&cert).unwrap()).unwrap();
    let anonymous = reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(root)
        .resolve_to_addrs(CERT_HOST, &[running.addr])
        .build()
        .unwrap();
    assert!(fetch(&anonymous, &url).await.is_err());

    running.stop().await;
}

#[tokio::test]
async fn test_garbage_does_not_stop_the_server() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_pair(dir.path());
    let running = start(server_config(&cert, &key)).await;

    let mut junk = TcpStream::connect(running.addr).await.unwrap();
    junk.write_all(b"\x00\x01\x02 not a protocol").await.unwrap();
    drop(junk);

    let client = create_mtls_client(&client_config(&cert, &key, running.addr), &[running.addr])
        .unwrap();
    let response = fetch(&client, &ping_url(PROTOCOL_HTTP, CERT_HOST, running.addr.port()))
        .await
        .unwrap();
    assert_eq!(response.body, "pong");

    running.stop().await;
}

#[tokio::test]
async fn test_missing_certificate_fails_before_serving() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ServerConfig {
        cert_path: "does/not/exist.crt".to_string(),
        ..ServerConfig::default()
    };

    let result = server::serve(listener, &config, std::future::pending()).await;
    assert!(result.is_err());
}
