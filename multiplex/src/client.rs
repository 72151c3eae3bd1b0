use crate::config::ClientConfig;
use anyhow::{Context, Result};
use reqwest::{Client, Identity, StatusCode, Version};
use std::fs;
use std::net::SocketAddr;

pub const PROTOCOL_HTTP: &str = "http";
pub const PROTOCOL_HTTPS: &str = "https";

/// What came back from a GET
#[derive(Debug)]
pub struct FetchResponse {
    pub version: Version,
    pub status: StatusCode,
    pub body: String,
}

/// Builds the ping URL. The host is always the certificate hostname; the
/// client's resolver override decides where the TCP connection goes.
pub fn ping_url(protocol: &str, cert_host: &str, port: u16) -> String {
    format!("{}://{}:{}/ping", protocol, cert_host, port)
}

/// Resolves the configured server to the addresses that will actually be
/// dialed
pub async fn resolve_server(config: &ClientConfig) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(config.server_addr())
        .await
        .context(format!("Failed to resolve server: {}", config.server_addr()))?
        .collect();

    if addrs.is_empty() {
        anyhow::bail!("No addresses found for server: {}", config.server_addr());
    }

    Ok(addrs)
}

/// Creates an HTTPS client configured for mTLS
///
/// The client presents the configured certificate and trusts it as a root
/// on top of the public web roots. Requests go to `cert_host`, so SNI and
/// hostname verification use the name the certificate was issued for,
/// while connections for that host are sent to `server_addrs`.
pub fn create_mtls_client(config: &ClientConfig, server_addrs: &[SocketAddr]) -> Result<Client> {
    // Load client certificate and key
    let cert_pem = fs::read(&config.cert_path)
        .context(format!("Failed to read certificate: {:?}", config.cert_path))?;

    let key_pem = fs::read(&config.key_path)
        .context(format!("Failed to read private key: {:?}", config.key_path))?;

    // The self-signed server certificate doubles as our extra root
    let server_cert = reqwest::Certificate::from_pem(&cert_pem)
        .context("Failed to parse server certificate")?;

    // Combine cert and key for reqwest Identity
    let mut pem = cert_pem;
    pem.extend_from_slice(&key_pem);

    let identity = Identity::from_pem(&pem)
        .context("Failed to create identity from certificate and key")?;

    let client = Client::builder()
        .use_rustls_tls()
        .identity(identity)
        .add_root_certificate(server_cert)
        .connect_timeout(config.connect_timeout())
        .tcp_keepalive(config.keepalive())
        .resolve_to_addrs(&config.cert_host, server_addrs)
        .build()
        .context("Failed to build HTTPS client")?;

    Ok(client)
}

/// Makes a GET request to the specified URL
pub async fn fetch(client: &Client, url: &str) -> Result<FetchResponse> {
    tracing::info!("request: url: {}", url);

    let response = client
        .get(url)
        .send()
        .await
        .context(format!("Failed to send GET request to {}", url))?;

    let version = response.version();
    let status = response.status();
    tracing::info!("response: protocol: {:?} status: {}", version, status.as_u16());

    let body = response
        .text()
        .await
        .context("Failed to read response body")?;

    if !status.is_success() {
        anyhow::bail!("Request failed with status {}: {}", status, body);
    }

    Ok(FetchResponse {
        version,
        status,
        body,
    })
}
