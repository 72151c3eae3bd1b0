use anyhow::{Context, Result};
use clap::Parser;
use multiplex::client::{self, PROTOCOL_HTTP, PROTOCOL_HTTPS};
use multiplex::config::ClientConfig;

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "Ping the multiplex server over HTTP and HTTPS with mTLS", long_about = None)]
struct Args {
    /// TOML configuration file, loaded before the flags below are applied
    #[arg(long)]
    config: Option<String>,

    /// Path to the SSL certificate file for the server
    #[arg(long)]
    cert: Option<String>,

    /// Path to the SSL private key file for the server
    #[arg(long)]
    key: Option<String>,

    /// Server to ping
    #[arg(long)]
    server: Option<String>,

    /// The port on which to ping the server
    #[arg(short, long)]
    port: Option<u16>,

    /// Hostname the server certificate was issued for
    #[arg(long)]
    cert_host: Option<String>,

    /// Skip fetching the public probe URL
    #[arg(long)]
    no_probe: bool,
}

impl Args {
    fn into_config(self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::default(),
        };

        if let Some(cert) = self.cert {
            config.cert_path = cert;
        }
        if let Some(key) = self.key {
            config.key_path = key;
        }
        if let Some(server) = self.server {
            config.server = server;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(cert_host) = self.cert_host {
            config.cert_host = cert_host;
        }
        if self.no_probe {
            config.probe_url = None;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config()?;

    let server_addrs = client::resolve_server(&config).await?;
    tracing::info!(
        "{} resolves to {:?}, requests are addressed to {}",
        config.server,
        server_addrs,
        config.cert_host
    );

    let http_client = client::create_mtls_client(&config, &server_addrs)?;

    for protocol in [PROTOCOL_HTTP, PROTOCOL_HTTPS] {
        let url = client::ping_url(protocol, &config.cert_host, config.port);
        let response = client::fetch(&http_client, &url)
            .await
            .context(format!("ping {} request", protocol.to_uppercase()))?;
        println!("{}", response.body);
        println!();
    }

    if let Some(probe_url) = &config.probe_url {
        println!("ping {} just to prove the root certs still work", probe_url);
        client::fetch(&http_client, probe_url)
            .await
            .context(format!("Could not reach {}", probe_url))?;
        println!("pinged {}", probe_url);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let config = Args::parse_from([
            "client",
            "--server",
            "10.1.2.3",
            "--port",
            "9443",
            "--no-probe",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.server_addr(), "10.1.2.3:9443");
        assert_eq!(config.cert_host, "foobar.com");
        assert!(config.probe_url.is_none());
    }

    #[test]
    fn test_invalid_port_rejected() {
        let result = Args::parse_from(["client", "--port", "0"]).into_config();
        assert!(result.is_err());
    }
}
