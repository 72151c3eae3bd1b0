use anyhow::Result;
use clap::Parser;
use multiplex::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "multiplex")]
#[command(about = "Serve HTTP and HTTPS on a single port", long_about = None)]
struct Args {
    /// TOML configuration file, loaded before the flags below are applied
    #[arg(long)]
    config: Option<String>,

    /// The port on which to serve
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the SSL certificate for the server
    #[arg(long)]
    cert: Option<String>,

    /// Path to the SSL private key for the server
    #[arg(long)]
    key: Option<String>,

    /// Require client certificates signed by this CA
    #[arg(long)]
    client_ca: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(cert) = self.cert {
            config.cert_path = cert;
        }
        if let Some(key) = self.key {
            config.key_path = key;
        }
        if let Some(client_ca) = self.client_ca {
            config.client_ca_path = Some(client_ca);
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config()?;

    tracing::info!("Certificate: {}", config.cert_path);
    tracing::info!("Private Key: {}", config.key_path);
    if let Some(client_ca) = &config.client_ca_path {
        tracing::info!("Client CA: {}", client_ca);
    }

    multiplex::server::run(config).await
}
