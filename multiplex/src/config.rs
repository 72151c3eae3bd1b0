use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Tuning for the connection multiplexer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MuxConfig {
    /// Maximum number of bytes sniffed before the rules must decide
    #[serde(default = "default_peek_limit")]
    pub peek_limit: usize,

    /// Deadline for the rules to decide, in milliseconds
    #[serde(default = "default_peek_timeout_ms")]
    pub peek_timeout_ms: u64,
}

/// Timeouts of the HTTP servers behind the multiplexer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    /// Deadline for the TLS handshake, in seconds
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Deadline for producing a response, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Configuration for the ping server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Port serving both HTTP and HTTPS
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the server certificate
    #[serde(default = "default_cert_path")]
    pub cert_path: String,

    /// Path to the server private key
    #[serde(default = "default_key_path")]
    pub key_path: String,

    /// CA used to verify client certificates; client auth is off when unset
    #[serde(default)]
    pub client_ca_path: Option<String>,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub mux: MuxConfig,
}

/// Configuration for the mTLS client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Client certificate, also trusted as the server's root
    #[serde(default = "default_cert_path")]
    pub cert_path: String,

    /// Client private key
    #[serde(default = "default_key_path")]
    pub key_path: String,

    /// Host or IP actually dialed
    #[serde(default = "default_server")]
    pub server: String,

    /// Port of the server
    #[serde(default = "default_port")]
    pub port: u16,

    /// Hostname the server certificate was issued for
    #[serde(default = "default_cert_host")]
    pub cert_host: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Public HTTPS URL fetched last to show the web roots still verify
    #[serde(default = "default_probe_url")]
    pub probe_url: Option<String>,
}

fn default_peek_limit() -> usize {
    4096
}

fn default_peek_timeout_ms() -> u64 {
    2000
}

fn default_handshake_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_port() -> u16 {
    8080
}

fn default_cert_path() -> String {
    "ssl/server.crt".to_string()
}

fn default_key_path() -> String {
    "ssl/server.key".to_string()
}

fn default_server() -> String {
    "localhost".to_string()
}

fn default_cert_host() -> String {
    "foobar.com".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_probe_url() -> Option<String> {
    Some("https://www.google.com".to_string())
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            peek_limit: default_peek_limit(),
            peek_timeout_ms: default_peek_timeout_ms(),
        }
    }
}

impl MuxConfig {
    pub fn peek_timeout(&self) -> Duration {
        Duration::from_millis(self.peek_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.peek_limit == 0 {
            anyhow::bail!("mux.peek_limit must be greater than zero");
        }
        if self.peek_timeout_ms == 0 {
            anyhow::bail!("mux.peek_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            client_ca_path: None,
            http: HttpConfig::default(),
            mux: MuxConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: ServerConfig =
            toml::from_str(&contents).context("Failed to parse TOML configuration")?;

        Ok(config)
    }

    /// Get the listen address; all interfaces, like any plain `:port` bind
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.http.handshake_timeout_secs == 0 {
            anyhow::bail!("http.handshake_timeout_secs must be greater than zero");
        }
        if self.http.request_timeout_secs == 0 {
            anyhow::bail!("http.request_timeout_secs must be greater than zero");
        }
        self.mux.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            server: default_server(),
            port: default_port(),
            cert_host: default_cert_host(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            probe_url: default_probe_url(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: ClientConfig =
            toml::from_str(&contents).context("Failed to parse TOML configuration")?;

        Ok(config)
    }

    /// Address to dial, before name resolution
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than zero");
        }
        if self.server.is_empty() {
            anyhow::bail!("server must not be empty");
        }
        if self.cert_host.is_empty() {
            anyhow::bail!("cert_host must not be empty");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_config() {
        let toml = r#"
            port = 9443
            cert_path = "certs/a.crt"
            key_path = "certs/a.key"
            client_ca_path = "certs/ca.crt"

            [http]
            request_timeout_secs = 3

            [mux]
            peek_limit = 512
        "#;

        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.port, 9443);
        assert_eq!(config.cert_path, "certs/a.crt");
        assert_eq!(config.client_ca_path.as_deref(), Some("certs/ca.crt"));
        assert_eq!(config.http.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.http.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.mux.peek_limit, 512);
        assert_eq!(config.mux.peek_timeout(), Duration::from_millis(2000));
        assert_eq!(config.listen_addr(), "0.0.0.0:9443");
    }

    #[test]
    fn test_default_server_config() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.port, 8080);
        assert_eq!(config.cert_path, "ssl/server.crt");
        assert_eq!(config.key_path, "ssl/server.key");
        assert!(config.client_ca_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_client_config() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.server_addr(), "localhost:8080");
        assert_eq!(config.cert_host, "foobar.com");
        assert_eq!(config.probe_url.as_deref(), Some("https://www.google.com"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_names_the_field() {
        let mut config = ServerConfig::default();
        config.mux.peek_limit = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("peek_limit"));

        let client = ClientConfig {
            port: 0,
            ..ClientConfig::default()
        };
        let err = client.validate().unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        fs::write(
            &path,
            "server = \"10.0.0.5\"\nport = 9000\nprobe_url = \"https://example.com\"\n",
        )
        .unwrap();

        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.server_addr(), "10.0.0.5:9000");
        assert_eq!(config.probe_url.as_deref(), Some("https://example.com"));
        assert_eq!(config.keepalive(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_config_file() {
        let err = ServerConfig::from_file("does/not/exist.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
