use crate::certs::{load_ca_cert, load_cert, load_private_key};
use crate::config::{HttpConfig, ServerConfig};
use crate::matchers;
use crate::error::MuxError;
use crate::mux::{Listener, Mux, SubListener};
use anyhow::{Context, Result};
use axum::{
    extract::Extension,
    http::{header, Uri, Version},
    response::IntoResponse,
    routing::get,
    Router,
};
use hyper::server::conn::Http;
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{cipher_suite, kx_group, version};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// TLS parameters of the connection a request arrived on
#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub version: String,
    pub alpn: Option<String>,
}

/// Binds the configured port and serves HTTP and HTTPS on it until Ctrl-C
pub async fn run(config: ServerConfig) -> Result<()> {
    config.validate()?;

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .context(format!("Failed to bind {}", config.listen_addr()))?;

    tracing::info!("Serving on port: {}", config.port);

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    serve(listener, &config, shutdown).await
}

/// Multiplexes `listener`: plain HTTP/1.1 requests go to the HTTP server,
/// everything else is assumed to be TLS. Returns once `shutdown` resolves
/// and both servers have stopped accepting.
pub async fn serve<L>(
    listener: L,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()>
where
    L: Listener,
{
    let tls_config = tls_server_config(config)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let app = create_app(&config.http);

    let mut mux = Mux::new(listener, config.mux.clone());

    // Plain HTTP first. Anything that does not look like an HTTP/1.1 method
    // is handed to the TLS server.
    let http_listener = mux.match_with(matchers::http1_fast());
    let tls_listener = mux.match_with(matchers::any());
    tokio::spawn(log_mux_errors(mux.errors()));

    let closer = mux.closer();
    tokio::spawn(async move {
        shutdown.await;
        closer.close();
    });

    let http_task = tokio::spawn(serve_http(http_listener, app.clone()));
    let https_task = tokio::spawn(serve_https(
        tls_listener,
        app,
        acceptor,
        config.http.handshake_timeout(),
    ));

    let served = mux.serve().await;

    for (name, task) in [("HTTP", http_task), ("HTTPS", https_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("{} server failed: {:#}", name, e),
            Err(e) => tracing::error!("{} server task panicked: {}", name, e),
        }
    }

    match served {
        Err(e) if e.is_closed() => Ok(()),
        other => other.context("Multiplexer failed"),
    }
}

/// Logs connections the multiplexer could not hand to either server.
/// Returns how many were logged once the multiplexer and its sniffing tasks
/// are gone.
pub async fn log_mux_errors(mut errors: mpsc::UnboundedReceiver<MuxError>) -> usize {
    let mut logged = 0;
    while let Some(err) = errors.recv().await {
        match &err {
            MuxError::NoMatch { .. } => tracing::info!("Dropped connection: {}", err),
            _ => tracing::warn!("Dropped connection: {}", err),
        }
        logged += 1;
    }
    logged
}

/// Builds the rustls configuration: TLS 1.2+, forward-secret AEAD suites,
/// ALPN for h2 and http/1.1. Client certificates are required only when a
/// client CA is configured.
pub fn tls_server_config(config: &ServerConfig) -> Result<rustls::ServerConfig> {
    let certs = load_cert(&config.cert_path).context("Failed to load server certificate")?;
    let key = load_private_key(&config.key_path).context("Failed to load server private key")?;

    let builder = rustls::ServerConfig::builder()
        .with_cipher_suites(&[
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ])
        .with_kx_groups(&[&kx_group::X25519, &kx_group::SECP256R1])
        .with_protocol_versions(&[&version::TLS13, &version::TLS12])
        .context("Failed to select TLS protocol versions")?;

    let builder = match &config.client_ca_path {
        Some(ca_path) => {
            let ca_store = load_ca_cert(ca_path).context("Failed to load client CA certificate")?;
            let client_verifier = AllowAnyAuthenticatedClient::new(ca_store);
            builder.with_client_cert_verifier(Arc::new(client_verifier))
        }
        None => builder.with_no_client_auth(),
    };

    let mut tls_config = builder
        .with_single_cert(certs, key)
        .context("Failed to create TLS configuration")?;

    // Advertise HTTP/2 alongside HTTP/1.1.
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Creates the Axum application with all routes
pub fn create_app(http: &HttpConfig) -> Router {
    Router::new().route("/ping", get(ping_handler)).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(http.request_timeout())),
    )
}

/// Serves plain HTTP on connections claimed by the HTTP rule
pub async fn serve_http<L: Listener>(listener: SubListener<L>, app: Router) -> Result<()> {
    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(e) if e.is_closed() => {
                tracing::info!("HTTP listener closed");
                return Ok(());
            }
            Err(e) => return Err(e).context("HTTP listener failed"),
        };

        let app = app.clone();
        tokio::spawn(async move {
            let peer = stream.peer().to_string();
            if let Err(e) = Http::new().serve_connection(stream, app).await {
                tracing::debug!(%peer, "HTTP connection error: {}", e);
            }
        });
    }
}

/// Terminates TLS and serves HTTP/2 or HTTP/1.1 on connections claimed by
/// the catch-all rule
pub async fn serve_https<L: Listener>(
    listener: SubListener<L>,
    app: Router,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
) -> Result<()> {
    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(e) if e.is_closed() => {
                tracing::info!("HTTPS listener closed");
                return Ok(());
            }
            Err(e) => return Err(e).context("HTTPS listener failed"),
        };

        let app = app.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let peer = stream.peer().to_string();

            let tls_stream =
                match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => tls_stream,
                    Ok(Err(e)) => {
                        tracing::debug!(%peer, "TLS handshake failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        tracing::debug!(%peer, "TLS handshake timed out");
                        return;
                    }
                };

            let (_, session) = tls_stream.get_ref();
            let info = TlsInfo {
                version: session
                    .protocol_version()
                    .map(|v| format!("{:?}", v))
                    .unwrap_or_else(|| "unknown".to_string()),
                alpn: session
                    .alpn_protocol()
                    .map(|p| String::from_utf8_lossy(p).into_owned()),
            };

            let app = app.layer(Extension(info));
            if let Err(e) = Http::new().serve_connection(tls_stream, app).await {
                tracing::debug!(%peer, "HTTPS connection error: {}", e);
            }
        });
    }
}

/// Ping endpoint - answers "pong" and logs how the request arrived
async fn ping_handler(
    version: Version,
    uri: Uri,
    tls: Option<Extension<TlsInfo>>,
) -> impl IntoResponse {
    tracing::info!("request: protocol: {:?} url: {}", version, uri);
    if let Some(Extension(tls)) = tls {
        tracing::info!(
            "request: tls: version: {} alpn: {}",
            tls.version,
            tls.alpn.as_deref().unwrap_or("none")
        );
    }

    ([(header::CONTENT_TYPE, "text/plain")], "pong")
}
