//! Listener, TLS termination and shutdown signalling.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::serve::{Listener, ListenerExt};
use axum::Router;
use futures::{Stream, StreamExt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::resilience::validator::InvalidAllowListEntry;
use crate::store::StoreError;

/// Startup and serving failures. All are fatal to the process.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    AllowList(#[from] InvalidAllowListEntry),
    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Adapts a stream of accepted connections to axum's [`Listener`].
struct AcceptStream<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for AcceptStream<S>
where
    S: Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => debug!(error = %e, "TLS accept failed"),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Build a rustls server config from a PEM certificate chain and a PKCS#8
/// PEM private key.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<rustls::ServerConfig, ServerError> {
    let open = |path: &str| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| ServerError::Tls(format!("cannot open {path}: {e}")))
    };

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("invalid certificate PEM {cert_path}: {e}")))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!("no certificates in {cert_path}")));
    }

    let key = rustls_pemfile::pkcs8_private_keys(&mut open(key_path)?)
        .next()
        .transpose()
        .map_err(|e| ServerError::Tls(format!("invalid key PEM {key_path}: {e}")))?
        .ok_or_else(|| ServerError::Tls(format!("no PKCS#8 private key in {key_path}")))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))
        .map_err(|e| ServerError::Tls(e.to_string()))
}

/// Serve `app` over TLS until `shutdown` is cancelled.
pub async fn serve(
    app: Router,
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    if let Err(e) =
        rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider())
    {
        debug!(?e, "Crypto provider already installed");
    }
    let tls = load_tls_config(&config.tls_cert_file, &config.tls_key_file)?;

    let addr = format!("{}:{}", config.host, config.port);
    let tcp = TcpListener::bind(&addr).await?;
    let local_addr = tcp.local_addr()?;
    let listener = AcceptStream {
        stream: tls_listener::builder(TlsAcceptor::from(Arc::new(tls)))
            .handshake_timeout(Duration::from_secs(config.read_timeout_secs.max(1)))
            .listen(tcp),
        local_addr,
    };

    info!(%local_addr, "Listening (TLS)");
    axum::serve(
        listener.tap_io(|_| {}),
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "agent-relay-{}-{name}",
            uuid::Uuid::new_v4()
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path.display().to_string()
    }

    #[test]
    fn test_missing_cert_file() {
        let err = load_tls_config("/nonexistent/cert.pem", "/nonexistent/key.pem").unwrap_err();
        assert!(matches!(err, ServerError::Tls(m) if m.contains("cannot open")));
    }

    #[test]
    fn test_empty_pem_files_rejected() {
        let cert = temp_file("cert.pem", "");
        let key = temp_file("key.pem", "");
        let err = load_tls_config(&cert, &key).unwrap_err();
        assert!(matches!(err, ServerError::Tls(m) if m.contains("no certificates")));
    }
}
