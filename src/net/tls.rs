//! TLS termination for the shuffle listeners.
//!
//! Two modes: a fixed certificate/key pair loaded from PEM files, or an
//! ACME-managed certificate with the TLS-ALPN-01 challenge answered inline
//! and certificates cached on disk. Both yield the same boxed stream type
//! so the listener code stays transport-agnostic.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use rustls::ServerConfig;
use rustls_acme::caches::DirCache;
use rustls_acme::{AcmeAcceptor, AcmeConfig};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("invalid tls configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// A terminated TLS connection, independent of how the certificate was
/// obtained.
pub trait TlsIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TlsIo for T {}

/// How a listener terminates TLS.
#[derive(Clone)]
pub enum TlsMode {
    /// Fixed certificate and key.
    Static(TlsAcceptor),
    /// Certificate managed by an ACME directory.
    Acme {
        acceptor: AcmeAcceptor,
        config: Arc<ServerConfig>,
    },
}

impl TlsMode {
    /// Perform the handshake. `None` means the connection was an ACME
    /// TLS-ALPN challenge and carries no application data.
    pub async fn accept(&self, stream: TcpStream) -> std::io::Result<Option<Box<dyn TlsIo>>> {
        match self {
            TlsMode::Static(acceptor) => {
                let tls = acceptor.accept(stream).await?;
                Ok(Some(Box::new(tls)))
            }
            TlsMode::Acme { acceptor, config } => {
                let handshake = acceptor
                    .accept(stream.compat())
                    .await
                    .map_err(std::io::Error::other)?;
                match handshake {
                    None => Ok(None),
                    Some(start) => {
                        let tls = start.into_stream(Arc::clone(config)).await?;
                        Ok(Some(Box::new(tls.compat())))
                    }
                }
            }
        }
    }
}

/// Build an acceptor from PEM cert/key files.
pub fn static_acceptor(cert_path: &str, key_path: &str) -> Result<TlsMode, TlsError> {
    let cert_pem = std::fs::read(cert_path)?;
    let key_pem = std::fs::read(key_path)?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_string()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    info!(cert = cert_path, "tls enabled");
    Ok(TlsMode::Static(TlsAcceptor::from(Arc::new(config))))
}

/// Build an acceptor whose certificate is obtained and renewed via ACME.
/// Certificates are cached under `cache_dir`; the background task driving
/// orders and renewals runs for the life of the process.
pub fn acme_acceptor(domain: &str, cache_dir: PathBuf) -> TlsMode {
    let mut state = AcmeConfig::new([domain.to_string()])
        .cache(DirCache::new(cache_dir))
        .directory_lets_encrypt(true)
        .state();

    let config = Arc::new(
        ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(state.resolver()),
    );
    let acceptor = state.acceptor();

    info!(domain, "acme certificate management enabled");
    tokio::spawn(async move {
        loop {
            match state.next().await {
                Some(Ok(event)) => info!(event = ?event, "acme event"),
                Some(Err(err)) => error!(error = %err, "acme error"),
                None => break,
            }
        }
    });

    TlsMode::Acme { acceptor, config }
}
