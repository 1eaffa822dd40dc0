use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::connection::handler::HandlerMessage;
use crate::connection::pool::{HandlerPool, PoolShared};
use crate::error::ServerError;
use crate::handler::RequestHandler;
use crate::settings::ServerSettings;

/// Listening endpoint of the server.
///
/// Binds TCP (optionally TLS-wrapped) on `host:port`, owns the handler pool
/// and hands each accepted connection to a pooled handler. When the pool is
/// saturated the connection is rejected with an inline 503.
pub struct HttpListener {
    local_addr: SocketAddr,
    pool: HandlerPool,
    accept: JoinHandle<()>,
}

impl HttpListener {
    /// Bind and start accepting. TLS is enabled when both `sslKeyFile` and
    /// `sslCertFile` are configured; a broken TLS configuration refuses to
    /// start rather than serving plaintext.
    pub async fn bind(
        settings: ServerSettings,
        service: Arc<dyn RequestHandler>,
    ) -> Result<Self, ServerError> {
        let settings = Arc::new(settings);
        let tls = load_tls_config(&settings)?;

        let host = if settings.host.is_empty() { "0.0.0.0" } else { settings.host.as_str() };
        let address = format!("{}:{}", host, settings.port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ServerError::Bind { address: address.clone(), source })?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, tls = tls.is_some(), "listening");

        let pool = HandlerPool::new(Arc::clone(&settings), service, tls);
        let accept = tokio::spawn(accept_loop(listener, pool.shared()));
        Ok(Self { local_addr, pool, accept })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, then shut the pool down, joining every handler.
    pub async fn close(self) {
        self.accept.abort();
        self.pool.shutdown().await;
        debug!("listener closed");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<PoolShared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(cause = %e, "failed to accept");
                continue;
            }
        };
        match shared.acquire() {
            Some(sender) => {
                if sender
                    .send(HandlerMessage::Connection(stream, peer))
                    .await
                    .is_err()
                {
                    error!(peer = %peer, "connection handler is gone, dropping connection");
                }
            }
            None => {
                debug!(peer = %peer, "too many incoming connections");
                tokio::spawn(reject(stream));
            }
        }
    }
}

/// Saturation reply, written on the raw socket outside the pool.
async fn reject(mut stream: TcpStream) {
    let _ = stream
        .write_all(
            b"HTTP/1.1 503 too many connections\r\nConnection: close\r\n\r\n\
              Too many connections\r\n",
        )
        .await;
    let _ = stream.shutdown().await;
}

/// Build the TLS acceptor from the configured PEM files. Peer verification
/// stays disabled: this terminates TLS, it does not authenticate clients.
fn load_tls_config(settings: &ServerSettings) -> Result<Option<TlsAcceptor>, ServerError> {
    let (key_file, cert_file) = match (&settings.ssl_key_file, &settings.ssl_cert_file) {
        (Some(key_file), Some(cert_file)) => (key_file, cert_file),
        _ => return Ok(None),
    };

    let cert_reader = File::open(cert_file).map_err(|e| ServerError::Tls {
        reason: format!("cannot open sslCertFile {}: {e}", cert_file.display()),
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_reader))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls { reason: format!("cannot parse certificates: {e}") })?;
    if certs.is_empty() {
        return Err(ServerError::Tls {
            reason: format!("no certificates in {}", cert_file.display()),
        });
    }

    let key_reader = File::open(key_file).map_err(|e| ServerError::Tls {
        reason: format!("cannot open sslKeyFile {}: {e}", key_file.display()),
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_reader))
        .map_err(|e| ServerError::Tls { reason: format!("cannot parse private key: {e}") })?
        .ok_or_else(|| ServerError::Tls {
            reason: format!("no private key in {}", key_file.display()),
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls { reason: e.to_string() })?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_is_off_without_both_files() {
        let settings = ServerSettings::default();
        assert!(load_tls_config(&settings).unwrap().is_none());

        let settings = ServerSettings {
            ssl_key_file: Some("key.pem".into()),
            ..ServerSettings::default()
        };
        assert!(load_tls_config(&settings).unwrap().is_none());
    }

    #[test]
    fn missing_cert_file_refuses_to_start() {
        let settings = ServerSettings {
            ssl_key_file: Some("/nonexistent/key.pem".into()),
            ssl_cert_file: Some("/nonexistent/cert.pem".into()),
            ..ServerSettings::default()
        };
        assert!(matches!(
            load_tls_config(&settings),
            Err(ServerError::Tls { .. })
        ));
    }
}
