//! TLS transport to the collection server
//!
//! TCP connect under a timeout, keepalive on the socket, then a rustls
//! handshake. Server certificates are verified against `tls.ca_file` when
//! set, otherwise against the bundled webpki roots.

use super::{Connector, DeliveryError};
use crate::config::{defaults, GatewayConfig};
use async_trait::async_trait;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerName};
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Production [`Connector`]: TLS over TCP.
#[derive(Clone)]
pub struct TlsConnector {
    host: String,
    port: u16,
    server_name: ServerName,
    connect_timeout: Duration,
    client_config: Arc<ClientConfig>,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("server_name", &self.server_name)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl TlsConnector {
    /// Build the rustls client config once from the gateway config.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, DeliveryError> {
        let name = config
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| config.server.host.clone());
        let server_name = ServerName::try_from(name.as_str())
            .map_err(|e| DeliveryError::Tls(format!("invalid server name '{}': {}", name, e)))?;

        let roots = if config.tls.insecure_skip_verify {
            RootCertStore::empty()
        } else {
            match &config.tls.ca_file {
                Some(path) => load_ca_roots(path)?,
                None => webpki_root_store(),
            }
        };
        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots);

        let mut client_config = match (&config.tls.cert_file, &config.tls.key_file) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| DeliveryError::Tls(format!("client certificate rejected: {}", e)))?
            }
            _ => builder.with_no_client_auth(),
        };

        if config.tls.insecure_skip_verify {
            tracing::warn!(
                server = %config.server.address(),
                "TLS certificate verification DISABLED, server identity is not checked"
            );
            client_config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyServerCert));
        }

        Ok(Self {
            host: config.server.host.clone(),
            port: config.server.port,
            server_name,
            connect_timeout: config.server.connect_timeout(),
            client_config: Arc::new(client_config),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    type Stream = TlsStream<TcpStream>;

    async fn connect(&self) -> Result<Self::Stream, DeliveryError> {
        let addr = self.endpoint();
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DeliveryError::ConnectTimeout(self.connect_timeout))??;

        // Detect half-dead links during long ack waits
        let sock_ref = socket2::SockRef::from(&tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(defaults::TCP_KEEPALIVE_TIME_SECS))
            .with_interval(Duration::from_secs(defaults::TCP_KEEPALIVE_INTERVAL_SECS));
        let _ = sock_ref.set_tcp_keepalive(&keepalive);
        let _ = tcp.set_nodelay(true);

        let connector = tokio_rustls::TlsConnector::from(Arc::clone(&self.client_config));
        let handshake = connector.connect(self.server_name.clone(), tcp);
        let stream = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| DeliveryError::ConnectTimeout(self.connect_timeout))?
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidData | ErrorKind::Other => DeliveryError::Handshake(e.to_string()),
                _ => e.into(),
            })?;

        tracing::debug!(endpoint = %addr, "TLS handshake complete");
        Ok(stream)
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Certificate Loading
// ============================================================================

fn webpki_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    roots
}

fn open_pem(path: &Path) -> Result<BufReader<File>, DeliveryError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| DeliveryError::Tls(format!("cannot open {}: {}", path.display(), e)))
}

fn load_ca_roots(path: &Path) -> Result<RootCertStore, DeliveryError> {
    let ders = rustls_pemfile::certs(&mut open_pem(path)?)
        .map_err(|e| DeliveryError::Tls(format!("cannot parse {}: {}", path.display(), e)))?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(&ders);
    if ignored > 0 {
        tracing::warn!(path = %path.display(), ignored, "Skipped unparsable CA certificates");
    }
    if added == 0 {
        return Err(DeliveryError::Tls(format!(
            "no usable CA certificates in {}",
            path.display()
        )));
    }
    tracing::info!(path = %path.display(), certificates = added, "Loaded CA bundle");
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, DeliveryError> {
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut open_pem(path)?)
        .map_err(|e| DeliveryError::Tls(format!("cannot parse {}: {}", path.display(), e)))?
        .into_iter()
        .map(Certificate)
        .collect();
    if certs.is_empty() {
        return Err(DeliveryError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKey, DeliveryError> {
    let mut reader = open_pem(path)?;
    loop {
        let item = rustls_pemfile::read_one(&mut reader)
            .map_err(|e| DeliveryError::Tls(format!("cannot parse {}: {}", path.display(), e)))?;
        match item {
            Some(rustls_pemfile::Item::PKCS8Key(key))
            | Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(PrivateKey(key)),
            Some(_) => continue,
            None => {
                return Err(DeliveryError::Tls(format!(
                    "no private key in {}",
                    path.display()
                )))
            }
        }
    }
}

/// Verifier used when `tls.insecure_skip_verify` is set.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_uses_webpki_roots() {
        let connector = TlsConnector::from_config(&GatewayConfig::default()).unwrap();
        assert_eq!(connector.endpoint(), "localhost:8443");
    }

    #[test]
    fn test_insecure_mode_builds() {
        let mut config = GatewayConfig::default();
        config.tls.insecure_skip_verify = true;
        assert!(TlsConnector::from_config(&config).is_ok());
    }

    #[test]
    fn test_insecure_mode_ignores_ca_file() {
        let mut config = GatewayConfig::default();
        config.tls.insecure_skip_verify = true;
        config.tls.ca_file = Some("/nonexistent/ca.pem".into());
        assert!(TlsConnector::from_config(&config).is_ok());
    }

    #[test]
    fn test_missing_ca_file_is_tls_error() {
        let mut config = GatewayConfig::default();
        config.tls.ca_file = Some("/nonexistent/ca.pem".into());
        let err = TlsConnector::from_config(&config).unwrap_err();
        assert!(matches!(err, DeliveryError::Tls(_)));
        assert!(!err.is_connection_failure());
    }

    #[test]
    fn test_ca_file_without_certificates_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a pem bundle").unwrap();
        let mut config = GatewayConfig::default();
        config.tls.ca_file = Some(file.path().to_path_buf());
        assert!(matches!(
            TlsConnector::from_config(&config),
            Err(DeliveryError::Tls(_))
        ));
    }

    #[test]
    fn test_server_name_override() {
        let mut config = GatewayConfig::default();
        config.server.host = "10.0.0.5".to_string();
        config.tls.server_name = Some("collector.example.net".to_string());
        let connector = TlsConnector::from_config(&config).unwrap();
        assert_eq!(connector.endpoint(), "10.0.0.5:8443");
        assert!(matches!(connector.server_name, ServerName::DnsName(_)));
    }

    #[tokio::test]
    async fn test_closed_port_is_connection_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = GatewayConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = port;
        config.server.connect_timeout_secs = 2;
        let connector = TlsConnector::from_config(&config).unwrap();

        let err = connector.connect().await.unwrap_err();
        assert!(err.is_connection_failure(), "unexpected error: {}", err);
    }
}
