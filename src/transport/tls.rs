//! TLS transport layer.
//!
//! Wraps an inner transport with rustls. The dialing side verifies the
//! server certificate against either the system store (optionally extended
//! with extra roots) or an explicit CA list; the listening side can require
//! and verify client certificates. Cipher suites are restricted to an
//! ECDHE + AES-GCM/CHACHA20 allowlist.
//!
//! Every TLS connection exposes a peer identifier derived from the first
//! peer certificate: scope `transport.tls`, hex SHA-1 of the DER bytes as
//! the unique id, subject CN as the name, and issuer CN plus the validity
//! window as extras.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::addr::PeerIdentifier;
use crate::config::TlsConfig;
use crate::error::{Error, Result};
use crate::transport::{BoxConn, Conn, Listener, Transport};

/// Default bound on a TLS handshake.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// TLS transport over an arbitrary inner transport.
pub struct TlsTransport {
    inner: Arc<dyn Transport>,
    connector: TlsConnector,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsTransport {
    /// Build from configuration on top of `inner`.
    pub fn new(config: &TlsConfig, inner: Arc<dyn Transport>) -> Result<Self> {
        let certs = load_certs(&config.cert)?;
        let key = load_key(&config.key)?;
        let provider = Arc::new(restricted_provider());

        let roots = build_root_store(config)?;
        let client_config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(rustls::ALL_VERSIONS)
            .map_err(|e| Error::tls(format!("unusable protocol versions: {e}")))?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs.clone(), key.clone_key())
            .map_err(|e| Error::tls(format!("invalid client certificate: {e}")))?;

        let server_builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(rustls::ALL_VERSIONS)
            .map_err(|e| Error::tls(format!("unusable protocol versions: {e}")))?;
        let server_builder = if config.verify_client {
            if config.client_cas.is_empty() {
                return Err(Error::config(
                    "'verify_client' requires at least one entry in 'client_cas'",
                ));
            }
            let mut client_roots = RootCertStore::empty();
            for path in &config.client_cas {
                add_ca(&mut client_roots, path)?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder_with_provider(
                Arc::new(client_roots),
                provider,
            )
            .build()
            .map_err(|e| Error::tls(format!("invalid client verifier: {e}")))?;
            server_builder.with_client_cert_verifier(verifier)
        } else {
            server_builder.with_no_client_auth()
        };
        let server_config = server_builder
            .with_single_cert(certs, key)
            .map_err(|e| Error::tls(format!("invalid server certificate: {e}")))?;

        let handshake_timeout = match config.handshake_timeout_secs {
            None => DEFAULT_HANDSHAKE_TIMEOUT,
            Some(0) => return Err(Error::config("handshake_timeout must be > 0")),
            Some(secs) => Duration::from_secs(secs),
        };

        Ok(TlsTransport {
            inner,
            connector: TlsConnector::from(Arc::new(client_config)),
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            handshake_timeout,
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn dial(&self, addr: &str) -> Result<BoxConn> {
        let conn = self.inner.dial(addr).await?;
        let peer_text = conn.peer_addr_text();

        let host = addr
            .rsplit_once(':')
            .map(|(h, _)| h.trim_matches(['[', ']']))
            .unwrap_or(addr);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::tls(format!("invalid TLS server name: {host}")))?;

        let stream = tokio::time::timeout(
            self.handshake_timeout,
            self.connector.connect(server_name, conn),
        )
        .await
        .map_err(|_| Error::Timeout(self.handshake_timeout.as_millis() as u64))?
        .map_err(|e| Error::tls(format!("handshake failed: {e}")))?;

        Ok(Box::new(TlsClientConn {
            stream,
            peer_text,
            identity: OnceLock::new(),
        }))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let inner = self.inner.listen(addr).await?;
        Ok(Box::new(TlsListener {
            inner,
            acceptor: self.acceptor.clone(),
            handshake_timeout: self.handshake_timeout,
        }))
    }
}

struct TlsListener {
    inner: Box<dyn Listener>,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

#[async_trait]
impl Listener for TlsListener {
    async fn accept(&mut self) -> Result<BoxConn> {
        let conn = self.inner.accept().await?;
        let peer_text = conn.peer_addr_text();
        let acceptor = self.acceptor.clone();
        let timeout = self.handshake_timeout;

        // the handshake is deferred to the first read or write so one
        // stalling client cannot hold up the accept loop
        let handshake = Box::pin(async move {
            match tokio::time::timeout(timeout, acceptor.accept(conn)).await {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "TLS handshake timed out",
                )),
            }
        });

        Ok(Box::new(TlsServerConn {
            state: ServerState::Handshaking(handshake),
            peer_text,
            identity: OnceLock::new(),
        }))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Dial-side TLS connection.
pub struct TlsClientConn {
    stream: tokio_rustls::client::TlsStream<BoxConn>,
    peer_text: String,
    identity: OnceLock<Option<PeerIdentifier>>,
}

impl AsyncRead for TlsClientConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsClientConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl Conn for TlsClientConn {
    fn peer_identifiers(&self) -> Result<Vec<PeerIdentifier>> {
        let id = self.identity.get_or_init(|| {
            let (_, session) = self.stream.get_ref();
            session.peer_certificates().and_then(identity_from_certs)
        });
        Ok(id.iter().cloned().collect())
    }

    fn peer_addr_text(&self) -> String {
        self.peer_text.clone()
    }
}

type HandshakeFuture =
    Pin<Box<dyn std::future::Future<Output = io::Result<tokio_rustls::server::TlsStream<BoxConn>>> + Send>>;

enum ServerState {
    Handshaking(HandshakeFuture),
    Ready(tokio_rustls::server::TlsStream<BoxConn>),
    Failed,
}

/// Accept-side TLS connection with a lazily driven handshake.
pub struct TlsServerConn {
    state: ServerState,
    peer_text: String,
    identity: OnceLock<Option<PeerIdentifier>>,
}

impl TlsServerConn {
    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<&mut tokio_rustls::server::TlsStream<BoxConn>>> {
        if let ServerState::Handshaking(future) = &mut self.state {
            match future.as_mut().poll(cx) {
                Poll::Ready(Ok(stream)) => self.state = ServerState::Ready(stream),
                Poll::Ready(Err(e)) => {
                    self.state = ServerState::Failed;
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        match &mut self.state {
            ServerState::Ready(stream) => Poll::Ready(Ok(stream)),
            ServerState::Failed => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            ServerState::Handshaking(_) => unreachable!("handshake settled above"),
        }
    }
}

impl AsyncRead for TlsServerConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let stream = match this.poll_ready(cx) {
            Poll::Ready(Ok(s)) => s,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        Pin::new(stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsServerConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let stream = match this.poll_ready(cx) {
            Poll::Ready(Ok(s)) => s,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        Pin::new(stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            ServerState::Handshaking(_) | ServerState::Failed => Poll::Ready(Ok(())),
            ServerState::Ready(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            ServerState::Handshaking(_) | ServerState::Failed => Poll::Ready(Ok(())),
            ServerState::Ready(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl Conn for TlsServerConn {
    fn peer_identifiers(&self) -> Result<Vec<PeerIdentifier>> {
        // no identity before the handshake settles; do not cache that
        let stream = match &self.state {
            ServerState::Ready(stream) => stream,
            _ => return Ok(Vec::new()),
        };
        let id = self.identity.get_or_init(|| {
            let (_, session) = stream.get_ref();
            session.peer_certificates().and_then(identity_from_certs)
        });
        Ok(id.iter().cloned().collect())
    }

    fn peer_addr_text(&self) -> String {
        self.peer_text.clone()
    }
}

/// Cipher-suite allowlist: ECDHE with AEAD only, plus the TLS 1.3 set.
fn restricted_provider() -> rustls::crypto::CryptoProvider {
    use rustls::CipherSuite::*;
    const ALLOWED: &[rustls::CipherSuite] = &[
        TLS13_AES_256_GCM_SHA384,
        TLS13_AES_128_GCM_SHA256,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ];

    let mut provider = rustls::crypto::ring::default_provider();
    provider
        .cipher_suites
        .retain(|suite| ALLOWED.contains(&suite.suite()));
    provider
}

fn build_root_store(config: &TlsConfig) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    if config.cas.is_empty() {
        if cfg!(windows) && !config.extra_cas.is_empty() {
            return Err(Error::config(
                "adding extra CA(s) to the system default CA pool \
                 is not supported on Windows",
            ));
        }
        let native = rustls_native_certs::load_native_certs()
            .map_err(|e| Error::tls(format!("failed to load system CA pool: {e}")))?;
        for cert in native {
            // tolerate individual unparsable store entries
            let _ = roots.add(cert);
        }
    }
    for path in config.cas.iter().chain(&config.extra_cas) {
        add_ca(&mut roots, path)?;
    }
    Ok(roots)
}

fn add_ca(store: &mut RootCertStore, path: &str) -> Result<()> {
    for cert in load_certs(path)? {
        store
            .add(cert)
            .map_err(|e| Error::tls(format!("failed to add {path} to the CA list: {e}")))?;
    }
    Ok(())
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::config(format!("cannot read certificate {path}: {e}")))?;
    let certs: std::result::Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut data.as_slice()).collect();
    let certs = certs.map_err(|e| Error::tls(format!("cannot parse {path}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::tls(format!("no certificates found in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::config(format!("cannot read key {path}: {e}")))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| Error::tls(format!("cannot parse {path}: {e}")))?
        .ok_or_else(|| Error::tls(format!("no private key found in {path}")))
}

fn identity_from_certs(certs: &[CertificateDer<'_>]) -> Option<PeerIdentifier> {
    let cert = certs.first()?;
    let fingerprint = hex::encode(Sha1::digest(cert.as_ref()));

    let mut id = PeerIdentifier::new(PeerIdentifier::SCOPE_TLS, fingerprint);
    if let Ok((_, parsed)) = x509_parser::parse_x509_certificate(cert.as_ref()) {
        if let Some(cn) = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
        {
            id.name = cn.to_string();
        }
        if let Some(issuer) = parsed
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
        {
            id.extra
                .insert("tls_issued_by".to_string(), issuer.to_string());
        }
        let validity = parsed.validity();
        id.extra.insert(
            "tls_valid_from".to_string(),
            validity.not_before.to_string(),
        );
        id.extra.insert(
            "tls_valid_until".to_string(),
            validity.not_after.to_string(),
        );
    }
    Some(id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::TcpTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Test certificate material written to disk, as the config refers to
    /// files.
    pub(crate) struct TestPki {
        pub dir: std::path::PathBuf,
        pub ca: std::path::PathBuf,
        pub server_cert: std::path::PathBuf,
        pub server_key: std::path::PathBuf,
        pub client_cert: std::path::PathBuf,
        pub client_key: std::path::PathBuf,
    }

    impl TestPki {
        pub(crate) fn generate(tag: &str) -> TestPki {
            let ca_key = rcgen::KeyPair::generate().unwrap();
            let mut ca_params = rcgen::CertificateParams::new(Vec::new()).unwrap();
            ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            ca_params
                .distinguished_name
                .push(rcgen::DnType::CommonName, "portcullis test ca");
            let ca_cert = ca_params.self_signed(&ca_key).unwrap();

            let server_key = rcgen::KeyPair::generate().unwrap();
            let mut server_params =
                rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
            server_params
                .distinguished_name
                .push(rcgen::DnType::CommonName, "localhost");
            let server_cert = server_params
                .signed_by(&server_key, &ca_cert, &ca_key)
                .unwrap();

            let client_key = rcgen::KeyPair::generate().unwrap();
            let mut client_params =
                rcgen::CertificateParams::new(vec!["client.test".to_string()]).unwrap();
            client_params
                .distinguished_name
                .push(rcgen::DnType::CommonName, "client.test");
            let client_cert = client_params
                .signed_by(&client_key, &ca_cert, &ca_key)
                .unwrap();

            let dir = std::env::temp_dir().join(format!(
                "portcullis-pki-{}-{}",
                std::process::id(),
                tag
            ));
            std::fs::create_dir_all(&dir).unwrap();
            let write = |name: &str, data: String| {
                let path = dir.join(name);
                std::fs::write(&path, data).unwrap();
                path
            };
            TestPki {
                ca: write("ca.pem", ca_cert.pem()),
                server_cert: write("server.pem", server_cert.pem()),
                server_key: write("server.key.pem", server_key.serialize_pem()),
                client_cert: write("client.pem", client_cert.pem()),
                client_key: write("client.key.pem", client_key.serialize_pem()),
                dir,
            }
        }

        pub(crate) fn server_config(&self, verify_client: bool) -> TlsConfig {
            TlsConfig {
                cert: self.server_cert.to_string_lossy().into_owned(),
                key: self.server_key.to_string_lossy().into_owned(),
                verify_client,
                cas: vec![self.ca.to_string_lossy().into_owned()],
                extra_cas: Vec::new(),
                client_cas: if verify_client {
                    vec![self.ca.to_string_lossy().into_owned()]
                } else {
                    Vec::new()
                },
                handshake_timeout_secs: Some(5),
            }
        }

        pub(crate) fn client_config(&self) -> TlsConfig {
            TlsConfig {
                cert: self.client_cert.to_string_lossy().into_owned(),
                key: self.client_key.to_string_lossy().into_owned(),
                verify_client: false,
                cas: vec![self.ca.to_string_lossy().into_owned()],
                extra_cas: Vec::new(),
                client_cas: Vec::new(),
                handshake_timeout_secs: Some(5),
            }
        }
    }

    impl Drop for TestPki {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[tokio::test]
    async fn test_tls_echo_with_mutual_auth() {
        let pki = TestPki::generate("echo");
        let server =
            TlsTransport::new(&pki.server_config(true), Arc::new(TcpTransport)).unwrap();
        let client =
            TlsTransport::new(&pki.client_config(), Arc::new(TcpTransport)).unwrap();

        let mut listener = server.listen("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server_task = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
            conn.peer_identifiers().unwrap()
        });

        let mut conn = client.dial(&format!("localhost:{port}")).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // dial side sees the server leaf
        let ids = conn.peer_identifiers().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].scope, PeerIdentifier::SCOPE_TLS);
        assert_eq!(ids[0].name, "localhost");
        assert_eq!(ids[0].unique_id.len(), 40); // hex sha-1
        assert!(ids[0].extra.contains_key("tls_issued_by"));

        // accept side sees the client leaf
        let server_ids = server_task.await.unwrap();
        assert_eq!(server_ids.len(), 1);
        assert_eq!(server_ids[0].name, "client.test");
    }

    #[tokio::test]
    async fn test_untrusted_server_is_rejected() {
        let pki = TestPki::generate("untrusted");
        let other = TestPki::generate("other-ca");

        let server =
            TlsTransport::new(&pki.server_config(false), Arc::new(TcpTransport)).unwrap();
        // the client only trusts an unrelated CA
        let client =
            TlsTransport::new(&other.client_config(), Arc::new(TcpTransport)).unwrap();

        let mut listener = server.listen("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok(mut conn) = listener.accept().await {
                let mut buf = [0u8; 1];
                let _ = conn.read(&mut buf).await;
            }
        });

        assert!(client.dial(&format!("localhost:{port}")).await.is_err());
    }

    #[test]
    fn test_verify_client_requires_client_cas() {
        let pki = TestPki::generate("no-client-cas");
        let mut config = pki.server_config(true);
        config.client_cas.clear();
        assert!(TlsTransport::new(&config, Arc::new(TcpTransport)).is_err());
    }
}
