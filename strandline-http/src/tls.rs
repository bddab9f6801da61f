//! Secure channel provider: TLS handshakes and record I/O over a
//! [`TcpChannel`].
//!
//! The client only talks to the [`SecureChannelProvider`] and
//! [`SecureSession`] traits. [`RustlsProvider`] is the default.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use crate::error::HttpError;
use crate::target::{Security, Target};
use crate::transport::{Liveness, TcpChannel};

/// Application protocols offered during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alpn {
    Http11,
    H2OrHttp11,
}

impl Alpn {
    pub fn protocols(self) -> &'static [&'static [u8]] {
        match self {
            Alpn::Http11 => &[b"http/1.1"],
            Alpn::H2OrHttp11 => &[b"h2", b"http/1.1"],
        }
    }
}

/// Establishes secure sessions over connected channels.
pub trait SecureChannelProvider: Send + Sync {
    /// Run the handshake for `target` over `channel`, offering `alpn`.
    fn establish(
        &self,
        channel: &mut TcpChannel,
        target: &Target,
        alpn: Alpn,
    ) -> Result<Box<dyn SecureSession>, HttpError>;
}

/// An established secure session. Record I/O goes through the channel
/// passed to each call.
pub trait SecureSession: Send {
    /// Protocol selected by the server, if any.
    fn alpn_protocol(&self) -> Option<&[u8]>;

    fn write_all(&mut self, channel: &mut TcpChannel, data: &[u8]) -> io::Result<()>;

    /// Read decrypted bytes. `Ok(0)` means the peer closed the session.
    fn read(&mut self, channel: &mut TcpChannel, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking check that an idle session is still usable.
    fn probe(&mut self, channel: &mut TcpChannel) -> io::Result<Liveness>;

    /// Best-effort close_notify.
    fn close(&mut self, channel: &mut TcpChannel);
}

/// rustls-backed provider.
///
/// Client configs are built once per (security identity, ALPN list) and
/// cached. Targets without a trust anchor use the web PKI roots.
pub struct RustlsProvider {
    crypto: Arc<CryptoProvider>,
    configs: Mutex<HashMap<(String, Alpn), Arc<rustls::ClientConfig>>>,
}

impl Default for RustlsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RustlsProvider {
    pub fn new() -> Self {
        Self {
            crypto: Arc::new(rustls::crypto::ring::default_provider()),
            configs: Mutex::new(HashMap::new()),
        }
    }

    fn client_config(
        &self,
        target: &Target,
        alpn: Alpn,
    ) -> Result<Arc<rustls::ClientConfig>, HttpError> {
        let key = (target.security_identity(), alpn);
        let mut configs = self.configs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(config) = configs.get(&key) {
            return Ok(config.clone());
        }
        let config = Arc::new(self.build_config(target.security(), alpn)?);
        configs.insert(key, config.clone());
        Ok(config)
    }

    fn build_config(
        &self,
        security: &Security,
        alpn: Alpn,
    ) -> Result<rustls::ClientConfig, HttpError> {
        let Security::Secure {
            verify_peer,
            trust_anchor,
        } = security
        else {
            return Err(HttpError::Config("plain target has no TLS settings".into()));
        };

        let builder = rustls::ClientConfig::builder_with_provider(self.crypto.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| HttpError::Config(format!("tls: {e}")))?;

        let mut config = if *verify_peer {
            let roots = match trust_anchor {
                Some(path) => load_trust_anchors(path)?,
                None => {
                    let mut roots = RootCertStore::empty();
                    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                    roots
                }
            };
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(self.crypto.clone())))
                .with_no_client_auth()
        };
        config.alpn_protocols = alpn.protocols().iter().map(|p| p.to_vec()).collect();
        Ok(config)
    }
}

impl SecureChannelProvider for RustlsProvider {
    fn establish(
        &self,
        channel: &mut TcpChannel,
        target: &Target,
        alpn: Alpn,
    ) -> Result<Box<dyn SecureSession>, HttpError> {
        let config = self.client_config(target, alpn)?;
        let server_name = ServerName::try_from(target.host().to_string()).map_err(|e| {
            HttpError::InvalidArgument(format!("invalid server name {}: {e}", target.host()))
        })?;

        let mut conn = rustls::ClientConnection::new(config, server_name)?;
        while conn.is_handshaking() {
            conn.complete_io(channel).map_err(handshake_error)?;
        }

        debug!(
            %target,
            alpn = ?conn.alpn_protocol().map(String::from_utf8_lossy),
            version = ?conn.protocol_version(),
            "tls handshake complete"
        );
        Ok(Box::new(RustlsSession { conn }))
    }
}

fn load_trust_anchors(path: &Path) -> Result<RootCertStore, HttpError> {
    let bad = |e: &dyn std::fmt::Display| {
        HttpError::Config(format!("trust anchor {}: {e}", path.display()))
    };

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(path).map_err(|e| bad(&e))? {
        roots.add(cert.map_err(|e| bad(&e))?).map_err(|e| bad(&e))?;
    }
    if roots.is_empty() {
        return Err(bad(&"no certificates found"));
    }
    Ok(roots)
}

/// Surface rustls alerts as TLS errors rather than generic I/O failures.
fn handshake_error(e: io::Error) -> HttpError {
    if let Some(tls) = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        return HttpError::Tls(tls.clone());
    }
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => HttpError::Timeout,
        _ => HttpError::Connect(e),
    }
}

struct RustlsSession {
    conn: rustls::ClientConnection,
}

impl SecureSession for RustlsSession {
    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    fn write_all(&mut self, channel: &mut TcpChannel, data: &[u8]) -> io::Result<()> {
        let mut stream = rustls::Stream::new(&mut self.conn, channel);
        stream.write_all(data)?;
        stream.flush()
    }

    fn read(&mut self, channel: &mut TcpChannel, buf: &mut [u8]) -> io::Result<usize> {
        match rustls::Stream::new(&mut self.conn, channel).read(buf) {
            // Peers that skip close_notify still end close-delimited
            // bodies; the framer decides whether the body was complete.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
            other => other,
        }
    }

    fn probe(&mut self, channel: &mut TcpChannel) -> io::Result<Liveness> {
        channel.set_nonblocking(true)?;
        let result = self.drain_idle_records(channel);
        channel.set_nonblocking(false)?;
        result
    }

    fn close(&mut self, channel: &mut TcpChannel) {
        self.conn.send_close_notify();
        while self.conn.wants_write() {
            if self.conn.write_tls(channel).is_err() {
                break;
            }
        }
    }
}

impl RustlsSession {
    /// Process records that arrived while idle (session tickets, alerts).
    /// Application data at this point means the stream is out of sync.
    fn drain_idle_records(&mut self, channel: &mut TcpChannel) -> io::Result<Liveness> {
        loop {
            match self.conn.read_tls(channel) {
                Ok(0) => return Ok(Liveness::Closed),
                Ok(_) => {
                    let state = self.conn.process_new_packets().map_err(io::Error::other)?;
                    if state.plaintext_bytes_to_read() > 0 {
                        return Ok(Liveness::Unexpected);
                    }
                    if state.peer_has_closed() {
                        return Ok(Liveness::Closed);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Liveness::Alive),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Accepts any certificate. Signatures are still checked so the handshake
/// transcript stays bound to the presented key.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
