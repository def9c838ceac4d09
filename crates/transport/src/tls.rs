use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned,
};
use tracing::debug;

use crate::connection::{Connection, Listener, ShutdownHow};
use crate::error::{TransportError, TransportResult};

/// How long the non-blocking accept loop sleeps between polls.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Certificate material shared by the listening and connecting sides.
///
/// Both peers present a certificate and verify the other against the same
/// trusted-CA store, so every connection is mutually authenticated.
#[derive(Clone)]
pub struct TlsContext {
    server_config: Arc<ServerConfig>,
    client_config: Arc<ClientConfig>,
}

impl TlsContext {
    /// Loads the certificate, private key and trusted-CA files and builds
    /// configurations for both connection directions.
    pub fn from_files(
        certificate: &Path,
        private_key: &Path,
        trusted_cas: &Path,
    ) -> TransportResult<Self> {
        let certs = load_certs(certificate)?;
        let key = load_private_key(private_key)?;
        let roots = load_root_store(trusted_cas)?;

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots.clone()))
            .build()
            .map_err(|err| TransportError::CertificateInvalid(err.to_string()))?;

        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|err| TransportError::CertificateInvalid(err.to_string()))?;

        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|err| TransportError::CertificateInvalid(err.to_string()))?;

        Ok(Self {
            server_config: Arc::new(server_config),
            client_config: Arc::new(client_config),
        })
    }

    /// Binds a TLS listener on `addr`.
    pub fn listen(&self, addr: SocketAddr) -> TransportResult<TlsListener> {
        let listener = TcpListener::bind(addr).map_err(TransportError::Connect)?;
        listener
            .set_nonblocking(true)
            .map_err(TransportError::Connect)?;
        Ok(TlsListener {
            listener,
            config: Arc::clone(&self.server_config),
        })
    }

    /// Connects to `addr`, verifying the server as `hostname`, and completes
    /// the TLS handshake within `timeout`.
    pub fn connect(
        &self,
        hostname: &str,
        addr: SocketAddr,
        timeout: Duration,
    ) -> TransportResult<TlsConnection> {
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(TransportError::Connect)?;
        let server_name = ServerName::try_from(hostname.to_owned())
            .map_err(|err| TransportError::CertificateInvalid(err.to_string()))?;
        let conn = ClientConnection::new(Arc::clone(&self.client_config), server_name)
            .map_err(|err| TransportError::Handshake(err.to_string()))?;
        TlsConnection::complete_client(conn, tcp, timeout)
    }
}

/// Accepts TLS connections for the store daemon.
pub struct TlsListener {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl Listener for TlsListener {
    type Conn = TlsConnection;

    fn accept(&mut self, timeout: Duration) -> TransportResult<Option<TlsConnection>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((tcp, peer)) => {
                    debug!(%peer, "inbound connection");
                    tcp.set_nonblocking(false).map_err(TransportError::Connect)?;
                    let conn = ServerConnection::new(Arc::clone(&self.config))
                        .map_err(|err| TransportError::Handshake(err.to_string()))?;
                    return TlsConnection::complete_server(conn, tcp, timeout).map(Some);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL.min(remaining));
                }
                Err(err) => return Err(TransportError::Connect(err)),
            }
        }
    }
}

enum TlsSide {
    Server(StreamOwned<ServerConnection, TcpStream>),
    Client(StreamOwned<ClientConnection, TcpStream>),
}

impl TlsSide {
    fn sock(&self) -> &TcpStream {
        match self {
            Self::Server(stream) => &stream.sock,
            Self::Client(stream) => &stream.sock,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Server(stream) => stream.read(buf),
            Self::Client(stream) => stream.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Server(stream) => stream.write(buf),
            Self::Client(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Server(stream) => stream.flush(),
            Self::Client(stream) => stream.flush(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Server(stream) => stream.conn.send_close_notify(),
            Self::Client(stream) => stream.conn.send_close_notify(),
        }
    }
}

/// One authenticated TLS connection with deadline-aware I/O.
pub struct TlsConnection {
    side: TlsSide,
    peer_common_name: Option<String>,
}

impl TlsConnection {
    fn complete_server(
        mut conn: ServerConnection,
        mut tcp: TcpStream,
        timeout: Duration,
    ) -> TransportResult<Self> {
        set_handshake_timeouts(&tcp, timeout)?;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)
                .map_err(|err| TransportError::Handshake(err.to_string()))?;
        }
        let peer_common_name = extract_common_name(conn.peer_certificates())?;
        Ok(Self {
            side: TlsSide::Server(StreamOwned::new(conn, tcp)),
            peer_common_name,
        })
    }

    fn complete_client(
        mut conn: ClientConnection,
        mut tcp: TcpStream,
        timeout: Duration,
    ) -> TransportResult<Self> {
        set_handshake_timeouts(&tcp, timeout)?;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)
                .map_err(|err| TransportError::Handshake(err.to_string()))?;
        }
        let peer_common_name = extract_common_name(conn.peer_certificates())?;
        Ok(Self {
            side: TlsSide::Client(StreamOwned::new(conn, tcp)),
            peer_common_name,
        })
    }
}

impl Connection for TlsConnection {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        self.side
            .sock()
            .set_read_timeout(Some(clamp_timeout(timeout)))
            .map_err(TransportError::Read)?;
        match self.side.read(buf) {
            Ok(n) => Ok(n),
            // A timed-out read yields 0 bytes without error, like a clean
            // half-close.
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(err) => Err(TransportError::Read(err)),
        }
    }

    fn write_all(&mut self, buf: &[u8], timeout: Duration) -> TransportResult<()> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        while written < buf.len() {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(TransportError::Timeout)?;
            self.side
                .sock()
                .set_write_timeout(Some(clamp_timeout(remaining)))
                .map_err(TransportError::Write)?;
            match self.side.write(&buf[written..]) {
                Ok(0) => {
                    return Err(TransportError::Write(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    )));
                }
                Ok(n) => written += n,
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return Err(TransportError::Timeout);
                    }
                }
                Err(err) => return Err(TransportError::Write(err)),
            }
        }
        self.side.flush().map_err(TransportError::Write)
    }

    fn peer_common_name(&self) -> Option<&str> {
        self.peer_common_name.as_deref()
    }

    fn shutdown(&mut self, how: ShutdownHow) -> TransportResult<()> {
        let map = |err: io::Error| {
            if err.kind() == io::ErrorKind::NotConnected {
                Ok(())
            } else {
                Err(TransportError::Write(err))
            }
        };
        match how {
            ShutdownHow::Read => self.side.sock().shutdown(Shutdown::Read).map_or_else(map, Ok),
            ShutdownHow::Write => {
                self.side.send_close_notify();
                let _ = self.side.flush();
                self.side.sock().shutdown(Shutdown::Write).map_or_else(map, Ok)
            }
            ShutdownHow::Both => {
                self.side.send_close_notify();
                let _ = self.side.flush();
                self.side.sock().shutdown(Shutdown::Both).map_or_else(map, Ok)
            }
        }
    }
}

fn set_handshake_timeouts(tcp: &TcpStream, timeout: Duration) -> TransportResult<()> {
    let timeout = Some(clamp_timeout(timeout));
    tcp.set_read_timeout(timeout)
        .and_then(|()| tcp.set_write_timeout(timeout))
        .map_err(TransportError::Connect)
}

// A zero duration would disable the socket timeout entirely.
fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

fn extract_common_name(
    certs: Option<&[CertificateDer<'_>]>,
) -> TransportResult<Option<String>> {
    let Some(cert) = certs.and_then(<[CertificateDer<'_>]>::first) else {
        return Ok(None);
    };
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|err| TransportError::CertificateInvalid(err.to_string()))?;
    Ok(parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(ToOwned::to_owned))
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path)?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|err| bad_material(path, &err.to_string()))?;
    if certs.is_empty() {
        return Err(bad_material(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| bad_material(path, &err.to_string()))?
        .ok_or_else(|| bad_material(path, "no private key found"))
}

fn load_root_store(path: &Path) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|err| bad_material(path, &err.to_string()))?;
    }
    Ok(roots)
}

fn open_pem(path: &Path) -> TransportResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|err| bad_material(path, &err.to_string()))
}

fn bad_material(path: &Path, reason: &str) -> TransportError {
    TransportError::BadTlsMaterial {
        path: PathBuf::from(path).display().to_string(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn missing_certificate_file_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.pem");
        let err = load_certs(&missing).unwrap_err();
        assert!(err.to_string().contains("nope.pem"));
    }

    #[test]
    fn empty_pem_has_no_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        File::create(&path).unwrap().write_all(b"").unwrap();
        let err = load_certs(&path).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
    }

    #[test]
    fn zero_timeout_is_clamped() {
        assert_eq!(clamp_timeout(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(
            clamp_timeout(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }
}
