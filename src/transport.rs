//! byte-stream unification over plain TCP and TLS
//!
//! both variants expose the same non-blocking contract, so the socket layer
//! never cares which one it drives. TLS handshakes ride the same two calls:
//! a read may demand write readiness and vice versa, surfaced as
//! [`Transfer::WantRead`] / [`Transfer::WantWrite`] for the poller to act on.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::Shutdown;
use std::path::Path;
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use crate::errors::WsError;

/// outcome of one non-blocking read or write attempt
#[derive(Debug)]
pub(crate) enum Transfer {
    /// bytes moved
    Done(usize),
    /// retry on read readiness
    WantRead,
    /// retry on write readiness
    WantWrite,
    /// orderly end of stream
    Eof,
    /// unrecoverable transport failure
    Fatal(io::Error),
}

/// a TLS session riding a non-blocking TCP stream
pub(crate) struct TlsSession {
    stream: TcpStream,
    conn: Connection,
}

pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsSession>),
}

impl Transport {
    pub fn plain(stream: TcpStream) -> Self {
        Transport::Plain(stream)
    }

    pub fn tls_server(stream: TcpStream, config: Arc<ServerConfig>) -> Result<Self, WsError> {
        let conn = ServerConnection::new(config).map_err(|e| WsError::Tls(e.to_string()))?;
        Ok(Transport::Tls(Box::new(TlsSession {
            stream,
            conn: Connection::Server(conn),
        })))
    }

    pub fn tls_client(
        stream: TcpStream,
        config: Arc<ClientConfig>,
        host: &str,
    ) -> Result<Self, WsError> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| WsError::Tls(format!("invalid server name: {e}")))?;
        let conn = ClientConnection::new(config, name).map_err(|e| WsError::Tls(e.to_string()))?;
        Ok(Transport::Tls(Box::new(TlsSession {
            stream,
            conn: Connection::Client(conn),
        })))
    }

    /// underlying socket, used for poller registration and addresses
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(t) => &mut t.stream,
        }
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        match self {
            Transport::Plain(s) => s.peer_addr(),
            Transport::Tls(t) => t.stream.peer_addr(),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Transfer {
        match self {
            Transport::Plain(s) => loop {
                match s.read(buf) {
                    Ok(0) => return Transfer::Eof,
                    Ok(n) => return Transfer::Done(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Transfer::WantRead,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Transfer::Fatal(e),
                }
            },
            Transport::Tls(t) => t.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Transfer {
        match self {
            Transport::Plain(s) => loop {
                match s.write(buf) {
                    Ok(n) => return Transfer::Done(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Transfer::WantWrite,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Transfer::Fatal(e),
                }
            },
            Transport::Tls(t) => t.write(buf),
        }
    }

    /// push buffered TLS output (handshake records, close_notify) to the
    /// wire, a no-op for plain streams
    pub fn flush(&mut self) -> Transfer {
        match self {
            Transport::Plain(_) => Transfer::Done(0),
            Transport::Tls(t) => {
                while t.conn.wants_write() {
                    match t.conn.write_tls(&mut t.stream) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Transfer::WantWrite
                        }
                        Err(e) => return Transfer::Fatal(e),
                    }
                }
                Transfer::Done(0)
            }
        }
    }

    /// graceful close: close_notify for TLS, write half-close for plain
    pub fn shutdown(&mut self) {
        match self {
            Transport::Plain(s) => {
                let _ = s.shutdown(Shutdown::Write);
            }
            Transport::Tls(t) => {
                t.conn.send_close_notify();
                while t.conn.wants_write() {
                    if t.conn.write_tls(&mut t.stream).is_err() {
                        break;
                    }
                }
                let _ = t.stream.shutdown(Shutdown::Write);
            }
        }
    }
}

impl TlsSession {
    fn read(&mut self, buf: &mut [u8]) -> Transfer {
        loop {
            // handshake output takes priority, progress stalls until it
            // reaches the wire
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut self.stream) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Transfer::WantWrite
                    }
                    Err(e) => return Transfer::Fatal(e),
                }
            }
            match self.conn.reader().read(buf) {
                Ok(0) => return Transfer::Eof,
                Ok(n) => return Transfer::Done(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match self.conn.read_tls(&mut self.stream) {
                        Ok(0) => return Transfer::Eof,
                        Ok(_) => {
                            if let Err(e) = self.conn.process_new_packets() {
                                return Transfer::Fatal(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    e,
                                ));
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Transfer::WantRead
                        }
                        Err(e) => return Transfer::Fatal(e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Transfer::Eof,
                Err(e) => return Transfer::Fatal(e),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Transfer {
        // plaintext is buffered by the session, then pushed as far as the
        // socket allows
        let n = match self.conn.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return Transfer::Fatal(e),
        };
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Transfer::Fatal(e),
            }
        }
        if n > 0 {
            Transfer::Done(n)
        } else {
            Transfer::WantWrite
        }
    }
}

/// build a server TLS context from PEM cert chain and key files
pub fn create_tls_context(cert_chain: &Path, key_file: &Path) -> Result<Arc<ServerConfig>, WsError> {
    let mut certs_pem = BufReader::new(
        File::open(cert_chain)
            .map_err(|_| WsError::CertFileNotFound(cert_chain.display().to_string()))?,
    );
    let certs = rustls_pemfile::certs(&mut certs_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| WsError::LoadCertFailed(cert_chain.display().to_string()))?;
    let mut key_pem = BufReader::new(
        File::open(key_file)
            .map_err(|_| WsError::CertFileNotFound(key_file.display().to_string()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_pem)
        .map_err(|_| WsError::LoadCertFailed(key_file.display().to_string()))?
        .ok_or_else(|| WsError::LoadCertFailed(key_file.display().to_string()))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| WsError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// client context trusting the bundled web roots, built once per node
pub(crate) fn client_tls_config() -> Arc<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}
