//! Transport layer: newline-delimited frames over TCP or TLS.
//!
//! The pool speaks UTF-8 JSON, one message per line, over an arbitrarily
//! chunked byte stream. [`Connection`] wraps a buffered stream and turns
//! it into a sequence of parsed [`Envelope`]s: blank lines are skipped
//! and lines that fail to parse are logged and dropped, because real
//! pools emit non-conformant garbage from time to time and one bad frame
//! must not cost us the connection. The [`Transport`] trait abstracts
//! message I/O so the session can run over channels in tests.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use super::error::{PoolError, PoolResult};
use super::messages::Envelope;

/// Message-level I/O for the pool protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read one complete frame. Returns `None` on clean close (EOF).
    async fn read_message(&mut self) -> PoolResult<Option<Envelope>>;

    /// Write one frame.
    async fn write_message(&mut self, msg: &Envelope) -> PoolResult<()>;

    /// (host, port) of the remote end, when known.
    fn peer(&self) -> Option<(String, u16)> {
        None
    }

    /// Cumulative (bytes read, bytes written) on this transport.
    fn io_totals(&self) -> (u64, u64) {
        (0, 0)
    }
}

/// Anything we can run the line protocol over.
trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> IoStream for T {}

enum Scheme {
    Tcp,
    Tls,
}

/// Buffered pool connection.
pub struct Connection {
    io: BufStream<Box<dyn IoStream>>,
    line: String,
    host: String,
    port: u16,
    bytes_in: u64,
    bytes_out: u64,
}

impl Connection {
    /// Dial a pool URL.
    ///
    /// Accepts `stratum+tcp://`, `tcp://`, or a bare `host:port` for
    /// plaintext, and `stratum+ssl://`, `stratum+tls://`, `ssl://`, or
    /// `tls://` for TLS with the webpki root store.
    pub async fn connect(url: &str) -> PoolResult<Self> {
        let (scheme, host, port) = parse_url(url)?;

        debug!(host = %host, port, "connecting to pool");
        let tcp = TcpStream::connect((host.as_str(), port)).await?;

        let stream: Box<dyn IoStream> = match scheme {
            Scheme::Tcp => Box::new(tcp),
            Scheme::Tls => {
                let name = ServerName::try_from(host.clone()).map_err(|_| {
                    PoolError::Transport(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid TLS server name: {host}"),
                    ))
                })?;
                let tls = tls_connector().connect(name, tcp).await?;
                Box::new(tls)
            }
        };
        debug!(host = %host, port, "connected");

        Ok(Self {
            io: BufStream::new(stream),
            line: String::with_capacity(4096),
            host,
            port,
            bytes_in: 0,
            bytes_out: 0,
        })
    }
}

#[async_trait]
impl Transport for Connection {
    async fn read_message(&mut self) -> PoolResult<Option<Envelope>> {
        loop {
            // The buffer is cleared after a line is handled, not before
            // reading: if this future is dropped mid-line (select picked
            // another branch), the partial line survives and the next
            // call keeps appending to it.
            let n = self.io.read_line(&mut self.line).await?;
            if n == 0 {
                // EOF
                return Ok(None);
            }
            self.bytes_in += n as u64;

            let parsed = {
                let line = self.line.trim();
                if line.is_empty() {
                    None
                } else {
                    trace!(rx = %line, "frame");
                    match serde_json::from_str(line) {
                        Ok(msg) => Some(msg),
                        Err(e) => {
                            // One bad frame never takes the connection down.
                            warn!(error = %e, line = %line, "dropping malformed frame");
                            None
                        }
                    }
                }
            };
            self.line.clear();

            if let Some(msg) = parsed {
                return Ok(Some(msg));
            }
        }
    }

    async fn write_message(&mut self, msg: &Envelope) -> PoolResult<()> {
        let json = serde_json::to_string(msg)
            .map_err(|e| PoolError::Protocol(format!("encoding frame: {e}")))?;
        trace!(tx = %json, "frame");

        self.io.write_all(json.as_bytes()).await?;
        self.io.write_all(b"\n").await?;
        self.io.flush().await?;
        self.bytes_out += json.len() as u64 + 1;

        Ok(())
    }

    fn peer(&self) -> Option<(String, u16)> {
        Some((self.host.clone(), self.port))
    }

    fn io_totals(&self) -> (u64, u64) {
        (self.bytes_in, self.bytes_out)
    }
}

fn parse_url(url: &str) -> PoolResult<(Scheme, String, u16)> {
    let (scheme, rest) = if let Some(rest) = url
        .strip_prefix("stratum+tcp://")
        .or_else(|| url.strip_prefix("tcp://"))
    {
        (Scheme::Tcp, rest)
    } else if let Some(rest) = url
        .strip_prefix("stratum+ssl://")
        .or_else(|| url.strip_prefix("stratum+tls://"))
        .or_else(|| url.strip_prefix("ssl://"))
        .or_else(|| url.strip_prefix("tls://"))
    {
        (Scheme::Tls, rest)
    } else {
        (Scheme::Tcp, url)
    };

    let invalid = || {
        PoolError::Transport(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pool URL: {url}"),
        ))
    };

    let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;

    Ok((scheme, host.to_string(), port))
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Channel-backed transport for deterministic tests.
///
/// Works with `tokio::time::pause()` because no real I/O is involved.
/// The transport is the session's side; the handle is the test's side.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<Envelope>,
    tx: tokio::sync::mpsc::UnboundedSender<Envelope>,
}

/// Test-side handle for a [`MockTransport`].
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: Option<tokio::sync::mpsc::UnboundedSender<Envelope>>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Envelope>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (session_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, session_rx) = tokio::sync::mpsc::unbounded_channel();

        (
            MockTransport {
                rx: session_rx,
                tx: session_tx,
            },
            MockTransportHandle {
                tx: Some(handle_tx),
                rx: handle_rx,
            },
        )
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> PoolResult<Option<Envelope>> {
        Ok(self.rx.recv().await)
    }

    async fn write_message(&mut self, msg: &Envelope) -> PoolResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| PoolError::ConnectionClosed)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Feed a frame to the session.
    pub fn send(&self, msg: Envelope) {
        self.tx
            .as_ref()
            .expect("connection already closed")
            .send(msg)
            .expect("transport dropped");
    }

    /// Close the session's read side, simulating the peer hanging up.
    pub fn send_eof(&mut self) {
        self.tx = None;
    }

    /// Receive a frame the session wrote.
    pub async fn recv(&mut self) -> Envelope {
        self.rx.recv().await.expect("transport dropped")
    }

    /// Receive without waiting, if a frame is queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}
