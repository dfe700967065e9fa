//! Blocking wire transport.
//!
//! Owns the socket and the optional TLS layer, and frames postgres messages
//! over it. The transport is not thread-safe; the session serialises access.
use std::{
    io::{Read, Write},
    net::{Shutdown, TcpStream},
    time::Duration,
};

use bytes::{Bytes, BytesMut};

use crate::{
    error::{Error, ErrorKind, Result},
    protocol::{
        BackendMessage,
        backend::BackendProtocol,
        frontend::{self, FrontendProtocol, SslRequest, Startup},
    },
};

/// A byte stream the transport can drive, plain TCP or TLS-wrapped.
pub trait Stream: Read + Write + Send { }

impl<T: Read + Write + Send> Stream for T { }

/// Wraps a connected socket with TLS after the server accepts an SSLRequest.
///
/// The provider only sees a connected byte stream and returns a stream with
/// the same read/write interface; the handshake and encryption are its own
/// business.
pub trait TlsProvider: Send + Sync {
    fn wrap(&self, host: &str, stream: TcpStream) -> Result<Box<dyn Stream>>;
}

/// Blocking, framed postgres transport.
pub struct Transport {
    stream: Box<dyn Stream>,
    /// Raw socket handle kept aside so the pool can break a blocked read.
    socket: TcpStream,
    write_buf: BytesMut,
}

impl Transport {
    /// TCP connect, then the SSLRequest dance when a TLS provider is given.
    ///
    /// A zero `timeout` means no receive timeout.
    pub fn open(
        host: &str,
        port: u16,
        timeout: Duration,
        tls: Option<&dyn TlsProvider>,
    ) -> Result<Transport> {
        let socket = TcpStream::connect((host, port))?;
        socket.set_nodelay(true)?;
        if !timeout.is_zero() {
            socket.set_read_timeout(Some(timeout))?;
        }

        // the shutdown handle shares the descriptor with the stream
        let handle = socket.try_clone()?;

        let stream: Box<dyn Stream> = match tls {
            None => Box::new(socket),
            Some(provider) => {
                let mut socket = socket;
                let mut buf = BytesMut::new();
                SslRequest.write(&mut buf);
                socket.write_all(&buf)?;
                socket.flush()?;

                let mut answer = [0u8; 1];
                socket.read_exact(&mut answer)?;
                match answer[0] {
                    b'S' => provider.wrap(host, socket)?,
                    b'N' => return Err(ErrorKind::TlsNotAvailable.into()),
                    b => {
                        return Err(Error::malformed(format!(
                            "unexpected SSLRequest answer {:?}",
                            char::from(b)
                        )));
                    }
                }
            }
        };

        Ok(Transport { stream, socket: handle, write_buf: BytesMut::new() })
    }

    /// Buffer a frontend message; call [`flush`][Transport::flush] to send.
    pub fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    /// Buffer the startup message, which is framed without a type tag.
    pub fn send_startup(&mut self, startup: Startup) {
        startup.write(&mut self.write_buf);
    }

    /// Write all buffered messages to the socket.
    pub fn flush(&mut self) -> Result<()> {
        let buf = self.write_buf.split();
        self.stream.write_all(&buf)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Blocking read of one framed backend message.
    ///
    /// A receive timeout surfaces as
    /// [`SocketError`][crate::ErrorKind::SocketError].
    pub fn receive(&mut self) -> Result<BackendMessage> {
        let mut header = [0u8; 5];
        self.stream.read_exact(&mut header)?;

        let tag = header[0];
        let len = i32::from_be_bytes(header[1..5].try_into().unwrap());
        if len < 4 {
            return Err(Error::malformed("message length below 4"));
        }

        let mut body = vec![0u8; len as usize - 4];
        self.stream.read_exact(&mut body)?;

        BackendMessage::decode(tag, Bytes::from(body))
    }

    /// A shutdown handle sharing this transport's socket.
    ///
    /// Shutting it down makes any blocked read on the transport fail with a
    /// socket error, which is how the pool revokes a timed-out session.
    pub(crate) fn shutdown_handle(&self) -> Result<TcpStream> {
        Ok(self.socket.try_clone()?)
    }

    /// Shut down the socket without the Terminate courtesy.
    pub fn abort(&mut self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Graceful close: Terminate, flush, shut down.
    pub fn close(mut self) {
        self.send(frontend::Terminate);
        let _ = self.flush();
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.socket.peer_addr().ok())
            .finish()
    }
}

#[cfg(feature = "tls")]
mod rustls_provider {
    use std::sync::Arc;

    use super::{Stream, TlsProvider};
    use crate::error::{ErrorKind, Result};

    /// [`TlsProvider`] backed by `rustls` with the `webpki-roots` trust
    /// anchors.
    pub struct RustlsProvider {
        config: Arc<rustls::ClientConfig>,
    }

    impl RustlsProvider {
        pub fn new() -> RustlsProvider {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            RustlsProvider { config: Arc::new(config) }
        }

        /// Use a caller-built `rustls` config, e.g. with a private CA.
        pub fn with_config(config: Arc<rustls::ClientConfig>) -> RustlsProvider {
            RustlsProvider { config }
        }
    }

    impl Default for RustlsProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TlsProvider for RustlsProvider {
        fn wrap(&self, host: &str, stream: std::net::TcpStream) -> Result<Box<dyn Stream>> {
            let name = rustls::pki_types::ServerName::try_from(host.to_owned())
                .map_err(|e| ErrorKind::TlsError(e.to_string()))?;
            let conn = rustls::ClientConnection::new(self.config.clone(), name)
                .map_err(|e| ErrorKind::TlsError(e.to_string()))?;
            Ok(Box::new(rustls::StreamOwned::new(conn, stream)))
        }
    }
}

#[cfg(feature = "tls")]
pub use rustls_provider::RustlsProvider;
