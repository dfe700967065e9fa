//! The session and its protocol driver.
//!
//! A [`Connection`] owns the transport, performs startup and authentication,
//! and then drives the extended-query cycle. At most one cursor is open per
//! session; preparing a statement, executing, transaction control and close
//! all supersede the current cursor first.
//!
//! A session is not shareable: concurrent calls from multiple threads are
//! serialised by an internal lock but their interleaving is unspecified.
//! Hand a session to one thread at a time; the pool does exactly that.
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::{
    error::{Error, ErrorKind, Result},
    logger::{LogLevel, plog},
    notice::Notice,
    protocol::{
        BackendMessage, TransactionStatus,
        backend::{BackendKeyData, NotificationResponse, ParameterStatus, ReadyForQuery},
        frontend,
    },
    statement::Statement,
    transport::Transport,
};

mod config;
mod startup;

pub use config::Config;

#[cfg(feature = "tls")]
use crate::transport::RustlsProvider;
use crate::transport::TlsProvider;

/// Observer for messages the backend sends on its own initiative.
///
/// The delegate is held weakly; a session works the same with or without
/// one. Callbacks run on the thread driving the session, while the session's
/// internal lock is held; do not call back into the session from them.
pub trait ConnectionDelegate: Send + Sync {
    /// A `NoticeResponse` arrived.
    fn notice(&self, _notice: &Notice) { }

    /// A `ParameterStatus` arrived.
    fn parameter_status(&self, _name: &str, _value: &str) { }

    /// A `NotificationResponse` arrived (`LISTEN`/`NOTIFY`).
    fn notification(&self, _notification: &NotificationResponse) { }
}

/// Placeholder used when no delegate is supplied.
struct NoDelegate;

impl ConnectionDelegate for NoDelegate { }

pub(crate) fn no_delegate() -> Weak<dyn ConnectionDelegate> {
    Weak::<NoDelegate>::new()
}

/// A session with a postgres server.
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

/// State reachable from handles and from the pool.
pub(crate) struct Shared {
    pub(crate) control: Control,
    pub(crate) inner: Mutex<Inner>,
}

/// The part of a session that can be poked without taking the inner lock:
/// the closed flag and a socket handle to break a blocked read.
pub(crate) struct Control {
    id: String,
    closed: AtomicBool,
    socket: Mutex<Option<std::net::TcpStream>>,
}

impl Control {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the session out-of-band. A thread blocked reading this session
    /// observes a socket error; later operations observe `ConnectionClosed`.
    pub(crate) fn abort(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(socket) = self.socket.lock().take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
        plog!(LogLevel::Fine, &self.id, "connection force-closed");
    }
}

pub(crate) struct Inner {
    transport: Option<Transport>,
    transaction_status: TransactionStatus,
    key_data: Option<BackendKeyData>,
    delegate: Weak<dyn ConnectionDelegate>,
    /// Monotonic; the live cursor is the one whose generation matches
    /// `open_cursor`.
    cursor_generation: u64,
    open_cursor: Option<OpenCursor>,
    statement_seq: u64,
}

/// Book-keeping for the at-most-one open cursor.
pub(crate) struct OpenCursor {
    pub(crate) generation: u64,
    /// Last DataRow consumed and CommandComplete + ReadyForQuery read.
    /// A drained cursor is iterable (yields nothing) without protocol
    /// traffic until explicitly closed or superseded.
    pub(crate) drained: bool,
}

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> String {
    let seq = CONNECTION_SEQ.fetch_add(1, Ordering::SeqCst);
    let mut buf = itoa::Buffer::new();
    ["Connection-", buf.format(seq)].concat()
}

impl Connection {
    /// Open, authenticate and reach ReadyForQuery.
    ///
    /// With `ssl` set in the config, the bundled rustls provider performs
    /// the TLS handshake; in a build without the `tls` feature such configs
    /// fail with a TLS error.
    pub fn connect(config: &Config) -> Result<Connection> {
        Self::connect_with(config, None, no_delegate())
    }

    /// [`connect`][Connection::connect] with a delegate for asynchronous
    /// backend messages.
    pub fn connect_with_delegate(
        config: &Config,
        delegate: Weak<dyn ConnectionDelegate>,
    ) -> Result<Connection> {
        Self::connect_with(config, None, delegate)
    }

    /// Full-control connect: optional custom TLS provider and delegate.
    pub fn connect_with(
        config: &Config,
        tls: Option<&dyn TlsProvider>,
        delegate: Weak<dyn ConnectionDelegate>,
    ) -> Result<Connection> {
        let id = next_connection_id();

        #[cfg(feature = "tls")]
        let default_provider;
        let provider: Option<&dyn TlsProvider> = match (config.ssl, tls) {
            (false, _) => None,
            (true, Some(provider)) => Some(provider),
            (true, None) => {
                #[cfg(feature = "tls")]
                {
                    default_provider = RustlsProvider::new();
                    Some(&default_provider)
                }
                #[cfg(not(feature = "tls"))]
                {
                    return Err(ErrorKind::TlsError(
                        "pglink was built without the tls feature".into(),
                    )
                    .into());
                }
            }
        };

        let transport = Transport::open(&config.host, config.port, config.socket_timeout, provider)?;
        let socket = transport.shutdown_handle().ok();

        let mut inner = Inner {
            transport: Some(transport),
            transaction_status: TransactionStatus::Idle,
            key_data: None,
            delegate,
            cursor_generation: 0,
            open_cursor: None,
            statement_seq: 0,
        };

        if let Err(err) = inner.startup(config) {
            if let Some(mut transport) = inner.transport.take() {
                transport.abort();
            }
            return Err(err.with_context(format!("startup of {id}")));
        }

        plog!(LogLevel::Fine, &id, "connected to {}:{} as {:?}", config.host, config.port, config.user);

        Ok(Connection {
            shared: Arc::new(Shared {
                control: Control {
                    id,
                    closed: AtomicBool::new(false),
                    socket: Mutex::new(socket),
                },
                inner: Mutex::new(inner),
            }),
        })
    }

    /// Identity of this session, unique within the process.
    pub fn id(&self) -> &str {
        self.shared.control.id()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.control.is_closed()
    }

    /// Transaction status from the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.shared.inner.lock().transaction_status
    }

    /// BackendKeyData `(process id, secret key)` retained from startup, the
    /// ingredients of a future CancelRequest.
    pub fn backend_key_data(&self) -> Option<(i32, i32)> {
        self.shared
            .inner
            .lock()
            .key_data
            .map(|k| (k.process_id, k.secret_key))
    }

    /// Parse and describe `sql` under a fresh server-side statement name.
    ///
    /// The current cursor, if any, is closed first. On an `ErrorResponse` the
    /// driver consumes through ReadyForQuery and the session remains usable.
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        let (name, param_types, columns) = self.shared.op(|inner| {
            inner.close_open_cursor()?;

            let name = inner.next_statement_name();
            inner.send(frontend::Parse { prepare_name: &name, sql })?;
            inner.send(frontend::Describe { kind: b'S', name: &name })?;
            inner.send(frontend::Sync)?;
            inner.flush()?;

            let param_types = match inner.receive_expected()? {
                BackendMessage::ParseComplete => match inner.receive_expected()? {
                    BackendMessage::ParameterDescription(d) => d.type_oids,
                    msg => return Err(Error::unexpected("statement describe", msg.tag())),
                },
                msg => return Err(Error::unexpected("statement prepare", msg.tag())),
            };

            let columns = match inner.receive_expected()? {
                BackendMessage::RowDescription(d) => Some(Arc::from(d.columns)),
                BackendMessage::NoData => None,
                msg => return Err(Error::unexpected("statement describe", msg.tag())),
            };

            inner.expect_ready()?;
            Ok((name, param_types, columns))
        })?;

        Ok(Statement::new(
            Arc::downgrade(&self.shared),
            name,
            sql.to_owned(),
            param_types,
            columns,
        ))
    }

    /// `BEGIN` through the extended-query path.
    pub fn begin_transaction(&self) -> Result<()> {
        self.shared.op(|inner| inner.run_simple("BEGIN"))
    }

    /// `COMMIT` through the extended-query path.
    pub fn commit_transaction(&self) -> Result<()> {
        self.shared.op(|inner| inner.run_simple("COMMIT"))
    }

    /// `ROLLBACK` through the extended-query path.
    pub fn rollback_transaction(&self) -> Result<()> {
        self.shared.op(|inner| inner.run_simple("ROLLBACK"))
    }

    /// Terminate the session. Idempotent; all outstanding statements and
    /// cursors become unusable.
    pub fn close(&self) {
        if self.shared.control.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.shared.inner.lock();
        self.shared.control.socket.lock().take();
        if let Some(transport) = inner.transport.take() {
            transport.close();
        }
        plog!(LogLevel::Fine, self.id(), "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Errors that leave the wire in an unknown state close the session.
fn is_fatal(error: &Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::SocketError(_)
            | ErrorKind::TlsError(_)
            | ErrorKind::TlsNotAvailable
            | ErrorKind::MalformedMessage(_)
            | ErrorKind::UnsupportedProtocolVersion(_)
            | ErrorKind::UnexpectedMessage { .. }
            | ErrorKind::InvalidParameterValue { .. }
    )
}

impl Shared {
    /// Run one session operation under the inner lock, enforcing the closed
    /// flag and the fatal-error policy.
    pub(crate) fn op<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        if self.control.is_closed() {
            return Err(ErrorKind::ConnectionClosed.into());
        }
        let mut inner = self.inner.lock();
        if self.control.is_closed() {
            return Err(ErrorKind::ConnectionClosed.into());
        }
        match f(&mut inner) {
            Err(err) if is_fatal(&err) => {
                self.control.closed.store(true, Ordering::SeqCst);
                self.control.socket.lock().take();
                if let Some(mut transport) = inner.transport.take() {
                    transport.abort();
                }
                plog!(LogLevel::Warning, self.control.id(), "connection closed on error: {err}");
                Err(err)
            }
            result => result,
        }
    }
}

impl Inner {
    fn transport(&mut self) -> Result<&mut Transport> {
        self.transport
            .as_mut()
            .ok_or_else(|| ErrorKind::ConnectionClosed.into())
    }

    pub(crate) fn send<F: frontend::FrontendProtocol>(&mut self, message: F) -> Result<()> {
        self.transport()?.send(message);
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.transport()?.flush()
    }

    fn next_statement_name(&mut self) -> String {
        self.statement_seq += 1;
        let mut buf = itoa::Buffer::new();
        ["s", buf.format(self.statement_seq)].concat()
    }

    /// Read one message addressed to the current cycle.
    ///
    /// NoticeResponse, ParameterStatus and NotificationResponse may arrive
    /// between any request and its response; they are dispatched to the
    /// delegate here and reading continues.
    pub(crate) fn receive_message(&mut self) -> Result<BackendMessage> {
        loop {
            let message = self.transport()?.receive()?;
            match message {
                BackendMessage::NoticeResponse(notice) => {
                    if let Some(delegate) = self.delegate.upgrade() {
                        delegate.notice(&notice);
                    }
                }
                BackendMessage::ParameterStatus(status) => {
                    self.check_parameter(&status)?;
                    if let Some(delegate) = self.delegate.upgrade() {
                        delegate.parameter_status(&status.name, &status.value);
                    }
                }
                BackendMessage::NotificationResponse(notification) => {
                    if let Some(delegate) = self.delegate.upgrade() {
                        delegate.notification(&notification);
                    }
                }
                message => return Ok(message),
            }
        }
    }

    /// Text-format codecs rely on the parameters pinned at startup; a server
    /// that changes them invalidates every value in flight.
    fn check_parameter(&self, status: &ParameterStatus) -> Result<()> {
        let requirement = match status.name.as_str() {
            "client_encoding" if status.value != "UTF8" => "must be UTF8",
            "DateStyle" if !status.value.starts_with("ISO") => "must start with ISO",
            "TimeZone" if status.value != "UTC" => "must be UTC",
            _ => return Ok(()),
        };
        Err(ErrorKind::InvalidParameterValue {
            name: status.name.clone(),
            value: status.value.clone(),
            requirement,
        }
        .into())
    }

    /// Like [`receive_message`][Inner::receive_message], but an ErrorResponse
    /// is consumed through ReadyForQuery and surfaced as
    /// [`SqlError`][ErrorKind::SqlError]; the session remains usable.
    pub(crate) fn receive_expected(&mut self) -> Result<BackendMessage> {
        match self.receive_message()? {
            BackendMessage::ErrorResponse(notice) => {
                self.drain_ready()?;
                Err(notice.into())
            }
            message => Ok(message),
        }
    }

    /// Read and discard until ReadyForQuery, recording the transaction
    /// status.
    pub(crate) fn drain_ready(&mut self) -> Result<()> {
        loop {
            if let BackendMessage::ReadyForQuery(ready) = self.receive_message()? {
                self.transaction_status = ready.status;
                return Ok(());
            }
        }
    }

    /// Expect exactly ReadyForQuery.
    pub(crate) fn expect_ready(&mut self) -> Result<()> {
        match self.receive_expected()? {
            BackendMessage::ReadyForQuery(ReadyForQuery { status }) => {
                self.transaction_status = status;
                Ok(())
            }
            msg => Err(Error::unexpected("awaiting ready", msg.tag())),
        }
    }

    pub(crate) fn open_cursor(&self) -> Option<&OpenCursor> {
        self.open_cursor.as_ref()
    }

    pub(crate) fn open_cursor_mut(&mut self) -> Option<&mut OpenCursor> {
        self.open_cursor.as_mut()
    }

    pub(crate) fn take_open_cursor(&mut self) -> Option<OpenCursor> {
        self.open_cursor.take()
    }

    /// Register the freshly bound portal as the live cursor.
    pub(crate) fn open_new_cursor(&mut self) -> u64 {
        self.cursor_generation += 1;
        let generation = self.cursor_generation;
        self.open_cursor = Some(OpenCursor { generation, drained: false });
        generation
    }

    /// Force-close the live cursor, if any.
    ///
    /// A drained cursor needs no protocol traffic. Otherwise the in-flight
    /// execute cycle is still streaming: queue Close(portal)/Sync behind it
    /// and discard through both ReadyForQuery replies.
    pub(crate) fn close_open_cursor(&mut self) -> Result<()> {
        let Some(cursor) = self.open_cursor.take() else {
            return Ok(());
        };
        if cursor.drained {
            return Ok(());
        }
        self.send(frontend::Close { kind: b'P', name: "" })?;
        self.send(frontend::Sync)?;
        self.flush()?;
        self.drain_ready()?;
        self.drain_ready()?;
        Ok(())
    }

    /// One statement through Parse/Bind/Execute/Sync under the unnamed
    /// statement and portal, results discarded. Used for transaction control.
    pub(crate) fn run_simple(&mut self, sql: &str) -> Result<()> {
        self.close_open_cursor()?;

        self.send(frontend::Parse { prepare_name: "", sql })?;
        self.send(frontend::Bind { portal_name: "", prepare_name: "", params: &[] })?;
        self.send(frontend::Execute { portal_name: "", max_row: 0 })?;
        self.send(frontend::Sync)?;
        self.flush()?;

        loop {
            match self.receive_expected()? {
                BackendMessage::ReadyForQuery(ReadyForQuery { status }) => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::CommandComplete(_)
                | BackendMessage::EmptyQueryResponse
                | BackendMessage::DataRow(_)
                | BackendMessage::PortalSuspended => {}
                msg => return Err(Error::unexpected("simple statement", msg.tag())),
            }
        }
    }
}
