//! `pglink` error types.
use std::{borrow::Cow, fmt, io};

use crate::{auth::saslprep::SaslprepError, notice::Notice};

/// A specialized [`Result`] type for `pglink` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pglink` library.
pub struct Error {
    context: String,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub(crate) fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub(crate) fn malformed(reason: impl Into<Cow<'static, str>>) -> Self {
        ErrorKind::MalformedMessage(reason.into()).into()
    }

    pub(crate) fn unexpected(context: &'static str, tag: u8) -> Self {
        ErrorKind::UnexpectedMessage { context, tag }.into()
    }
}

/// All possible error kind from `pglink` library.
pub enum ErrorKind {
    // transport
    SocketError(io::Error),
    TlsError(String),
    TlsNotAvailable,

    // protocol
    MalformedMessage(Cow<'static, str>),
    UnsupportedProtocolVersion(String),
    UnexpectedMessage { context: &'static str, tag: u8 },

    // authentication
    TrustCredentialRequired,
    CleartextPasswordCredentialRequired,
    Md5PasswordCredentialRequired,
    ScramSha256CredentialRequired,
    UnsupportedAuthenticationType(String),
    ServerNonceMismatch,
    ServerSignatureMismatch,
    ScramIterationsTooLow(u32),
    InvalidUsername(SaslprepError),
    InvalidPassword(SaslprepError),

    // configuration pinned at startup
    InvalidParameterValue {
        name: String,
        value: String,
        requirement: &'static str,
    },

    // handle state
    ConnectionClosed,
    StatementClosed,
    CursorClosed,
    ConnectionPoolClosed,
    ColumnMetadataNotAvailable,

    // pool
    TooManyRequestsForConnections,
    TimedOutAcquiringConnection,

    // reported by the backend
    SqlError(Box<Notice>),

    // value conversion
    ValueIsNull,
    ValueConversionError { raw: String, target: &'static str },
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                Self { context: String::new(), kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<io::Error>e => ErrorKind::SocketError(e));
from!(<Notice>e => ErrorKind::SqlError(Box::new(e)));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketError(e) => write!(f, "socket error: {e}"),
            Self::TlsError(e) => write!(f, "TLS error: {e}"),
            Self::TlsNotAvailable => f.write_str("server does not support TLS"),
            Self::MalformedMessage(reason) => write!(f, "malformed backend message: {reason}"),
            Self::UnsupportedProtocolVersion(detail) => {
                write!(f, "server does not support protocol 3.0: {detail}")
            }
            Self::UnexpectedMessage { context, tag } => {
                write!(f, "unexpected message {:?} in {context}", char::from(*tag))
            }
            Self::TrustCredentialRequired => {
                f.write_str("server authenticates without a password, a trust credential is required")
            }
            Self::CleartextPasswordCredentialRequired => {
                f.write_str("server requires a cleartext password credential")
            }
            Self::Md5PasswordCredentialRequired => {
                f.write_str("server requires an md5 password credential")
            }
            Self::ScramSha256CredentialRequired => {
                f.write_str("server requires a scram-sha-256 credential")
            }
            Self::UnsupportedAuthenticationType(t) => {
                write!(f, "unsupported authentication type: {t}")
            }
            Self::ServerNonceMismatch => f.write_str("server nonce does not extend the client nonce"),
            Self::ServerSignatureMismatch => f.write_str("server signature verification failed"),
            Self::ScramIterationsTooLow(i) => write!(f, "scram iteration count too low: {i}"),
            Self::InvalidUsername(e) => write!(f, "invalid username: {e}"),
            Self::InvalidPassword(e) => write!(f, "invalid password: {e}"),
            Self::InvalidParameterValue { name, value, requirement } => {
                write!(f, "server parameter {name} is {value:?}, {requirement}")
            }
            Self::ConnectionClosed => f.write_str("connection is closed"),
            Self::StatementClosed => f.write_str("statement is closed"),
            Self::CursorClosed => f.write_str("cursor is closed"),
            Self::ConnectionPoolClosed => f.write_str("connection pool is closed"),
            Self::ColumnMetadataNotAvailable => f.write_str("column metadata is not available"),
            Self::TooManyRequestsForConnections => {
                f.write_str("too many pending requests for connections")
            }
            Self::TimedOutAcquiringConnection => f.write_str("timed out acquiring connection"),
            Self::SqlError(notice) => write!(f, "server error: {notice}"),
            Self::ValueIsNull => f.write_str("value is null"),
            Self::ValueConversionError { raw, target } => {
                write!(f, "cannot convert {raw:?} to {target}")
            }
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
