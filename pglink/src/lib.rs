//! Synchronous Postgres driver and connection pool.
//!
//! Speaks the frontend/backend protocol (version 3.0) directly over blocking
//! sockets: startup and authentication (trust, cleartext, md5,
//! SCRAM-SHA-256), parameterised SQL through the extended-query cycle,
//! streamed result rows, transactions, and a bounded FIFO/LRU session pool.
//!
//! # Examples
//!
//! Single session:
//!
//! ```no_run
//! use pglink::{Config, Connection, Credential, Value};
//!
//! # fn main() -> pglink::Result<()> {
//! let config = Config {
//!     user: "bob".into(),
//!     credential: Credential::ScramSha256 { password: "welcome1".into() },
//!     database: "weatherdb".into(),
//!     ..Config::default()
//! };
//!
//! let conn = Connection::connect(&config)?;
//!
//! let stmt = conn.prepare("SELECT city, temp_lo FROM weather WHERE city = $1")?;
//! for row in stmt.execute(&[Value::from("San Francisco")])? {
//!     let row = row?;
//!     println!("{}: {}", row.get(0).unwrap(), row.get(1).unwrap().int()?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Session pooling:
//!
//! ```no_run
//! use pglink::{Config, Pool, PoolConfig, Value};
//!
//! # fn main() -> pglink::Result<()> {
//! let pool = Pool::new(PoolConfig::default(), Config::default());
//!
//! let conn = pool.acquire()?;
//! conn.begin_transaction()?;
//! let stmt = conn.prepare("DELETE FROM weather WHERE city = $1")?;
//! stmt.execute(&[Value::from("Hayward")])?;
//! conn.commit_transaction()?;
//! // the session returns to the pool when `conn` drops
//! # Ok(())
//! # }
//! ```
mod ext;

// Protocol
pub mod notice;
pub mod protocol;

// Authentication
pub mod auth;

// Text codecs
pub mod datetime;
pub mod row;
pub mod value;

// Components
pub mod connection;
pub mod cursor;
pub mod statement;
pub mod transport;

// Pooling
pub mod pool;

// Support
mod error;
pub mod logger;

pub use auth::Credential;
pub use connection::{Config, Connection, ConnectionDelegate};
pub use cursor::Cursor;
pub use error::{Error, ErrorKind, Result};
pub use logger::{ConsoleLogHandler, LogCrateHandler, LogHandler, LogLevel, LogRecord, Logger};
pub use notice::Notice;
pub use pool::{Pool, PoolConfig, PoolConnection, PoolMetrics};
pub use protocol::TransactionStatus;
pub use row::{Column, Row};
pub use statement::Statement;
pub use transport::TlsProvider;
#[cfg(feature = "tls")]
pub use transport::RustlsProvider;
pub use value::Value;
