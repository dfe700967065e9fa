//! Session configuration.
use std::time::Duration;

use crate::auth::Credential;

/// Configuration for one session.
///
/// ```
/// use pglink::{Config, Credential};
///
/// let config = Config {
///     user: "bob".into(),
///     credential: Credential::ScramSha256 { password: "secret".into() },
///     database: "weatherdb".into(),
///     ..Config::default()
/// };
/// # let _ = config;
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Server host name. The default is `localhost`.
    pub host: String,
    /// Server port. The default is `5432`.
    pub port: u16,
    /// Whether the session must be TLS encrypted. The default is `true`;
    /// a server that refuses the SSLRequest fails the connect.
    pub ssl: bool,
    /// Receive timeout applied to every socket read; zero means none.
    pub socket_timeout: Duration,
    /// Database name. The default is `postgres`.
    pub database: String,
    /// Role to connect as.
    pub user: String,
    /// How to authenticate. The default is [`Credential::Trust`].
    pub credential: Credential,
    /// Reported in `pg_stat_activity.application_name`.
    pub application_name: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: "localhost".into(),
            port: 5432,
            ssl: true,
            socket_timeout: Duration::ZERO,
            database: "postgres".into(),
            user: String::new(),
            credential: Credential::Trust,
            application_name: "pglink".into(),
        }
    }
}
