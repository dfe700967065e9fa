//! The startup phase: StartupMessage, authentication, ReadyForQuery.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use crate::{
    auth::{Credential, md5_response, scram::{self, ScramSha256}},
    error::{Error, ErrorKind, Result},
    protocol::{Authentication, BackendMessage, frontend},
};

use super::{Config, Inner};

impl Inner {
    /// Walk the startup phase to its ReadyForQuery.
    ///
    /// The authentication loop answers each AuthenticationXxx request from
    /// the configured credential; a request the credential cannot answer is
    /// a classified error and the startup is abandoned without ever sending
    /// a mismatched secret.
    pub(super) fn startup(&mut self, config: &Config) -> Result<()> {
        self.transport()?.send_startup(frontend::Startup {
            user: &config.user,
            database: &config.database,
            application_name: &config.application_name,
        });
        self.flush()?;

        // For all authentication methods except SASL there is at most one
        // request and one response; SASL exchanges several packets.
        let mut scram: Option<ScramSha256> = None;
        let mut challenged = false;

        loop {
            match self.receive_message()? {
                BackendMessage::Authentication(auth) => match auth {
                    Authentication::Ok => {
                        // an Ok with no preceding challenge means the server
                        // performs trust authentication
                        if !challenged && !matches!(config.credential, Credential::Trust) {
                            return Err(ErrorKind::TrustCredentialRequired.into());
                        }
                    }
                    Authentication::CleartextPassword => {
                        challenged = true;
                        let Credential::CleartextPassword { password } = &config.credential else {
                            return Err(ErrorKind::CleartextPasswordCredentialRequired.into());
                        };
                        self.send(frontend::PasswordMessage { password })?;
                        self.flush()?;
                    }
                    Authentication::Md5Password { salt } => {
                        challenged = true;
                        let Credential::Md5Password { password } = &config.credential else {
                            return Err(ErrorKind::Md5PasswordCredentialRequired.into());
                        };
                        let response = md5_response(&config.user, password, salt);
                        self.send(frontend::PasswordMessage { password: &response })?;
                        self.flush()?;
                    }
                    Authentication::Sasl { mechanisms } => {
                        challenged = true;
                        let Credential::ScramSha256 { password } = &config.credential else {
                            return Err(ErrorKind::ScramSha256CredentialRequired.into());
                        };
                        if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                            return Err(ErrorKind::UnsupportedAuthenticationType(
                                mechanisms.join(", "),
                            )
                            .into());
                        }
                        let exchange = ScramSha256::new(&config.user, password)?;
                        let client_first = exchange.client_first();
                        self.send(frontend::SaslInitialResponse {
                            mechanism: scram::MECHANISM,
                            response: client_first.as_bytes(),
                        })?;
                        self.flush()?;
                        scram = Some(exchange);
                    }
                    Authentication::SaslContinue { data } => {
                        let Some(exchange) = scram.as_mut() else {
                            return Err(Error::unexpected("sasl continue outside exchange", b'R'));
                        };
                        let server_first = std::str::from_utf8(&data)
                            .map_err(|_| Error::malformed("non UTF-8 SASL challenge"))?;
                        exchange.handle_server_first(server_first)?;
                        let client_final = exchange.client_final()?.to_owned();
                        self.send(frontend::SaslResponse { data: client_final.as_bytes() })?;
                        self.flush()?;
                    }
                    Authentication::SaslFinal { data } => {
                        let Some(exchange) = scram.as_ref() else {
                            return Err(Error::unexpected("sasl final outside exchange", b'R'));
                        };
                        let server_final = std::str::from_utf8(&data)
                            .map_err(|_| Error::malformed("non UTF-8 SASL outcome"))?;
                        exchange.verify_server_final(server_final)?;
                    }
                    Authentication::Other(code) => {
                        return Err(ErrorKind::UnsupportedAuthenticationType(
                            Authentication::type_name(code),
                        )
                        .into());
                    }
                },
                BackendMessage::BackendKeyData(key_data) => {
                    // saved for issuing CancelRequest later
                    self.key_data = Some(key_data);
                }
                BackendMessage::ReadyForQuery(ready) => {
                    self.transaction_status = ready.status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse(notice) => return Err(notice.into()),
                BackendMessage::NegotiateProtocolVersion(negotiate) => {
                    return Err(ErrorKind::UnsupportedProtocolVersion(format!(
                        "server supports up to 3.{}, unsupported options: [{}]",
                        negotiate.newest_minor,
                        negotiate.unsupported_options.join(", "),
                    ))
                    .into());
                }
                message => return Err(Error::unexpected("startup phase", message.tag())),
            }
        }
    }
}
