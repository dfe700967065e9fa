//! Postgres frontend messages.
use bytes::{BufMut, BytesMut};

use crate::ext::{BufMutExt, StrExt, UsizeExt};

/// Write a frontend message to `buf`.
///
/// Multiple messages may be written back to back before a single flush, the
/// extended-query cycle batches Parse/Describe/Sync this way.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // tag + length
    const PREFIX: usize = 1 + 4;

    let size = msg.size_hint();
    buf.reserve(PREFIX + size as usize);

    let offset = buf.len();
    buf.put_u8(F::FORMAT);
    buf.put_i32(4 + size);

    msg.encode(&mut *buf);

    assert_eq!(
        buf[offset..].len(),
        PREFIX + size as usize,
        "[BUG] frontend message body not equal to size hint"
    );
}

/// A type which can be encoded into a postgres frontend message.
pub trait FrontendProtocol {
    /// message type tag
    const FORMAT: u8;

    /// size of the main body
    ///
    /// note that this is *only* the size of the main body as opposed to the
    /// framed postgres message
    fn size_hint(&self) -> i32;

    /// write the main body of the message
    fn encode(self, buf: impl BufMut);
}

/// Postgres startup frontend message.
///
/// For historical reasons, the very first message sent by the client has no
/// initial message-type byte, so [`Startup`] does not implement
/// [`FrontendProtocol`].
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-STARTUPMESSAGE>
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to.
    pub database: &'a str,
    /// Reported in `pg_stat_activity.application_name`.
    pub application_name: &'a str,
}

/// Run-time parameters pinned at startup. The driver text-encodes every
/// parameter and decodes every result under these settings; a later
/// server-side change is rejected as an invalid parameter value.
pub const PINNED_PARAMETERS: &[(&str, &str)] = &[
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
    ("TimeZone", "UTC"),
];

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Int32 Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_u32(0);

        // Int32(196608)
        // The most significant 16 bits are the major version number (3),
        // the least significant 16 bits are the minor version number (0).
        buf.put_i32(196608);

        // The protocol version number is followed by one or more pairs of
        // parameter name and value strings.
        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        buf.put_nul_string("database");
        buf.put_nul_string(self.database);

        buf.put_nul_string("application_name");
        buf.put_nul_string(self.application_name);

        for (name, value) in PINNED_PARAMETERS {
            buf.put_nul_string(name);
            buf.put_nul_string(value);
        }

        // A zero byte is required as a terminator after the last
        // name/value pair.
        buf.put_u8(0);

        // write the length
        let mut written_buf = &mut buf[offset..];
        written_buf.put_i32(written_buf.len().to_i32());
    }
}

/// Requests the connection be upgraded to TLS.
///
/// Untagged like [`Startup`]; the server answers with a single byte,
/// `'S'` to proceed with the TLS handshake or `'N'` to refuse.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    pub fn write(self, buf: &mut BytesMut) {
        // Int32(8) Length of message contents in bytes, including self.
        buf.put_i32(8);
        // Int32(80877103) The SSL request code.
        buf.put_i32(80877103);
    }
}

/// Identifies the message as a password response.
///
/// Also used for MD5 responses, where the password field carries the digest.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const FORMAT: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.password.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.password);
    }
}

/// Identifies the message as an initial SASL response.
pub struct SaslInitialResponse<'a> {
    /// Name of the SASL authentication mechanism that the client selected.
    pub mechanism: &'a str,
    /// SASL mechanism specific "Initial Client Response".
    pub response: &'a [u8],
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const FORMAT: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.mechanism.nul_string_len() + 4 + self.response.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.mechanism);
        // Int32 Length of SASL mechanism specific "Initial Client Response"
        // that follows, or -1 if there is no initial response.
        buf.put_i32(self.response.len().to_i32());
        buf.put_slice(self.response);
    }
}

/// Identifies the message as a SASL response after the initial one.
pub struct SaslResponse<'a> {
    /// SASL mechanism specific message data.
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslResponse<'_> {
    const FORMAT: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a Parse command.
pub struct Parse<'a> {
    /// Prepared statement name (an empty string selects the unnamed
    /// prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
}

impl FrontendProtocol for Parse<'_> {
    const FORMAT: u8 = b'P';

    fn size_hint(&self) -> i32 {
        self.prepare_name.nul_string_len() +
        self.sql.nul_string_len() +
        // number of prespecified parameter data types, always zero here:
        // parameters are sent in text format and the server infers types
        2
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.prepare_name);
        buf.put_nul_string(self.sql);
        buf.put_i16(0);
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    /// `'S'` to describe a prepared statement or `'P'` to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe.
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const FORMAT: u8 = b'D';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Bind command.
///
/// Parameter values are always text encoded; `None` binds SQL `NULL`.
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the
    /// unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement.
    pub prepare_name: &'a str,
    /// Text-format parameter values.
    pub params: &'a [Option<&'a str>],
}

impl FrontendProtocol for Bind<'_> {
    const FORMAT: u8 = b'B';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len() +
        self.prepare_name.nul_string_len() +
        // one parameter format code applied to all parameters
        2 + 2 +
        // parameter count
        2 +
        self.params.iter().fold(0i32, |acc, p| {
            acc + 4 + p.map_or(0, |v| v.len().to_i32())
        }) +
        // one result format code applied to all result columns
        2 + 2
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_nul_string(self.prepare_name);

        // one format code applied to all parameters: zero (text)
        buf.put_i16(1);
        buf.put_i16(0);

        buf.put_i16(self.params.len().to_i16());
        for param in self.params {
            match param {
                // Int32(-1) indicates a NULL parameter value,
                // no value bytes follow
                None => buf.put_i32(-1),
                Some(value) => {
                    buf.put_i32(value.len().to_i32());
                    buf.put_slice(value.as_bytes());
                }
            }
        }

        // one format code applied to all result columns: zero (text)
        buf.put_i16(1);
        buf.put_i16(0);
    }
}

/// Identifies the message as an Execute command.
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the
    /// unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that
    /// returns rows (ignored otherwise). Zero denotes "no limit".
    pub max_row: i32,
}

impl FrontendProtocol for Execute<'_> {
    const FORMAT: u8 = b'E';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len() + 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_i32(self.max_row);
    }
}

/// Identifies the message as a Close command.
pub struct Close<'a> {
    /// `'S'` to close a prepared statement or `'P'` to close a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to close.
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const FORMAT: u8 = b'C';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Sync command.
///
/// Issued after each logical extended-query step; on an error the driver
/// reads until the answering ReadyForQuery and needs no further state
/// reconciliation.
pub struct Sync;

impl FrontendProtocol for Sync {
    const FORMAT: u8 = b'S';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a termination.
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const FORMAT: u8 = b'X';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn framing() {
        let mut buf = BytesMut::new();
        write(PasswordMessage { password: "secret" }, &mut buf);
        assert_eq!(&buf[..], b"p\x00\x00\x00\x0bsecret\0");
    }

    #[test]
    fn untagged_startup() {
        let mut buf = BytesMut::new();
        Startup { user: "bob", database: "postgres", application_name: "pglink" }.write(&mut buf);
        let len = i32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len());
        assert_eq!(&buf[4..8], 196608i32.to_be_bytes().as_slice());
        assert_eq!(buf[buf.len() - 1], 0);
        let body = &buf[8..];
        let mut parts = body.split(|b| *b == 0);
        assert_eq!(parts.next().unwrap(), b"user");
        assert_eq!(parts.next().unwrap(), b"bob");
    }

    #[test]
    fn ssl_request() {
        let mut buf = BytesMut::new();
        SslRequest.write(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);
    }

    #[test]
    fn bind_null_and_text() {
        let mut buf = BytesMut::new();
        write(
            Bind { portal_name: "", prepare_name: "s1", params: &[Some("42"), None] },
            &mut buf,
        );
        // tag + declared length == actual frame
        let len = i32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
        assert_eq!(len + 1, buf.len());
        // NULL is length -1 with no value bytes
        let null_pos = buf.len() - (2 + 2) - 4;
        assert_eq!(&buf[null_pos..null_pos + 4], (-1i32).to_be_bytes().as_slice());
    }

    #[test]
    fn zero_body_messages() {
        let mut buf = BytesMut::new();
        write(Sync, &mut buf);
        write(Terminate, &mut buf);
        assert_eq!(&buf[..], b"S\x00\x00\x00\x04X\x00\x00\x00\x04");
    }
}
