//! Postgres backend messages.
use bytes::Bytes;

use crate::{
    error::{Error, Result},
    ext::BufExt,
    notice::Notice,
    row::Column,
};

/// A type that can be decoded from a postgres backend message.
pub trait BackendProtocol: Sized {
    fn decode(tag: u8, body: Bytes) -> Result<Self>;
}

/// Postgres backend messages.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete,
    CloseComplete,
    CommandComplete(CommandComplete),
    DataRow(DataRow),
    EmptyQueryResponse,
    ErrorResponse(Notice),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData,
    NoticeResponse(Notice),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete,
    PortalSuspended,
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

impl BackendMessage {
    /// The wire tag of this message.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Authentication(_) => b'R',
            Self::BackendKeyData(_) => b'K',
            Self::BindComplete => b'2',
            Self::CloseComplete => b'3',
            Self::CommandComplete(_) => b'C',
            Self::DataRow(_) => b'D',
            Self::EmptyQueryResponse => b'I',
            Self::ErrorResponse(_) => b'E',
            Self::NegotiateProtocolVersion(_) => b'v',
            Self::NoData => b'n',
            Self::NoticeResponse(_) => b'N',
            Self::NotificationResponse(_) => b'A',
            Self::ParameterDescription(_) => b't',
            Self::ParameterStatus(_) => b'S',
            Self::ParseComplete => b'1',
            Self::PortalSuspended => b's',
            Self::ReadyForQuery(_) => b'Z',
            Self::RowDescription(_) => b'T',
        }
    }
}

impl BackendProtocol for BackendMessage {
    fn decode(tag: u8, body: Bytes) -> Result<Self> {
        let message = match tag {
            b'R' => Self::Authentication(Authentication::decode(tag, body)?),
            b'K' => Self::BackendKeyData(BackendKeyData::decode(tag, body)?),
            b'2' => Self::BindComplete,
            b'3' => Self::CloseComplete,
            b'C' => Self::CommandComplete(CommandComplete::decode(tag, body)?),
            b'D' => Self::DataRow(DataRow::decode(tag, body)?),
            b'I' => Self::EmptyQueryResponse,
            b'E' => Self::ErrorResponse(Notice::decode(body)?),
            b'v' => Self::NegotiateProtocolVersion(NegotiateProtocolVersion::decode(tag, body)?),
            b'n' => Self::NoData,
            b'N' => Self::NoticeResponse(Notice::decode(body)?),
            b'A' => Self::NotificationResponse(NotificationResponse::decode(tag, body)?),
            b't' => Self::ParameterDescription(ParameterDescription::decode(tag, body)?),
            b'S' => Self::ParameterStatus(ParameterStatus::decode(tag, body)?),
            b'1' => Self::ParseComplete,
            b's' => Self::PortalSuspended,
            b'Z' => Self::ReadyForQuery(ReadyForQuery::decode(tag, body)?),
            b'T' => Self::RowDescription(RowDescription::decode(tag, body)?),
            tag => {
                return Err(Error::malformed(format!(
                    "unsupported backend message {:?}",
                    char::from(tag)
                )));
            }
        };
        Ok(message)
    }
}

/// Identifies the message as an authentication request.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[derive(Debug)]
pub enum Authentication {
    /// Int32(0) Specifies that the authentication was successful.
    Ok,
    /// Int32(3) Specifies that a clear-text password is required.
    CleartextPassword,
    /// Int32(5) Specifies that an MD5-encrypted password is required.
    /// Byte4 The salt to use when encrypting the password.
    Md5Password { salt: [u8; 4] },
    /// Int32(10) Specifies that SASL authentication is required.
    ///
    /// The message body is a list of SASL authentication mechanisms, in the
    /// server's order of preference, terminated by a zero byte.
    Sasl { mechanisms: Vec<String> },
    /// Int32(11) Specifies that this message contains a SASL challenge.
    SaslContinue { data: Bytes },
    /// Int32(12) Specifies that SASL authentication has completed.
    SaslFinal { data: Bytes },
    /// Any other authentication request (KerberosV5, SCMCredential, GSS,
    /// SSPI, ...). The driver does not speak these.
    Other(i32),
}

impl Authentication {
    /// Name of a request the driver does not implement, for error reporting.
    pub fn type_name(code: i32) -> String {
        match code {
            2 => "KerberosV5".into(),
            6 => "SCMCredential".into(),
            7 => "GSS".into(),
            8 => "GSSContinue".into(),
            9 => "SSPI".into(),
            code => format!("authentication code {code}"),
        }
    }
}

impl BackendProtocol for Authentication {
    fn decode(_: u8, mut body: Bytes) -> Result<Self> {
        let auth = match BufExt::try_get_i32(&mut body)? {
            0 => Authentication::Ok,
            3 => Authentication::CleartextPassword,
            5 => {
                let raw = body.try_split_to(4)?;
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&raw);
                Authentication::Md5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                loop {
                    match body.try_get_nul_string()? {
                        m if m.is_empty() => break,
                        m => mechanisms.push(m),
                    }
                }
                Authentication::Sasl { mechanisms }
            }
            11 => Authentication::SaslContinue { data: body },
            12 => Authentication::SaslFinal { data: body },
            code => Authentication::Other(code),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue
/// CancelRequest messages later.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: i32,
    /// The secret key of this backend.
    pub secret_key: i32,
}

impl BackendProtocol for BackendKeyData {
    fn decode(_: u8, mut body: Bytes) -> Result<Self> {
        Ok(Self {
            process_id: BufExt::try_get_i32(&mut body)?,
            secret_key: BufExt::try_get_i32(&mut body)?,
        })
    }
}

/// Identifies the message as a command-completed response.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag, usually a single word identifying which SQL command
    /// was completed, e.g. `SELECT 2`, `INSERT 0 1`, `UPDATE 0`.
    pub tag: String,
}

impl CommandComplete {
    /// Rows affected, parsed from the trailing count of the tag.
    ///
    /// Tags without a count (`BEGIN`, `COMMIT`, ...) yield `None`.
    pub fn rows(&self) -> Option<u64> {
        self.tag.rsplit(' ').next()?.parse().ok()
    }
}

impl BackendProtocol for CommandComplete {
    fn decode(_: u8, mut body: Bytes) -> Result<Self> {
        Ok(Self { tag: body.try_get_nul_string()? })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// Column values in the order of the row description; `None` is NULL.
    pub values: Vec<Option<Bytes>>,
}

impl BackendProtocol for DataRow {
    fn decode(_: u8, mut body: Bytes) -> Result<Self> {
        // The number of column values that follow (possibly zero).
        let len = BufExt::try_get_i16(&mut body)?;
        let mut values = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            // Int32 the length of the column value, -1 indicates NULL
            let value = match BufExt::try_get_i32(&mut body)? {
                -1 => None,
                n if n < 0 => return Err(Error::malformed("negative column length")),
                n => Some(body.try_split_to(n as usize)?),
            };
            values.push(value);
        }
        Ok(Self { values })
    }
}

/// Identifies the message as a protocol version negotiation.
///
/// Sent when the server does not support the minor protocol version or a
/// `_pq_.`-prefixed option requested by the frontend.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server.
    pub newest_minor: i32,
    /// Protocol options not recognized by the server.
    pub unsupported_options: Vec<String>,
}

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(_: u8, mut body: Bytes) -> Result<Self> {
        let newest_minor = BufExt::try_get_i32(&mut body)?;
        let count = BufExt::try_get_i32(&mut body)?;
        let mut unsupported_options = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            unsupported_options.push(body.try_get_nul_string()?);
        }
        Ok(Self { newest_minor, unsupported_options })
    }
}

/// Identifies the message as a notification response.
#[derive(Debug, Clone)]
pub struct NotificationResponse {
    /// The process ID of the notifying backend process.
    pub process_id: i32,
    /// The name of the channel that the notify has been raised on.
    pub channel: String,
    /// The "payload" string passed from the notifying process.
    pub payload: String,
}

impl BackendProtocol for NotificationResponse {
    fn decode(_: u8, mut body: Bytes) -> Result<Self> {
        Ok(Self {
            process_id: BufExt::try_get_i32(&mut body)?,
            channel: body.try_get_nul_string()?,
            payload: body.try_get_nul_string()?,
        })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug)]
pub struct ParameterDescription {
    /// The object ID of each parameter data type.
    pub type_oids: Vec<u32>,
}

impl BackendProtocol for ParameterDescription {
    fn decode(_: u8, mut body: Bytes) -> Result<Self> {
        let len = BufExt::try_get_i16(&mut body)?;
        let mut type_oids = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            type_oids.push(BufExt::try_get_u32(&mut body)?);
        }
        Ok(Self { type_oids })
    }
}

/// Identifies the message as a run-time parameter status report.
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported.
    pub name: String,
    /// The current value of the parameter.
    pub value: String,
}

impl BackendProtocol for ParameterStatus {
    fn decode(_: u8, mut body: Bytes) -> Result<Self> {
        Ok(Self {
            name: body.try_get_nul_string()?,
            value: body.try_get_nul_string()?,
        })
    }
}

/// Transaction status carried by [`ReadyForQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `'I'`: idle, not in a transaction block.
    Idle,
    /// `'T'`: in a transaction block.
    InTransaction,
    /// `'E'`: in a failed transaction block, queries are rejected until the
    /// block is ended.
    Failed,
}

/// Identifies the message as a ready-for-query indicator, sent whenever the
/// backend is ready for a new query cycle.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl BackendProtocol for ReadyForQuery {
    fn decode(_: u8, mut body: Bytes) -> Result<Self> {
        let status = match BufExt::try_get_u8(&mut body)? {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            s => {
                return Err(Error::malformed(format!(
                    "unknown transaction status {:?}",
                    char::from(s)
                )));
            }
        };
        Ok(Self { status })
    }
}

/// Identifies the message as a row description.
#[derive(Debug)]
pub struct RowDescription {
    pub columns: Vec<Column>,
}

impl BackendProtocol for RowDescription {
    fn decode(_: u8, mut body: Bytes) -> Result<Self> {
        // Int16 Specifies the number of fields in a row (can be zero).
        let len = BufExt::try_get_i16(&mut body)?;
        let mut columns = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            columns.push(Column {
                name: body.try_get_nul_string()?,
                // If the field can be identified as a column of a specific
                // table, the object ID of the table; otherwise zero.
                table_oid: BufExt::try_get_u32(&mut body)?,
                // The attribute number of the column; otherwise zero.
                column_id: BufExt::try_get_i16(&mut body)?,
                // The object ID of the field's data type.
                type_oid: BufExt::try_get_u32(&mut body)?,
                // The data type size; negative values denote
                // variable-width types.
                type_size: BufExt::try_get_i16(&mut body)?,
                // The type modifier; the meaning is type-specific.
                type_modifier: BufExt::try_get_i32(&mut body)?,
                // Zero (text) or one (binary). In a RowDescription returned
                // from the statement variant of Describe, always zero.
                format: BufExt::try_get_i16(&mut body)?,
            });
        }
        Ok(Self { columns })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ready_for_query_status() {
        let m = ReadyForQuery::decode(b'Z', Bytes::from_static(b"T")).unwrap();
        assert_eq!(m.status, TransactionStatus::InTransaction);
        assert!(ReadyForQuery::decode(b'Z', Bytes::from_static(b"x")).is_err());
        assert!(ReadyForQuery::decode(b'Z', Bytes::new()).is_err());
    }

    #[test]
    fn authentication_sasl_mechanisms() {
        let body = Bytes::from_static(b"\x00\x00\x00\x0aSCRAM-SHA-256\0SCRAM-SHA-256-PLUS\0\0");
        match Authentication::decode(b'R', body).unwrap() {
            Authentication::Sasl { mechanisms } => {
                assert_eq!(mechanisms, ["SCRAM-SHA-256", "SCRAM-SHA-256-PLUS"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn authentication_md5_salt() {
        let body = Bytes::from_static(&[0, 0, 0, 5, 1, 2, 3, 4]);
        match Authentication::decode(b'R', body).unwrap() {
            Authentication::Md5Password { salt } => assert_eq!(salt, [1, 2, 3, 4]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn data_row_nulls() {
        let body = Bytes::from_static(&[
            0, 2, // two columns
            0xff, 0xff, 0xff, 0xff, // NULL
            0, 0, 0, 2, b'4', b'2',
        ]);
        let row = DataRow::decode(b'D', body).unwrap();
        assert_eq!(row.values[0], None);
        assert_eq!(row.values[1].as_deref(), Some(b"42".as_slice()));
    }

    #[test]
    fn data_row_truncated() {
        let body = Bytes::from_static(&[0, 1, 0, 0, 0, 9, b'x']);
        assert!(DataRow::decode(b'D', body).is_err());
    }

    #[test]
    fn command_complete_rows() {
        let rows = |tag: &str| CommandComplete { tag: tag.into() }.rows();
        assert_eq!(rows("SELECT 2"), Some(2));
        assert_eq!(rows("INSERT 0 1"), Some(1));
        assert_eq!(rows("UPDATE 3"), Some(3));
        assert_eq!(rows("DELETE 0"), Some(0));
        assert_eq!(rows("BEGIN"), None);
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(BackendMessage::decode(b'!', Bytes::new()).is_err());
    }
}
