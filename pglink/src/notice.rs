//! The [`Notice`] field set carried by `ErrorResponse` and `NoticeResponse`.
use std::fmt;

use bytes::Bytes;

use crate::{error::Result, ext::BufExt};

/// Fields of a backend `ErrorResponse` or `NoticeResponse`.
///
/// The message body consists of one or more identified fields, followed by a
/// zero byte as a terminator. Fields can appear in any order, and unrecognized
/// field types are silently ignored.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug, Default, Clone)]
pub struct Notice {
    /// Severity, non-localized (`ERROR`, `FATAL`, `PANIC`, `WARNING`,
    /// `NOTICE`, `DEBUG`, `INFO`, or `LOG`).
    pub severity: Option<String>,
    /// Severity in the session's localized language.
    pub localized_severity: Option<String>,
    /// SQLSTATE code.
    pub code: Option<String>,
    /// Primary human-readable error message.
    pub message: Option<String>,
    /// Secondary error message carrying more detail.
    pub detail: Option<String>,
    /// Suggestion what to do about the problem.
    pub hint: Option<String>,
    /// Error cursor position as an index into the original query string.
    pub position: Option<String>,
    /// Like `position`, but for an internally generated command.
    pub internal_position: Option<String>,
    /// Text of the failed internally generated command.
    pub internal_query: Option<String>,
    /// Context in which the error occurred.
    pub r#where: Option<String>,
    /// Schema name associated with the error.
    pub schema: Option<String>,
    /// Table name associated with the error.
    pub table: Option<String>,
    /// Column name associated with the error.
    pub column: Option<String>,
    /// Data type name associated with the error.
    pub data_type: Option<String>,
    /// Constraint name associated with the error.
    pub constraint: Option<String>,
    /// Source-code file name where the error was reported.
    pub file: Option<String>,
    /// Source-code line number where the error was reported.
    pub line: Option<String>,
    /// Source-code routine reporting the error.
    pub routine: Option<String>,
}

impl Notice {
    /// Decode the field-tagged body shared by `ErrorResponse` and
    /// `NoticeResponse`.
    pub(crate) fn decode(mut body: Bytes) -> Result<Notice> {
        let mut notice = Notice::default();
        loop {
            let tag = body.try_get_u8()?;
            if tag == b'\0' {
                break;
            }
            let value = body.try_get_nul_string()?;
            let field = match tag {
                b'V' => &mut notice.severity,
                b'S' => &mut notice.localized_severity,
                b'C' => &mut notice.code,
                b'M' => &mut notice.message,
                b'D' => &mut notice.detail,
                b'H' => &mut notice.hint,
                b'P' => &mut notice.position,
                b'p' => &mut notice.internal_position,
                b'q' => &mut notice.internal_query,
                b'W' => &mut notice.r#where,
                b's' => &mut notice.schema,
                b't' => &mut notice.table,
                b'c' => &mut notice.column,
                b'd' => &mut notice.data_type,
                b'n' => &mut notice.constraint,
                b'F' => &mut notice.file,
                b'L' => &mut notice.line,
                b'R' => &mut notice.routine,
                _ => continue,
            };
            *field = Some(value);
        }
        Ok(notice)
    }

    /// Severity, preferring the non-localized field the server sends
    /// since 9.6.
    pub fn effective_severity(&self) -> Option<&str> {
        self.severity
            .as_deref()
            .or(self.localized_severity.as_deref())
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.effective_severity(), self.code.as_deref()) {
            (Some(sev), Some(code)) => write!(f, "{sev} {code}: ")?,
            (Some(sev), None) => write!(f, "{sev}: ")?,
            (None, Some(code)) => write!(f, "{code}: ")?,
            (None, None) => {}
        }
        f.write_str(self.message.as_deref().unwrap_or("(no message)"))
    }
}
