//! The prepared statement handle.
use std::sync::{Arc, Weak};

use crate::{
    connection::Shared,
    cursor::Cursor,
    error::{Error, ErrorKind, Result},
    logger::{LogLevel, plog},
    protocol::{BackendMessage, frontend},
    row::Column,
    value::Value,
};

/// A statement prepared on the server, bound to the session that prepared it.
///
/// Closing a statement closes any cursor it produced; closing the session
/// closes all its statements. Close is idempotent, and a dropped statement
/// closes itself.
pub struct Statement {
    conn: Weak<Shared>,
    name: String,
    sql: String,
    param_types: Vec<u32>,
    columns: Option<Arc<[Column]>>,
    closed: bool,
}

impl Statement {
    pub(crate) fn new(
        conn: Weak<Shared>,
        name: String,
        sql: String,
        param_types: Vec<u32>,
        columns: Option<Arc<[Column]>>,
    ) -> Statement {
        Statement { conn, name, sql, param_types, columns, closed: false }
    }

    /// The SQL text this statement was prepared from.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The server-side prepared statement name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter type OIDs from ParameterDescription.
    ///
    /// Informational: parameters are always sent in text format and the
    /// server coerces them itself.
    pub fn parameter_types(&self) -> &[u32] {
        &self.param_types
    }

    /// Column descriptors from RowDescription.
    ///
    /// A statement that returns no rows (Describe answered NoData) has no
    /// column metadata.
    pub fn columns(&self) -> Result<&[Column]> {
        self.columns
            .as_deref()
            .ok_or_else(|| ErrorKind::ColumnMetadataNotAvailable.into())
    }

    pub fn is_closed(&self) -> bool {
        if self.closed {
            return true;
        }
        match self.conn.upgrade() {
            Some(shared) => shared.control.is_closed(),
            None => true,
        }
    }

    /// Bind `params` and execute, returning the cursor over the results.
    ///
    /// The session's current cursor, if any, is closed first.
    pub fn execute(&self, params: &[Value]) -> Result<Cursor> {
        let shared = self
            .conn
            .upgrade()
            .ok_or(ErrorKind::ConnectionClosed)?;

        let generation = shared.op(|inner| {
            if self.closed {
                return Err(ErrorKind::StatementClosed.into());
            }
            inner.close_open_cursor()?;

            let params: Vec<Option<&str>> = params.iter().map(Value::as_text).collect();
            inner.send(frontend::Bind {
                portal_name: "",
                prepare_name: &self.name,
                params: &params,
            })?;
            inner.send(frontend::Execute { portal_name: "", max_row: 0 })?;
            inner.send(frontend::Sync)?;
            inner.flush()?;

            match inner.receive_expected()? {
                BackendMessage::BindComplete => {}
                msg => return Err(Error::unexpected("statement execute", msg.tag())),
            }

            Ok(inner.open_new_cursor())
        })?;

        Ok(Cursor::new(self.conn.clone(), generation, self.columns.clone()))
    }

    /// Close the statement on the server. Idempotent; a no-op once the
    /// session is closed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let Some(shared) = self.conn.upgrade() else { return };
        let result = shared.op(|inner| {
            // the Close cannot interleave with a streaming cursor, so the
            // current cursor is resolved first whichever statement owns it
            inner.close_open_cursor()?;
            inner.send(frontend::Close { kind: b'S', name: &self.name })?;
            inner.send(frontend::Sync)?;
            inner.flush()?;
            // CloseComplete, then ReadyForQuery
            inner.drain_ready()
        });

        if let Err(err) = result {
            if !matches!(err.kind(), ErrorKind::ConnectionClosed) {
                plog!(LogLevel::Warning, shared.control.id(), "error closing statement {}: {err}", self.name);
            }
        }
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("name", &self.name)
            .field("sql", &self.sql)
            .field("closed", &self.closed)
            .finish()
    }
}
