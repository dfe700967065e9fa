//! The cursor handle, a forward-only iterator over one execution's rows.
use std::sync::{Arc, Weak};

use crate::{
    connection::Shared,
    error::{Error, ErrorKind, Result},
    logger::{LogLevel, plog},
    protocol::BackendMessage,
    row::{Column, Row},
};

/// Streams the rows of one statement execution.
///
/// Advancement is synchronous: each [`next`][Iterator::next] reads from the
/// socket. A cursor that has consumed CommandComplete is *drained*: it stays
/// iterable (yielding nothing) without further protocol traffic until closed
/// or superseded. The session allows at most one live cursor; obtaining a
/// new one closes this one, after which operations fail with
/// [`CursorClosed`][ErrorKind::CursorClosed].
pub struct Cursor {
    conn: Weak<Shared>,
    generation: u64,
    columns: Option<Arc<[Column]>>,
    row_count: Option<u64>,
    closed: bool,
}

impl Cursor {
    pub(crate) fn new(conn: Weak<Shared>, generation: u64, columns: Option<Arc<[Column]>>) -> Cursor {
        Cursor { conn, generation, columns, row_count: None, closed: false }
    }

    /// Rows affected, known once CommandComplete has been consumed.
    pub fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    /// Whether the result stream has been fully consumed.
    pub fn is_drained(&self) -> bool {
        let Some(shared) = self.conn.upgrade() else { return false };
        let inner = shared.inner.lock();
        inner
            .open_cursor()
            .is_some_and(|c| c.generation == self.generation && c.drained)
    }

    /// A cursor is closed once [`close`][Cursor::close]d, superseded by a
    /// newer cursor, or orphaned by its session closing.
    pub fn is_closed(&self) -> bool {
        if self.closed {
            return true;
        }
        let Some(shared) = self.conn.upgrade() else { return true };
        if shared.control.is_closed() {
            return true;
        }
        let inner = shared.inner.lock();
        !inner
            .open_cursor()
            .is_some_and(|c| c.generation == self.generation)
    }

    fn advance(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Err(ErrorKind::CursorClosed.into());
        }
        let shared = self.conn.upgrade().ok_or(ErrorKind::ConnectionClosed)?;

        shared.op(|inner| {
            match inner.open_cursor() {
                Some(cursor) if cursor.generation == self.generation => {}
                _ => return Err(ErrorKind::CursorClosed.into()),
            }
            if inner.open_cursor().is_some_and(|c| c.drained) {
                return Ok(None);
            }

            loop {
                match inner.receive_message()? {
                    BackendMessage::DataRow(data) => {
                        let columns = self
                            .columns
                            .clone()
                            .ok_or(ErrorKind::ColumnMetadataNotAvailable)?;
                        return Ok(Some(Row::new(columns, data)?));
                    }
                    BackendMessage::CommandComplete(complete) => {
                        inner.expect_ready()?;
                        if let Some(cursor) = inner.open_cursor_mut() {
                            cursor.drained = true;
                        }
                        self.row_count = complete.rows();
                        return Ok(None);
                    }
                    BackendMessage::EmptyQueryResponse | BackendMessage::PortalSuspended => {
                        inner.expect_ready()?;
                        if let Some(cursor) = inner.open_cursor_mut() {
                            cursor.drained = true;
                        }
                        return Ok(None);
                    }
                    BackendMessage::ErrorResponse(notice) => {
                        inner.drain_ready()?;
                        inner.take_open_cursor();
                        self.closed = true;
                        return Err(notice.into());
                    }
                    msg => return Err(Error::unexpected("cursor advance", msg.tag())),
                }
            }
        })
    }

    /// Close the cursor. Close(portal)/Sync goes on the wire only when the
    /// cursor is not drained. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let Some(shared) = self.conn.upgrade() else { return };
        let result = shared.op(|inner| {
            match inner.open_cursor() {
                Some(cursor) if cursor.generation == self.generation => {}
                _ => return Ok(()),
            }
            inner.close_open_cursor()
        });

        if let Err(err) = result {
            if !matches!(err.kind(), ErrorKind::ConnectionClosed) {
                plog!(LogLevel::Warning, shared.control.id(), "error closing cursor: {err}");
            }
        }
    }
}

impl Iterator for Cursor {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("row_count", &self.row_count)
            .field("closed", &self.closed)
            .finish()
    }
}
