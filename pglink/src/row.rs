//! Postgres row and column metadata.
use std::{fmt, sync::Arc};

use crate::{
    error::{Error, Result},
    protocol::backend::DataRow,
    value::Value,
};

/// One column of a row description.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-ROWDESCRIPTION>
#[derive(Debug, Clone)]
pub struct Column {
    /// The field name.
    pub name: String,
    /// The object ID of the table, or zero.
    pub table_oid: u32,
    /// The attribute number of the column, or zero.
    pub column_id: i16,
    /// The object ID of the field's data type.
    pub type_oid: u32,
    /// The data type size; negative values denote variable-width types.
    pub type_size: i16,
    /// The type modifier; type-specific meaning.
    pub type_modifier: i32,
    /// Zero (text) or one (binary); always zero for this driver.
    pub format: i16,
}

/// One result row.
///
/// Rows own their values and stay valid after the cursor advances or closes.
#[derive(Clone)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[Column]>, data: DataRow) -> Result<Row> {
        if data.values.len() != columns.len() {
            return Err(Error::malformed("DataRow length mismatches RowDescription"));
        }
        let values = data
            .values
            .into_iter()
            .map(|value| match value {
                None => Ok(Value::Null),
                Some(bytes) => match String::from_utf8(bytes.into()) {
                    Ok(text) => Ok(Value::Text(text)),
                    Err(err) => Err(Error::malformed(format!("non UTF-8 column value: {err}"))),
                },
            })
            .collect::<Result<_>>()?;
        Ok(Row { columns, values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The column descriptors shared by every row of the result.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Value by position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value by column name, first match wins.
    pub fn column(&self, name: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(index)
    }

    /// All values in column order.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (column, value) in self.columns.iter().zip(&self.values) {
            dbg.key(&column.name).value(value);
        }
        dbg.finish()
    }
}
