//! The textual value abstraction.
//!
//! Every parameter is sent and every result column is received in text
//! format. A [`Value`] is therefore either the server's UTF-8 text for a
//! column, or the null marker; typed conversion happens lazily and failures
//! classify as conversion errors, never protocol errors.
use std::fmt;

use crate::{
    datetime::{Date, Time, TimeTz, Timestamp, TimestampTz},
    error::{ErrorKind, Result},
};

/// A postgres value in text format, or SQL `NULL`.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The raw text, `None` for NULL.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Null => None,
        }
    }

    fn text(&self) -> Result<&str> {
        self.as_text().ok_or_else(|| ErrorKind::ValueIsNull.into())
    }

    fn conversion(&self, target: &'static str) -> crate::Error {
        ErrorKind::ValueConversionError {
            raw: self.as_text().unwrap_or_default().to_owned(),
            target,
        }
        .into()
    }

    pub fn string(&self) -> Result<String> {
        Ok(self.text()?.to_owned())
    }

    pub fn int(&self) -> Result<i64> {
        let s = self.text()?;
        s.parse().map_err(|_| self.conversion("int"))
    }

    pub fn double(&self) -> Result<f64> {
        let s = self.text()?;
        // f64's FromStr accepts postgres's NaN / Infinity / -Infinity
        s.parse().map_err(|_| self.conversion("double"))
    }

    pub fn bool(&self) -> Result<bool> {
        match self.text()? {
            "t" | "true" => Ok(true),
            "f" | "false" => Ok(false),
            _ => Err(self.conversion("bool")),
        }
    }

    /// A validated `numeric` in text form. The text is returned as-is so no
    /// precision is lost; callers hand it to their decimal type of choice.
    pub fn decimal(&self) -> Result<String> {
        let s = self.text()?;
        if s == "NaN" || is_decimal_text(s) {
            return Ok(s.to_owned());
        }
        Err(self.conversion("numeric"))
    }

    /// A `bytea` in the `\x`-prefixed hex output format.
    pub fn byte_array(&self) -> Result<Vec<u8>> {
        let s = self.text()?;
        s.strip_prefix("\\x")
            .and_then(|h| hex::decode(h).ok())
            .ok_or_else(|| self.conversion("byte array"))
    }

    pub fn date(&self) -> Result<Date> {
        self.text()?.parse()
    }

    pub fn time(&self) -> Result<Time> {
        self.text()?.parse()
    }

    pub fn time_with_time_zone(&self) -> Result<TimeTz> {
        self.text()?.parse()
    }

    pub fn timestamp(&self) -> Result<Timestamp> {
        self.text()?.parse()
    }

    pub fn timestamp_with_time_zone(&self) -> Result<TimestampTz> {
        self.text()?.parse()
    }
}

/// `[+-] digits [. digits]`, at least one digit overall.
fn is_decimal_text(s: &str) -> bool {
    let s = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (int, frac) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s, None),
    };
    let digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    match frac {
        Some(f) if int.is_empty() => digits(f),
        Some(f) => digits(int) && digits(f),
        None => digits(int),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Null => f.write_str("NULL"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => fmt::Debug::fmt(s, f),
            Value::Null => f.write_str("NULL"),
        }
    }
}

macro_rules! from_display {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Value {
            fn from(value: $ty) -> Value {
                Value::Text(value.to_string())
            }
        }
    )*};
}

from_display!(i16, i32, i64, Date, Time, TimeTz, Timestamp, TimestampTz);

impl From<String> for Value {
    fn from(value: String) -> Value {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::Text(value.to_owned())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Value {
        Value::Text(if value { "t" } else { "f" }.to_owned())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Value {
        // postgres spells the specials differently than rust's Display
        let text = if value.is_nan() {
            "NaN".to_owned()
        } else if value == f64::INFINITY {
            "Infinity".to_owned()
        } else if value == f64::NEG_INFINITY {
            "-Infinity".to_owned()
        } else {
            value.to_string()
        };
        Value::Text(text)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Value {
        Value::from(value as f64)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Value {
        Value::Text(format!("\\x{}", hex::encode(value)))
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Value {
        Value::from(value.as_slice())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Value {
        match value {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
