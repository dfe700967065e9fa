//! Buffer extension traits shared by the codec.
use bytes::{Buf, BufMut, Bytes};

use crate::error::{Error, Result};

pub(crate) trait UsizeExt {
    /// length is usize in rust, while postgres want i32,
    /// this will panic when overflow instead of wrapping
    fn to_i32(self) -> i32;
    /// length is usize in rust, while sometime postgres want i16,
    /// this will panic when overflow instead of wrapping
    fn to_i16(self) -> i16;
}

impl UsizeExt for usize {
    fn to_i32(self) -> i32 {
        match i32::try_from(self) {
            Ok(ok) => ok,
            Err(err) => panic!("message size too large for protocol: {err}"),
        }
    }

    fn to_i16(self) -> i16 {
        match i16::try_from(self) {
            Ok(ok) => ok,
            Err(err) => panic!("message size too large for protocol: {err}"),
        }
    }
}

pub(crate) trait StrExt {
    /// postgres String must be nul terminated
    fn nul_string_len(&self) -> i32;
}

impl StrExt for str {
    fn nul_string_len(&self) -> i32 {
        self.len().to_i32() + 1/* nul */
    }
}

pub(crate) trait BufMutExt {
    /// postgres String must be nul terminated
    fn put_nul_string(&mut self, string: &str);
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_string(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

/// Checked reads over a backend message body.
///
/// Backend payloads are untrusted, a short body must surface as
/// [`MalformedMessage`][crate::ErrorKind::MalformedMessage] instead of a panic.
pub(crate) trait BufExt {
    fn try_get_u8(&mut self) -> Result<u8>;
    fn try_get_i16(&mut self) -> Result<i16>;
    fn try_get_i32(&mut self) -> Result<i32>;
    fn try_get_u32(&mut self) -> Result<u32>;
    fn try_split_to(&mut self, n: usize) -> Result<Bytes>;
    /// Read a nul terminated UTF-8 string, consuming the terminator.
    fn try_get_nul_string(&mut self) -> Result<String>;
}

impl BufExt for Bytes {
    fn try_get_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(Error::malformed("truncated message body"));
        }
        Ok(self.get_u8())
    }

    fn try_get_i16(&mut self) -> Result<i16> {
        if self.remaining() < 2 {
            return Err(Error::malformed("truncated message body"));
        }
        Ok(self.get_i16())
    }

    fn try_get_i32(&mut self) -> Result<i32> {
        if self.remaining() < 4 {
            return Err(Error::malformed("truncated message body"));
        }
        Ok(self.get_i32())
    }

    fn try_get_u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(Error::malformed("truncated message body"));
        }
        Ok(self.get_u32())
    }

    fn try_split_to(&mut self, n: usize) -> Result<Bytes> {
        if self.remaining() < n {
            return Err(Error::malformed("truncated message body"));
        }
        Ok(self.split_to(n))
    }

    fn try_get_nul_string(&mut self) -> Result<String> {
        let Some(end) = self.iter().position(|e| matches!(e, b'\0')) else {
            return Err(Error::malformed("string is not nul terminated"));
        };
        let raw = self.split_to(end);
        self.advance(1);
        match String::from_utf8(raw.into()) {
            Ok(ok) => Ok(ok),
            Err(err) => Err(Error::malformed(format!("non UTF-8 string: {err}"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nul_string() {
        let mut b = Bytes::from_static(b"UTF8\0rest");
        assert_eq!(b.try_get_nul_string().unwrap(), "UTF8");
        assert_eq!(&b[..], b"rest");
    }

    #[test]
    fn nul_string_unterminated() {
        let mut b = Bytes::from_static(b"UTF8");
        assert!(b.try_get_nul_string().is_err());
    }

    #[test]
    fn truncated_ints() {
        let mut b = Bytes::from_static(&[0, 1]);
        assert!(BufExt::try_get_i32(&mut b).is_err());
        assert_eq!(BufExt::try_get_i16(&mut b).unwrap(), 1);
        assert!(BufExt::try_get_u8(&mut b).is_err());
    }
}
