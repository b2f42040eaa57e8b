//! Packed record codec.
//!
//! Every record starts with a version byte followed by its fields in a fixed
//! order. Integers are big-endian, strings and byte slices carry a `u32`
//! length prefix, timestamps are Unix milliseconds. Readers accept optional
//! trailing fields only while bytes remain, which keeps older records
//! readable after fields are appended.

use bytes::{Buf, BufMut};
use chrono::{DateTime, SubsecRound, Utc};
use thiserror::Error;

/// Drop precision finer than a millisecond so the value unpacks unchanged
pub fn stored_precision(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(3)
}

/// Current time at stored precision
pub fn now() -> DateTime<Utc> {
    stored_precision(Utc::now())
}

/// Errors raised while unpacking a record
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("{record}: unknown version {version}")]
    UnknownVersion { record: &'static str, version: u8 },

    #[error("{record}: truncated buffer")]
    Truncated { record: &'static str },

    #[error("{record}: invalid utf-8 in string field")]
    InvalidUtf8 { record: &'static str },

    #[error("{record}: invalid value {value} for {field}")]
    InvalidValue {
        record: &'static str,
        field: &'static str,
        value: u64,
    },
}

/// Writes fields into a packed buffer
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    pub fn new(version: u8) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.put_u8(version);
        Self { buf }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(v as u8);
        self
    }

    pub fn str(&mut self, v: &str) -> &mut Self {
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v.as_bytes());
        self
    }

    /// Optional string: presence byte then the value
    pub fn opt_str(&mut self, v: Option<&str>) -> &mut Self {
        match v {
            Some(s) => {
                self.buf.put_u8(1);
                self.str(s);
            }
            None => self.buf.put_u8(0),
        }
        self
    }

    pub fn time(&mut self, v: DateTime<Utc>) -> &mut Self {
        self.buf.put_i64(v.timestamp_millis());
        self
    }

    /// Optional timestamp: presence byte then the value
    pub fn opt_time(&mut self, v: Option<DateTime<Utc>>) -> &mut Self {
        match v {
            Some(t) => {
                self.buf.put_u8(1);
                self.buf.put_i64(t.timestamp_millis());
            }
            None => self.buf.put_u8(0),
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads fields back out of a packed buffer
pub struct Unpacker<'a> {
    record: &'static str,
    buf: &'a [u8],
}

impl<'a> Unpacker<'a> {
    /// Checks the version byte against the versions this reader understands
    pub fn new(record: &'static str, buf: &'a [u8], known: &[u8]) -> Result<(Self, u8), CodecError> {
        let mut this = Self { record, buf };
        let version = this.u8()?;
        if !known.contains(&version) {
            return Err(CodecError::UnknownVersion { record, version });
        }
        Ok((this, version))
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated { record: self.record });
        }
        Ok(())
    }

    /// True while optional trailing fields may still follow
    pub fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.u8()? != 0)
    }

    pub fn str(&mut self) -> Result<String, CodecError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        let s = std::str::from_utf8(head)
            .map_err(|_| CodecError::InvalidUtf8 { record: self.record })?
            .to_string();
        self.buf = tail;
        Ok(s)
    }

    pub fn opt_str(&mut self) -> Result<Option<String>, CodecError> {
        if self.u8()? == 0 {
            return Ok(None);
        }
        self.str().map(Some)
    }

    pub fn time(&mut self) -> Result<DateTime<Utc>, CodecError> {
        self.need(8)?;
        let millis = self.buf.get_i64();
        DateTime::from_timestamp_millis(millis).ok_or(CodecError::InvalidValue {
            record: self.record,
            field: "timestamp",
            value: millis as u64,
        })
    }

    pub fn opt_time(&mut self) -> Result<Option<DateTime<Utc>>, CodecError> {
        if self.u8()? == 0 {
            return Ok(None);
        }
        self.time().map(Some)
    }

    pub fn invalid(&self, field: &'static str, value: u64) -> CodecError {
        CodecError::InvalidValue {
            record: self.record,
            field,
            value,
        }
    }
}
