//! Big-endian primitives shared by the envelope, routing frame and payload codecs.
//!
//! Strings and byte blocks are written as a `u32` length followed by the raw
//! bytes. Every read is bounds-checked and reports truncation as
//! [`LinkError::MalformedEnvelope`].

use crate::error::LinkError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub(crate) trait WireWrite {
    fn put_wire_str(&mut self, value: &str);
    fn put_wire_bytes(&mut self, value: &[u8]);
}

impl WireWrite for BytesMut {
    fn put_wire_str(&mut self, value: &str) {
        self.put_wire_bytes(value.as_bytes());
    }

    fn put_wire_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.put_slice(value);
    }
}

/// Cursor over a received buffer.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn need(&self, len: usize, field: &str) -> Result<(), LinkError> {
        if self.buf.remaining() < len {
            return Err(LinkError::MalformedEnvelope(format!(
                "{} truncated reading {field}: need {len} bytes, {} left",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u32(&mut self, field: &str) -> Result<u32, LinkError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self, field: &str) -> Result<u64, LinkError> {
        self.need(8, field)?;
        Ok(self.buf.get_u64())
    }

    pub fn bytes(&mut self, field: &str) -> Result<Bytes, LinkError> {
        let len = self.u32(field)? as usize;
        self.need(len, field)?;
        let out = Bytes::copy_from_slice(&self.buf[..len]);
        self.buf.advance(len);
        Ok(out)
    }

    pub fn string(&mut self, field: &str) -> Result<String, LinkError> {
        let raw = self.bytes(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| {
            LinkError::MalformedEnvelope(format!("{} field {field} is not valid UTF-8", self.what))
        })
    }

    /// Whatever is left in the buffer.
    pub fn rest(&mut self) -> Bytes {
        let out = Bytes::copy_from_slice(self.buf);
        self.buf.advance(self.buf.len());
        out
    }

    pub fn finish(self) -> Result<(), LinkError> {
        if self.buf.has_remaining() {
            return Err(LinkError::MalformedEnvelope(format!(
                "{} has {} trailing bytes",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
