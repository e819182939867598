//! Tagged serialization of resources.
//!
//! A serialized resource is its type's `u32` tag followed by whatever the
//! type writes. Dispatch goes `TypeId → serializer` on the way out and
//! `tag → deserializer` on the way back.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::wrapper::Resource;

/// A resource that can be written to and read from a byte stream.
pub trait Serializable: Resource {
    /// Unique within one type set.
    const TAG: u32;

    fn serialize(&self, serializer: &mut Serializer) -> Result<()>;

    fn deserialize(deserializer: &mut Deserializer) -> Result<Self>;
}

/// Little-endian writer.
#[derive(Debug, Default)]
pub struct Serializer {
    buf: BytesMut,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    /// Length-prefixed bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.write_u32(data.len() as u32);
        self.buf.put_slice(data);
    }

    pub fn write_str(&mut self, text: &str) {
        self.write_bytes(text.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reader over a [`Serializer`]'s output.
#[derive(Debug, Clone)]
pub struct Deserializer {
    buf: Bytes,
}

impl Deserializer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { buf: data.into() }
    }

    fn need(&self, len: usize) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(Error::range_error(format!(
                "unexpected end of serialized data (need {len}, have {})",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64_le())
    }

    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let data = self.read_bytes()?;
        String::from_utf8(data.to_vec())
            .map_err(|_| Error::type_error("serialized string is not valid UTF-8"))
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}
