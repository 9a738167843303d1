// ABOUTME: Self-delimiting binary encoding of typed values over blocking streams
// ABOUTME: One byte tag per value; integers big-endian; bytes and arrays length-prefixed

use std::io::{Read, Write};

use crate::errors::{Result, SyncError};
use crate::protocol::value::{Row, Value};

const TAG_NIL: u8 = 0x00;
const TAG_UINT: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_BYTES: u8 = 0x03;
const TAG_ARRAY: u8 = 0x04;

/// Refuse to allocate for absurd lengths; no legitimate frame carries a
/// single value this large.
const MAX_LENGTH: u32 = 64 * 1024 * 1024;

/// Serializes values onto a writer. One `Packer` owns each half-duplex
/// output stream; callers must `flush` at the end of every logical message.
pub struct Packer<W: Write> {
    writer: W,
}

impl<W: Write> Packer<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_nil(&mut self) -> Result<()> {
        self.writer.write_all(&[TAG_NIL])?;
        Ok(())
    }

    pub fn write_uint(&mut self, value: u64) -> Result<()> {
        self.writer.write_all(&[TAG_UINT])?;
        self.writer.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    pub fn write_int(&mut self, value: i64) -> Result<()> {
        self.writer.write_all(&[TAG_INT])?;
        self.writer.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(&[TAG_BYTES])?;
        self.writer.write_all(&(value.len() as u32).to_be_bytes())?;
        self.writer.write_all(value)?;
        Ok(())
    }

    pub fn write_array_header(&mut self, count: u32) -> Result<()> {
        self.writer.write_all(&[TAG_ARRAY])?;
        self.writer.write_all(&count.to_be_bytes())?;
        Ok(())
    }

    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Nil => self.write_nil(),
            Value::Uint(u) => self.write_uint(*u),
            Value::Int(i) => self.write_int(*i),
            Value::Bytes(b) => self.write_bytes(b),
            Value::Array(values) => {
                self.write_array_header(values.len() as u32)?;
                for v in values {
                    self.write_value(v)?;
                }
                Ok(())
            }
        }
    }

    /// One row on the wire: an array of its values in column order.
    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        self.write_array_header(row.len() as u32)?;
        for value in row {
            self.write_value(value)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Deserializes values from a reader, failing with `SyncError::Protocol` on
/// unknown tags or EOF in the middle of a value.
pub struct Unpacker<R: Read> {
    reader: R,
}

impl<R: Read> Unpacker<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    fn read_tag(&mut self) -> Result<u8> {
        let mut tag = [0u8; 1];
        self.reader
            .read_exact(&mut tag)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    SyncError::protocol("unexpected end of stream")
                }
                _ => SyncError::Io(e),
            })?;
        Ok(tag[0])
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                SyncError::protocol("stream truncated inside a value")
            }
            _ => SyncError::Io(e),
        })
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_length(&mut self) -> Result<u32> {
        let len = self.read_u32()?;
        if len > MAX_LENGTH {
            return Err(SyncError::protocol(format!(
                "length {} exceeds the {} byte limit",
                len, MAX_LENGTH
            )));
        }
        Ok(len)
    }

    fn finish_value(&mut self, tag: u8) -> Result<Value> {
        match tag {
            TAG_NIL => Ok(Value::Nil),
            TAG_UINT => Ok(Value::Uint(self.read_u64()?)),
            TAG_INT => {
                let mut buf = [0u8; 8];
                self.read_exact(&mut buf)?;
                Ok(Value::Int(i64::from_be_bytes(buf)))
            }
            TAG_BYTES => {
                let len = self.read_length()? as usize;
                let mut buf = vec![0u8; len];
                self.read_exact(&mut buf)?;
                Ok(Value::Bytes(buf))
            }
            TAG_ARRAY => {
                let count = self.read_length()?;
                let mut values = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    values.push(self.read_value()?);
                }
                Ok(Value::Array(values))
            }
            other => Err(SyncError::protocol(format!(
                "unknown type tag 0x{:02x}",
                other
            ))),
        }
    }

    pub fn read_value(&mut self) -> Result<Value> {
        let tag = self.read_tag()?;
        self.finish_value(tag)
    }

    pub fn read_uint(&mut self) -> Result<u64> {
        match self.read_value()? {
            Value::Uint(u) => Ok(u),
            other => Err(SyncError::protocol(format!(
                "expected an unsigned integer, got {:?}",
                other
            ))),
        }
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        match self.read_value()? {
            Value::Bytes(b) => Ok(b),
            other => Err(SyncError::protocol(format!(
                "expected a byte string, got {:?}",
                other
            ))),
        }
    }

    pub fn read_nil(&mut self) -> Result<()> {
        match self.read_value()? {
            Value::Nil => Ok(()),
            other => Err(SyncError::protocol(format!("expected nil, got {:?}", other))),
        }
    }

    pub fn read_array_header(&mut self) -> Result<u32> {
        match self.read_tag()? {
            TAG_ARRAY => self.read_length(),
            other => Err(SyncError::protocol(format!(
                "expected an array, got type tag 0x{:02x}",
                other
            ))),
        }
    }

    /// Reads the next entry of a row stream: a row, or `None` at the nil
    /// sentinel that terminates the stream.
    pub fn read_row(&mut self) -> Result<Option<Row>> {
        match self.read_tag()? {
            TAG_NIL => Ok(None),
            TAG_ARRAY => {
                let count = self.read_length()?;
                let mut row = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    row.push(self.read_value()?);
                }
                Ok(Some(row))
            }
            other => Err(SyncError::protocol(format!(
                "expected a row or end-of-rows, got type tag 0x{:02x}",
                other
            ))),
        }
    }
}
