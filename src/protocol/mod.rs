// ABOUTME: Command verbs and framing for the worker-pair wire protocol
// ABOUTME: A command is an array frame of verb plus typed arguments

pub mod codec;
pub mod value;

use std::io::{Read, Write};

use crate::errors::{Result, SyncError};
use codec::{Packer, Unpacker};
use value::{ColumnValues, Value};

/// The protocol version this build speaks. Negotiation settles on the
/// minimum of both ends' versions; anything below `PROTOCOL_VERSION_MIN`
/// is refused.
pub const PROTOCOL_VERSION: u64 = 1;
pub const PROTOCOL_VERSION_MIN: u64 = 1;

/// Advisory lower bound on the byte size of a hashed range. Needs to be
/// large enough to amortize a round trip over a moderate-latency link.
pub const DEFAULT_TARGET_BLOCK_SIZE: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verb {
    Quit = 0,
    Rows = 2,
    HashNext = 3,
    HashFail = 4,
    RowsAndHashNext = 5,
    RowsAndHashFail = 6,
    Open = 7,
    Protocol = 32,
    TargetBlockSize = 33,
    ExportSnapshot = 34,
    ImportSnapshot = 35,
    UnholdSnapshot = 36,
    WithoutSnapshot = 37,
    Schema = 38,
}

impl Verb {
    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::Quit),
            2 => Some(Self::Rows),
            3 => Some(Self::HashNext),
            4 => Some(Self::HashFail),
            5 => Some(Self::RowsAndHashNext),
            6 => Some(Self::RowsAndHashFail),
            7 => Some(Self::Open),
            32 => Some(Self::Protocol),
            33 => Some(Self::TargetBlockSize),
            34 => Some(Self::ExportSnapshot),
            35 => Some(Self::ImportSnapshot),
            36 => Some(Self::UnholdSnapshot),
            37 => Some(Self::WithoutSnapshot),
            38 => Some(Self::Schema),
            _ => None,
        }
    }
}

/// One decoded protocol frame.
#[derive(Debug, Clone)]
pub struct Command {
    pub verb: Verb,
    pub args: Vec<Value>,
}

impl Command {
    fn arg(&self, index: usize) -> Result<&Value> {
        self.args.get(index).ok_or_else(|| {
            SyncError::protocol(format!(
                "{:?} command is missing argument {}",
                self.verb, index
            ))
        })
    }

    /// A key tuple argument: an array of scalar values.
    pub fn key_arg(&self, index: usize) -> Result<ColumnValues> {
        match self.arg(index)? {
            Value::Array(values) => Ok(values.clone()),
            other => Err(SyncError::protocol(format!(
                "{:?} argument {} should be a key tuple, got {:?}",
                self.verb, index, other
            ))),
        }
    }

    pub fn bytes_arg(&self, index: usize) -> Result<Vec<u8>> {
        match self.arg(index)? {
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(SyncError::protocol(format!(
                "{:?} argument {} should be a byte string, got {:?}",
                self.verb, index, other
            ))),
        }
    }

    pub fn str_arg(&self, index: usize) -> Result<String> {
        String::from_utf8(self.bytes_arg(index)?).map_err(|_| {
            SyncError::protocol(format!(
                "{:?} argument {} is not valid UTF-8",
                self.verb, index
            ))
        })
    }

    pub fn uint_arg(&self, index: usize) -> Result<u64> {
        match self.arg(index)? {
            Value::Uint(u) => Ok(*u),
            other => Err(SyncError::protocol(format!(
                "{:?} argument {} should be an unsigned integer, got {:?}",
                self.verb, index, other
            ))),
        }
    }
}

/// Writes a command frame. The caller flushes once the whole logical
/// message (frame plus any trailing row data) has been written, so a broken
/// pipe surfaces as `Io` rather than leaving a half-frame behind.
pub fn write_command<W: Write>(packer: &mut Packer<W>, verb: Verb, args: &[Value]) -> Result<()> {
    packer.write_array_header(args.len() as u32 + 1)?;
    packer.write_uint(verb as u64)?;
    for arg in args {
        packer.write_value(arg)?;
    }
    Ok(())
}

/// Reads one command frame, failing with a protocol error on EOF or an
/// unrecognized verb.
pub fn read_command<R: Read>(unpacker: &mut Unpacker<R>) -> Result<Command> {
    let count = unpacker.read_array_header()?;
    if count == 0 {
        return Err(SyncError::protocol("empty command frame"));
    }
    let verb_number = unpacker.read_uint()?;
    let verb = Verb::from_u64(verb_number)
        .ok_or_else(|| SyncError::protocol(format!("unknown command verb {}", verb_number)))?;
    let mut args = Vec::with_capacity(count as usize - 1);
    for _ in 1..count {
        args.push(unpacker.read_value()?);
    }
    Ok(Command { verb, args })
}

pub fn key_value(key: &[Value]) -> Value {
    Value::Array(key.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip() {
        let mut buf = Vec::new();
        write_command(
            &mut Packer::new(&mut buf),
            Verb::HashNext,
            &[
                key_value(&[Value::Int(1)]),
                key_value(&[]),
                Value::bytes([0xab; 32].to_vec()),
            ],
        )
        .unwrap();

        let command = read_command(&mut Unpacker::new(buf.as_slice())).unwrap();
        assert_eq!(command.verb, Verb::HashNext);
        assert_eq!(command.key_arg(0).unwrap(), vec![Value::Int(1)]);
        assert_eq!(command.key_arg(1).unwrap(), Vec::<Value>::new());
        assert_eq!(command.bytes_arg(2).unwrap(), vec![0xab; 32]);
    }

    #[test]
    fn unknown_verb_is_rejected() {
        let mut buf = Vec::new();
        {
            let mut packer = Packer::new(&mut buf);
            packer.write_array_header(1).unwrap();
            packer.write_uint(99).unwrap();
        }
        let err = read_command(&mut Unpacker::new(buf.as_slice())).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn missing_argument_is_a_protocol_error() {
        let mut buf = Vec::new();
        write_command(&mut Packer::new(&mut buf), Verb::Open, &[]).unwrap();
        let command = read_command(&mut Unpacker::new(buf.as_slice())).unwrap();
        assert!(command.str_arg(0).is_err());
    }
}
