// ABOUTME: The synchronization core: queue, range comparison, row application, workers
// ABOUTME: Also carries the in-memory test client the protocol tests run against

pub mod applier;
pub mod from;
pub mod queue;
pub mod range;
pub mod to;

use std::io::Write;

use crate::errors::Result;
use crate::protocol::codec::Packer;
use crate::protocol::value::{ColumnValues, Row, Value};
use crate::protocol::{key_value, write_command, Verb};
use crate::schema::Table;
use range::{HashPart, Outgoing, RowsPart};

/// Extracts a row's primary key tuple.
pub fn row_key(table: &Table, row: &Row) -> ColumnValues {
    table
        .primary_key_columns
        .iter()
        .map(|&i| row.get(i).cloned().unwrap_or(Value::Nil))
        .collect()
}

/// Writes one outgoing command frame. Returns the rows range whose data
/// belongs immediately after the frame; the From side streams it, the To
/// side's identical frame is a request and carries nothing.
pub fn write_outgoing<W: Write>(
    packer: &mut Packer<W>,
    outgoing: &Outgoing,
) -> Result<Option<RowsPart>> {
    match outgoing {
        Outgoing::Hash(HashPart::Next { prev, last, hash }) => {
            write_command(
                packer,
                Verb::HashNext,
                &[
                    key_value(prev),
                    key_value(last),
                    Value::Bytes(hash.clone()),
                ],
            )?;
            Ok(None)
        }
        Outgoing::Hash(HashPart::Fail {
            prev,
            last,
            failed_last,
            hash,
        }) => {
            write_command(
                packer,
                Verb::HashFail,
                &[
                    key_value(prev),
                    key_value(last),
                    key_value(failed_last),
                    Value::Bytes(hash.clone()),
                ],
            )?;
            Ok(None)
        }
        Outgoing::Rows(rows) => {
            write_command(
                packer,
                Verb::Rows,
                &[key_value(&rows.prev), key_value(&rows.last)],
            )?;
            Ok(Some(rows.clone()))
        }
        Outgoing::RowsAndHash(rows, HashPart::Next { last, hash, .. }) => {
            write_command(
                packer,
                Verb::RowsAndHashNext,
                &[
                    key_value(&rows.prev),
                    key_value(&rows.last),
                    key_value(last),
                    Value::Bytes(hash.clone()),
                ],
            )?;
            Ok(Some(rows.clone()))
        }
        Outgoing::RowsAndHash(
            rows,
            HashPart::Fail {
                last,
                failed_last,
                hash,
                ..
            },
        ) => {
            write_command(
                packer,
                Verb::RowsAndHashFail,
                &[
                    key_value(&rows.prev),
                    key_value(&rows.last),
                    key_value(last),
                    key_value(failed_last),
                    Value::Bytes(hash.clone()),
                ],
            )?;
            Ok(Some(rows.clone()))
        }
    }
}
