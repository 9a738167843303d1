// ABOUTME: The From side: a single-threaded command loop serving one worker pair
// ABOUTME: Answers control commands and runs the range comparison over the source rows

use std::io::{BufReader, BufWriter, Read, Write};

use tracing::{debug, trace};

use crate::client::DatabaseClient;
use crate::errors::{Result, SyncError};
use crate::protocol::codec::{Packer, Unpacker};
use crate::protocol::value::KeyDisplay;
use crate::protocol::{read_command, Verb, PROTOCOL_VERSION, PROTOCOL_VERSION_MIN};
use crate::schema::{pack_database, Database, Table};
use crate::sync::range::{merge_owed_rows, Outgoing, RangeComparator, RowsPart};
use crate::sync::write_outgoing;

/// Serves one To-side worker over a pair of half-duplex streams, driving the
/// range comparison over the source database. The launcher forks one of
/// these processes per worker, so there is no shared state on this side.
pub fn run_sync_from<C, R, W>(mut client: C, input: R, output: W) -> Result<()>
where
    C: DatabaseClient,
    R: Read,
    W: Write,
{
    let mut input = Unpacker::new(BufReader::new(input));
    let mut output = Packer::new(BufWriter::new(output));
    let mut database: Option<Database> = None;
    let mut current: Option<(Table, RangeComparator)> = None;
    let mut target_block_size = crate::protocol::DEFAULT_TARGET_BLOCK_SIZE;

    loop {
        let command = read_command(&mut input)?;
        match command.verb {
            Verb::Protocol => {
                let theirs = command.uint_arg(0)?;
                let negotiated = theirs.min(PROTOCOL_VERSION);
                output.write_uint(negotiated)?;
                output.flush()?;
                if negotiated < PROTOCOL_VERSION_MIN {
                    return Err(SyncError::protocol(format!(
                        "peer protocol version {} is below the minimum supported ({})",
                        theirs, PROTOCOL_VERSION_MIN
                    )));
                }
            }
            Verb::TargetBlockSize => {
                // the real launcher always gets the size it asked for; small
                // sizes only turn up in tests exercising subdivision
                let requested = command.uint_arg(0)?;
                target_block_size = requested.max(1);
                output.write_uint(target_block_size)?;
                output.flush()?;
            }
            Verb::ExportSnapshot => {
                let token = client.export_snapshot()?;
                output.write_bytes(token.as_bytes())?;
                output.flush()?;
            }
            Verb::ImportSnapshot => {
                let token = command.str_arg(0)?;
                client.import_snapshot(&token)?;
                output.write_nil()?;
                output.flush()?;
            }
            Verb::UnholdSnapshot => {
                client.unhold_snapshot()?;
                output.write_nil()?;
                output.flush()?;
            }
            Verb::WithoutSnapshot => {
                client.start_read_transaction()?;
                output.write_nil()?;
                output.flush()?;
            }
            Verb::Schema => {
                let packed = pack_database(catalog(&mut client, &mut database)?);
                output.write_value(&packed)?;
                output.flush()?;
            }
            Verb::Open => {
                let name = command.str_arg(0)?;
                let table = catalog(&mut client, &mut database)?
                    .tables
                    .iter()
                    .find(|t| t.name == name)
                    .cloned()
                    .ok_or_else(|| {
                        SyncError::protocol(format!("peer opened unknown table {}", name))
                    })?;
                debug!("opening {}", table.name);
                let mut comparator = RangeComparator::new(target_block_size);
                let claim = comparator.initial_claim(&mut client, &table)?;
                current = Some((table, comparator));
                let (table, _) = current.as_ref().unwrap();
                respond(&mut client, &mut output, table, vec![claim])?;
            }
            Verb::HashNext => {
                let prev = command.key_arg(0)?;
                let last = command.key_arg(1)?;
                let hash = command.bytes_arg(2)?;
                trace!("-> hash {} {}", KeyDisplay(&prev), KeyDisplay(&last));
                let (table, comparator) = open_table(&mut current)?;
                let reply = comparator.handle_hash(&mut client, table, &prev, &last, None, &hash)?;
                respond(&mut client, &mut output, table, vec![reply])?;
            }
            Verb::HashFail => {
                let prev = command.key_arg(0)?;
                let last = command.key_arg(1)?;
                let failed_last = command.key_arg(2)?;
                let hash = command.bytes_arg(3)?;
                trace!(
                    "-> hash {} {} last-failure {}",
                    KeyDisplay(&prev),
                    KeyDisplay(&last),
                    KeyDisplay(&failed_last)
                );
                let (table, comparator) = open_table(&mut current)?;
                let reply = comparator.handle_hash(
                    &mut client,
                    table,
                    &prev,
                    &last,
                    Some(&failed_last),
                    &hash,
                )?;
                respond(&mut client, &mut output, table, vec![reply])?;
            }
            Verb::Rows => {
                // the peer wants this range's rows outright
                let prev = command.key_arg(0)?;
                let last = command.key_arg(1)?;
                trace!("-> rows {} {}", KeyDisplay(&prev), KeyDisplay(&last));
                let (table, comparator) = open_table(&mut current)?;
                let reply = if last.is_empty() {
                    Outgoing::Rows(RowsPart {
                        prev,
                        last: Vec::new(),
                    })
                } else {
                    comparator.continue_after_rows(&mut client, table, &prev, &last)?
                };
                respond(&mut client, &mut output, table, vec![reply])?;
            }
            Verb::RowsAndHashNext => {
                let prev = command.key_arg(0)?;
                let last = command.key_arg(1)?;
                let next = command.key_arg(2)?;
                let hash = command.bytes_arg(3)?;
                let (table, comparator) = open_table(&mut current)?;
                let reply = comparator.handle_hash(&mut client, table, &last, &next, None, &hash)?;
                let frames = merge_owed_rows(RowsPart { prev, last }, reply);
                respond(&mut client, &mut output, table, frames)?;
            }
            Verb::RowsAndHashFail => {
                let prev = command.key_arg(0)?;
                let last = command.key_arg(1)?;
                let next = command.key_arg(2)?;
                let failed_last = command.key_arg(3)?;
                let hash = command.bytes_arg(4)?;
                let (table, comparator) = open_table(&mut current)?;
                let reply = comparator.handle_hash(
                    &mut client,
                    table,
                    &last,
                    &next,
                    Some(&failed_last),
                    &hash,
                )?;
                let frames = merge_owed_rows(RowsPart { prev, last }, reply);
                respond(&mut client, &mut output, table, frames)?;
            }
            Verb::Quit => {
                debug!("peer finished, closing");
                return Ok(());
            }
        }
    }
}

/// The catalog is loaded lazily because only the leader's channel ever
/// carries a SCHEMA command; the other workers first need it at OPEN.
fn catalog<'a, C: DatabaseClient>(
    client: &mut C,
    database: &'a mut Option<Database>,
) -> Result<&'a Database> {
    if database.is_none() {
        *database = Some(client.populate_database_schema()?);
    }
    Ok(database.as_ref().unwrap())
}

fn open_table(
    current: &mut Option<(Table, RangeComparator)>,
) -> Result<(&Table, &mut RangeComparator)> {
    match current.as_mut() {
        Some((table, comparator)) => Ok((&*table, comparator)),
        None => Err(SyncError::protocol(
            "received a range command before any OPEN",
        )),
    }
}

/// Writes the chosen frames, streaming the actual row data after any frame
/// that carries a rows range, and flushes once at the end. Fused frames put
/// the hash claim on the wire before the row bytes, so the claim must fit in
/// the kernel send buffer for the pipelining to stay deadlock-free.
fn respond<C: DatabaseClient, W: Write>(
    client: &mut C,
    output: &mut Packer<W>,
    table: &Table,
    frames: Vec<Outgoing>,
) -> Result<()> {
    for frame in frames {
        if let Some(rows) = write_outgoing(output, &frame)? {
            let count = client.query_rows(table, &rows.prev, &rows.last, None, &mut |row| {
                output.write_row(&row)
            })?;
            output.write_nil()?;
            trace!(
                "<- rows {} {} ({} rows)",
                KeyDisplay(&rows.prev),
                KeyDisplay(&rows.last),
                count
            );
        }
    }
    output.flush()
}
