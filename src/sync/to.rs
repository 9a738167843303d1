// ABOUTME: The To side: N worker threads sharing one queue, each driving a peer pair
// ABOUTME: Runs the thirteen-step state machine from negotiation to commit or rollback

use std::collections::HashSet;
use std::io::{BufReader, BufWriter, Read, Write};
use std::time::Instant;

use tracing::{debug, error, trace};

use crate::client::DatabaseClient;
use crate::errors::{Result, SyncError};
use crate::protocol::codec::{Packer, Unpacker};
use crate::protocol::value::{KeyDisplay, Value};
use crate::protocol::{
    read_command, write_command, Verb, PROTOCOL_VERSION, PROTOCOL_VERSION_MIN,
};
use crate::schema::compare::check_schema_match;
use crate::schema::{unpack_database, Database, Table};
use crate::sync::applier::RowApplier;
use crate::sync::queue::SyncQueue;
use crate::sync::range::RangeComparator;
use crate::sync::write_outgoing;

#[derive(Debug, Clone)]
pub struct SyncToOptions {
    pub ignore: HashSet<String>,
    pub only: HashSet<String>,
    /// Whether the source database can export snapshots; decided by the
    /// launcher from the source protocol.
    pub snapshot: bool,
    /// Best-effort commit on abort instead of rolling back.
    pub partial: bool,
    /// Test-only: run the whole sync, then roll back instead of committing.
    pub rollback_after: bool,
    pub target_block_size: u64,
}

impl Default for SyncToOptions {
    fn default() -> Self {
        Self {
            ignore: HashSet::new(),
            only: HashSet::new(),
            snapshot: true,
            partial: false,
            rollback_after: false,
            target_block_size: crate::protocol::DEFAULT_TARGET_BLOCK_SIZE,
        }
    }
}

/// Runs one worker thread per `(client, input, output)` triple against a
/// shared queue; the first triple's worker leads. Returns an error if any
/// worker aborted the run.
pub fn run_sync_to<C, R, W>(
    connections: Vec<(C, R, W)>,
    options: &SyncToOptions,
) -> Result<()>
where
    C: DatabaseClient + Send,
    R: Read + Send,
    W: Write + Send,
{
    let queue = SyncQueue::new(connections.len());
    std::thread::scope(|scope| {
        for (index, (client, input, output)) in connections.into_iter().enumerate() {
            let queue = &queue;
            let worker = SyncToWorker {
                queue,
                leader: index == 0,
                client,
                input: Unpacker::new(BufReader::new(input)),
                output: Packer::new(BufWriter::new(output)),
                options,
                target_block_size: options.target_block_size,
            };
            scope.spawn(move || worker.run());
        }
    });
    if queue.aborted() {
        Err(SyncError::Aborted)
    } else {
        Ok(())
    }
}

struct SyncToWorker<'a, C: DatabaseClient, R: Read, W: Write> {
    queue: &'a SyncQueue,
    leader: bool,
    client: C,
    input: Unpacker<BufReader<R>>,
    output: Packer<BufWriter<W>>,
    options: &'a SyncToOptions,
    target_block_size: u64,
}

impl<C: DatabaseClient, R: Read, W: Write> SyncToWorker<'_, C, R, W> {
    fn run(mut self) {
        if let Err(e) = self.sync() {
            // make sure the other workers stop promptly, and report the
            // error only if we are the root cause rather than a casualty
            if self.queue.abort() {
                error!("{}", e);
            }
            if self.options.partial {
                let _ = self.client.commit_transaction();
            }
        }
        // closing our output makes the peer's read side see EOF, which in
        // turn lets its SSH session terminate promptly after aborts
        let _ = self.output.flush();
    }

    fn sync(&mut self) -> Result<()> {
        self.negotiate_protocol()?;
        self.negotiate_target_block_size()?;
        self.share_snapshot()?;
        let database = self.populate_database_schema()?;
        self.client.start_write_transaction()?;
        self.compare_schema(database.as_ref())?;
        self.enqueue_tables(database.as_ref())?;
        self.sync_tables()?;
        if self.options.rollback_after {
            self.rollback()?;
        } else {
            self.commit()?;
        }
        // a quit makes the other end close its output and exit gracefully
        self.send_quit();
        Ok(())
    }

    fn negotiate_protocol(&mut self) -> Result<()> {
        write_command(
            &mut self.output,
            Verb::Protocol,
            &[Value::Uint(PROTOCOL_VERSION)],
        )?;
        self.output.flush()?;
        let negotiated = self.input.read_uint()?;
        if negotiated < PROTOCOL_VERSION_MIN {
            return Err(SyncError::protocol(format!(
                "negotiated protocol version {} is below the minimum supported ({})",
                negotiated, PROTOCOL_VERSION_MIN
            )));
        }
        Ok(())
    }

    fn negotiate_target_block_size(&mut self) -> Result<()> {
        write_command(
            &mut self.output,
            Verb::TargetBlockSize,
            &[Value::Uint(self.options.target_block_size)],
        )?;
        self.output.flush()?;
        self.target_block_size = self.input.read_uint()?.max(1);
        Ok(())
    }

    /// Three-phase snapshot coordination. Engines without real snapshot
    /// adoption hold locks between the leader's export and the unhold, so
    /// every sibling must be connected before the export starts and must
    /// have begun its transaction before the locks are released.
    fn share_snapshot(&mut self) -> Result<()> {
        if self.queue.workers > 1 && self.options.snapshot {
            self.queue.wait_at_barrier()?;

            if self.leader {
                write_command(&mut self.output, Verb::ExportSnapshot, &[])?;
                self.output.flush()?;
                let token = String::from_utf8(self.input.read_bytes()?)
                    .map_err(|_| SyncError::protocol("snapshot token is not valid UTF-8"))?;
                self.queue.set_snapshot(token);
            }
            self.queue.wait_at_barrier()?;

            if !self.leader {
                let token = self
                    .queue
                    .snapshot()
                    .ok_or_else(|| SyncError::protocol("leader published no snapshot token"))?;
                write_command(
                    &mut self.output,
                    Verb::ImportSnapshot,
                    &[Value::bytes(token.into_bytes())],
                )?;
                self.output.flush()?;
                self.input.read_nil()?;
            }
            self.queue.wait_at_barrier()?;

            if self.leader {
                write_command(&mut self.output, Verb::UnholdSnapshot, &[])?;
                self.output.flush()?;
                self.input.read_nil()?;
            }
        } else {
            write_command(&mut self.output, Verb::WithoutSnapshot, &[])?;
            self.output.flush()?;
            self.input.read_nil()?;
        }
        Ok(())
    }

    fn populate_database_schema(&mut self) -> Result<Option<Database>> {
        if self.leader {
            Ok(Some(self.client.populate_database_schema()?))
        } else {
            Ok(None)
        }
    }

    /// Leader only; doing this in every worker would cost traffic for no
    /// extra safety.
    fn compare_schema(&mut self, database: Option<&Database>) -> Result<()> {
        let Some(database) = database else {
            return Ok(());
        };
        write_command(&mut self.output, Verb::Schema, &[])?;
        self.output.flush()?;
        let packed = self.input.read_value()?;
        let from_database = unpack_database(&packed)?;
        check_schema_match(
            &from_database,
            database,
            &self.options.ignore,
            &self.options.only,
        )
    }

    fn enqueue_tables(&mut self, database: Option<&Database>) -> Result<()> {
        if let Some(database) = database {
            self.queue
                .enqueue(&database.tables, &self.options.ignore, &self.options.only);
        }
        // wait for the leader to finish enqueueing before anyone pops
        self.queue.wait_at_barrier()
    }

    fn sync_tables(&mut self) -> Result<()> {
        self.client.disable_referential_integrity()?;

        while let Some(table) = self.queue.pop() {
            // one table per worker pair: unique-key enforcement uses
            // next-key locking on several engines, so write traffic for a
            // table cannot safely be spread across connections
            self.sync_table(&table)?;
        }

        self.queue.wait_at_barrier()?;
        self.client.enable_referential_integrity()
    }

    fn sync_table(&mut self, table: &Table) -> Result<()> {
        let mut applier = RowApplier::new();
        let mut comparator = RangeComparator::new(self.target_block_size);
        let mut hash_commands = 0u64;
        let mut rows_commands = 0u64;
        let started = Instant::now();

        debug!("starting {}", table.name);
        write_command(
            &mut self.output,
            Verb::Open,
            &[Value::bytes(table.name.as_bytes().to_vec())],
        )?;
        self.output.flush()?;

        loop {
            // a good moment to notice aborts: we are usually about to block
            // on the peer anyway
            self.queue.check_aborted()?;

            let command = read_command(&mut self.input)?;
            match command.verb {
                Verb::HashNext => {
                    let prev = command.key_arg(0)?;
                    let last = command.key_arg(1)?;
                    let hash = command.bytes_arg(2)?;
                    trace!("-> hash {} {}", KeyDisplay(&prev), KeyDisplay(&last));
                    hash_commands += 1;
                    let reply = comparator.handle_hash(
                        &mut self.client,
                        table,
                        &prev,
                        &last,
                        None,
                        &hash,
                    )?;
                    self.send_reply(reply)?;
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
                    hash_commands += 1;
                    let reply = comparator.handle_hash(
                        &mut self.client,
                        table,
                        &prev,
                        &last,
                        Some(&failed_last),
                        &hash,
                    )?;
                    self.send_reply(reply)?;
                }
                Verb::Rows => {
                    let prev = command.key_arg(0)?;
                    let last = command.key_arg(1)?;
                    trace!("-> rows {} {}", KeyDisplay(&prev), KeyDisplay(&last));
                    rows_commands += 1;
                    // applying in-context provides flow control: a separate
                    // apply thread would buffer without bound whenever this
                    // end cannot write as fast as the peer sends
                    applier.stream_and_apply(
                        &mut self.client,
                        &mut self.input,
                        table,
                        &prev,
                        &last,
                    )?;
                    // a range extending to the end of their table finishes it
                    if last.is_empty() {
                        break;
                    }
                }
                Verb::RowsAndHashNext => {
                    let prev = command.key_arg(0)?;
                    let last = command.key_arg(1)?;
                    let next = command.key_arg(2)?;
                    let hash = command.bytes_arg(3)?;
                    hash_commands += 1;
                    rows_commands += 1;
                    // answer the hash claim before consuming the rows so our
                    // reply crosses the network while the row data is still
                    // streaming toward us; the reply has to fit the kernel
                    // send buffer for this not to deadlock, and it is never
                    // larger than a few keys and a digest
                    let reply = comparator.handle_hash(
                        &mut self.client,
                        table,
                        &last,
                        &next,
                        None,
                        &hash,
                    )?;
                    self.send_reply(reply)?;
                    applier.stream_and_apply(
                        &mut self.client,
                        &mut self.input,
                        table,
                        &prev,
                        &last,
                    )?;
                }
                Verb::RowsAndHashFail => {
                    let prev = command.key_arg(0)?;
                    let last = command.key_arg(1)?;
                    let next = command.key_arg(2)?;
                    let failed_last = command.key_arg(3)?;
                    let hash = command.bytes_arg(4)?;
                    hash_commands += 1;
                    rows_commands += 1;
                    let reply = comparator.handle_hash(
                        &mut self.client,
                        table,
                        &last,
                        &next,
                        Some(&failed_last),
                        &hash,
                    )?;
                    self.send_reply(reply)?;
                    applier.stream_and_apply(
                        &mut self.client,
                        &mut self.input,
                        table,
                        &prev,
                        &last,
                    )?;
                }
                other => {
                    return Err(SyncError::protocol(format!(
                        "unexpected {:?} command while syncing {}",
                        other, table.name
                    )));
                }
            }
        }

        debug!(
            "finished {} in {:.1}s using {} hash commands and {} rows commands changing {} rows",
            table.name,
            started.elapsed().as_secs_f64(),
            hash_commands,
            rows_commands,
            applier.rows_changed
        );
        Ok(())
    }

    /// Our rows frames are requests, so nothing follows them on the wire.
    fn send_reply(&mut self, reply: crate::sync::range::Outgoing) -> Result<()> {
        write_outgoing(&mut self.output, &reply)?;
        self.output.flush()
    }

    fn commit(&mut self) -> Result<()> {
        let started = Instant::now();
        self.client.commit_transaction()?;
        debug!("committed in {:.1}s", started.elapsed().as_secs_f64());
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.client.rollback_transaction()?;
        debug!("rolled back");
        Ok(())
    }

    fn send_quit(&mut self) {
        // failing to deliver the quit is harmless; we are past the point
        // where anything could be aborted
        let _ = write_command(&mut self.output, Verb::Quit, &[])
            .and_then(|_| self.output.flush());
    }
}
