// ABOUTME: Applies a received row range to the destination as a set reconciliation
// ABOUTME: Merge-walks the incoming stream against local rows, batching the mutations

use std::cmp::Ordering;
use std::io::Read;

use crate::client::DatabaseClient;
use crate::errors::Result;
use crate::protocol::codec::Unpacker;
use crate::protocol::value::{compare_keys, ColumnValues, Row, Value};
use crate::schema::Table;
use crate::sync::row_key;

/// Mutations are flushed whenever this many accumulate, keeping statement
/// sizes bounded without a round trip per row.
const BATCH_ROWS: usize = 1000;

/// Writes incoming row ranges to the destination table. Owned by exactly one
/// worker; writes for one table never span connections because unique-index
/// enforcement uses next-key locking on several engines.
pub struct RowApplier {
    inserts: Vec<Row>,
    updates: Vec<Row>,
    deletes: Vec<ColumnValues>,
    pub rows_changed: u64,
}

impl RowApplier {
    pub fn new() -> Self {
        Self {
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
            rows_changed: 0,
        }
    }

    /// Streams the rows of `(prev_key, last_key]` from the peer and
    /// reconciles the same local range against them: rows only at the source
    /// are inserted, rows only here are deleted, rows at both with different
    /// non-key columns are updated, identical rows cost nothing.
    ///
    /// Applying synchronously on the reading thread is what throttles the
    /// sender; buffering the stream would let an unwritable destination
    /// bloat this process instead.
    pub fn stream_and_apply<C: DatabaseClient, R: Read>(
        &mut self,
        client: &mut C,
        input: &mut Unpacker<R>,
        table: &Table,
        prev_key: &[Value],
        last_key: &[Value],
    ) -> Result<()> {
        let mut local_rows = Vec::new();
        client.query_rows(table, prev_key, last_key, None, &mut |row| {
            local_rows.push(row);
            Ok(())
        })?;

        let mut local = local_rows.into_iter().peekable();
        while let Some(incoming) = input.read_row()? {
            let incoming_key = row_key(table, &incoming);
            loop {
                match local.peek() {
                    Some(existing) => {
                        match compare_keys(&row_key(table, existing), &incoming_key) {
                            Ordering::Less => {
                                // only present here; the source no longer has it
                                let gone = local.next().unwrap();
                                self.delete(client, table, row_key(table, &gone))?;
                            }
                            Ordering::Equal => {
                                let existing = local.next().unwrap();
                                if existing != incoming {
                                    self.update(client, table, incoming)?;
                                }
                                break;
                            }
                            Ordering::Greater => {
                                self.insert(client, table, incoming)?;
                                break;
                            }
                        }
                    }
                    None => {
                        self.insert(client, table, incoming)?;
                        break;
                    }
                }
            }
        }

        // anything left locally is beyond the source's rows for this range
        for leftover in local {
            self.delete(client, table, row_key(table, &leftover))?;
        }

        self.flush(client, table)
    }

    fn insert<C: DatabaseClient>(&mut self, client: &mut C, table: &Table, row: Row) -> Result<()> {
        self.inserts.push(row);
        self.maybe_flush(client, table)
    }

    fn update<C: DatabaseClient>(&mut self, client: &mut C, table: &Table, row: Row) -> Result<()> {
        self.updates.push(row);
        self.maybe_flush(client, table)
    }

    fn delete<C: DatabaseClient>(
        &mut self,
        client: &mut C,
        table: &Table,
        key: ColumnValues,
    ) -> Result<()> {
        self.deletes.push(key);
        self.maybe_flush(client, table)
    }

    fn maybe_flush<C: DatabaseClient>(&mut self, client: &mut C, table: &Table) -> Result<()> {
        if self.inserts.len() + self.updates.len() + self.deletes.len() >= BATCH_ROWS {
            self.flush(client, table)?;
        }
        Ok(())
    }

    /// Deletes go first so replacement rows never collide with the unique
    /// keys of rows about to disappear.
    fn flush<C: DatabaseClient>(&mut self, client: &mut C, table: &Table) -> Result<()> {
        if !self.deletes.is_empty() {
            client.delete_rows(table, &self.deletes)?;
            self.rows_changed += self.deletes.len() as u64;
            self.deletes.clear();
        }
        if !self.updates.is_empty() {
            client.update_rows(table, &self.updates)?;
            self.rows_changed += self.updates.len() as u64;
            self.updates.clear();
        }
        if !self.inserts.is_empty() {
            client.insert_rows(table, &self.inserts)?;
            self.rows_changed += self.inserts.len() as u64;
            self.inserts.clear();
        }
        Ok(())
    }
}

impl Default for RowApplier {
    fn default() -> Self {
        Self::new()
    }
}
