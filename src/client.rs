// ABOUTME: The capability set the sync core consumes from each database dialect
// ABOUTME: One implementation per protocol; each worker exclusively owns its client

use crate::errors::{Result, SyncError};
use crate::protocol::value::{ColumnValues, Row, Value};
use crate::schema::{Database, Table};

/// Everything the protocol core needs from a database, per dialect.
///
/// Range arguments follow the wire convention: a range is the half-open key
/// interval `(prev_key, last_key]`, where an empty `prev_key` means "from the
/// start of the table" and an empty `last_key` means "through the end".
pub trait DatabaseClient {
    /// Whether this dialect can export a transactional snapshot for sibling
    /// connections to adopt. Engines without it make workers take the
    /// `WITHOUT_SNAPSHOT` path.
    fn supports_snapshots(&self) -> bool {
        false
    }

    /// Starts a read transaction and returns an opaque token siblings can
    /// pass to `import_snapshot` to see the same view.
    fn export_snapshot(&mut self) -> Result<String> {
        Err(SyncError::database(
            "this database does not support snapshot export",
        ))
    }

    fn import_snapshot(&mut self, _token: &str) -> Result<()> {
        Err(SyncError::database(
            "this database does not support snapshot import",
        ))
    }

    /// Releases whatever the exporter held open to keep the snapshot
    /// adoptable (locks, on engines that use them). No-op by default.
    fn unhold_snapshot(&mut self) -> Result<()> {
        Ok(())
    }

    fn start_read_transaction(&mut self) -> Result<()>;
    fn start_write_transaction(&mut self) -> Result<()>;
    fn commit_transaction(&mut self) -> Result<()>;
    fn rollback_transaction(&mut self) -> Result<()>;

    /// Loads the table catalog. Called once per run, by the leader on the To
    /// side and on demand on the From side.
    fn populate_database_schema(&mut self) -> Result<Database>;

    fn disable_referential_integrity(&mut self) -> Result<()>;
    fn enable_referential_integrity(&mut self) -> Result<()>;

    /// Streams the rows of `(prev_key, last_key]` in primary-key order into
    /// `visit`, up to `limit` rows when given. Returns the row count visited.
    /// Values arrive in the canonical encoding: NULL as nil, integer columns
    /// as signed integers, blobs as raw bytes, everything else as the
    /// engine's text rendering.
    fn query_rows(
        &mut self,
        table: &Table,
        prev_key: &[Value],
        last_key: &[Value],
        limit: Option<u64>,
        visit: &mut dyn FnMut(Row) -> Result<()>,
    ) -> Result<u64>;

    fn count_rows(
        &mut self,
        table: &Table,
        prev_key: &[Value],
        last_key: &[Value],
    ) -> Result<u64>;

    /// The primary key of the nth row (1-based) after `prev_key`, staying at
    /// or below `last_key`. Used to halve mismatched ranges by row count.
    fn nth_key(
        &mut self,
        table: &Table,
        prev_key: &[Value],
        last_key: &[Value],
        n: u64,
    ) -> Result<Option<ColumnValues>>;

    fn insert_rows(&mut self, table: &Table, rows: &[Row]) -> Result<()>;

    /// Replaces the non-key columns of rows identified by their primary keys.
    /// Dialects without an efficient composite-key UPDATE may implement this
    /// as delete-and-insert.
    fn update_rows(&mut self, table: &Table, rows: &[Row]) -> Result<()>;

    fn delete_rows(&mut self, table: &Table, keys: &[ColumnValues]) -> Result<()>;
}
