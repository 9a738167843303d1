// ABOUTME: The recursive range-hash comparison both ends run over their own rows
// ABOUTME: Matched ranges advance the cursor; mismatches halve by row count or ship rows

use sha2::{Digest, Sha256};

use crate::client::DatabaseClient;
use crate::errors::{Result, SyncError};
use crate::protocol::codec::Packer;
use crate::protocol::value::{ColumnValues, Row, Value};
use crate::schema::Table;
use crate::sync::row_key;

/// Splitting a mismatched range stops once our side holds at most one row in
/// it; at that point shipping the rows is cheaper than another round trip.
const MIN_SPLIT_ROWS: u64 = 1;

/// The hash claim half of an outgoing command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashPart {
    /// `HASH_NEXT`: a claim over a range not previously known to differ.
    Next {
        prev: ColumnValues,
        last: ColumnValues,
        hash: Vec<u8>,
    },
    /// `HASH_FAIL`: a claim over the lower half of a range known to differ,
    /// remembering the failed range's upper bound.
    Fail {
        prev: ColumnValues,
        last: ColumnValues,
        failed_last: ColumnValues,
        hash: Vec<u8>,
    },
}

impl HashPart {
    pub fn prev(&self) -> &ColumnValues {
        match self {
            HashPart::Next { prev, .. } | HashPart::Fail { prev, .. } => prev,
        }
    }
}

/// The rows half of an outgoing command: `(prev, last]`. On the From side
/// the frame is followed by the range's row data; on the To side it is a
/// request for that data. An empty `last` makes it the table's terminal
/// command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowsPart {
    pub prev: ColumnValues,
    pub last: ColumnValues,
}

impl RowsPart {
    pub fn is_terminal(&self) -> bool {
        self.last.is_empty()
    }
}

/// One outgoing command chosen by the comparator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Hash(HashPart),
    Rows(RowsPart),
    /// Fused rows-plus-claim; the claim's range starts where the rows end,
    /// and goes on the wire before the row data so the peer can start
    /// hashing while the rows are still streaming.
    RowsAndHash(RowsPart, HashPart),
}

struct RangeHash {
    digest: Vec<u8>,
    row_count: u64,
    /// Key of the last row actually hashed; empty when the range held none.
    last_key: ColumnValues,
}

struct BlockScan {
    digest: Vec<u8>,
    row_count: u64,
    last_key: ColumnValues,
    at_end: bool,
}

/// Hashes rows in their canonical encoding (the codec's row framing),
/// tracking the byte volume for block sizing.
struct RowHasher {
    hasher: Sha256,
    buffer: Vec<u8>,
    bytes: u64,
}

impl RowHasher {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            buffer: Vec::new(),
            bytes: 0,
        }
    }

    fn add_row(&mut self, row: &Row) -> Result<()> {
        self.buffer.clear();
        Packer::new(&mut self.buffer).write_row(row)?;
        self.hasher.update(&self.buffer);
        self.bytes += self.buffer.len() as u64;
        Ok(())
    }

    fn finish(self) -> (Vec<u8>, u64) {
        (self.hasher.finalize().to_vec(), self.bytes)
    }
}

/// Per-table comparison state: advisory block size, a moving estimate of
/// row width used to pick how many rows the next fresh range should cover,
/// and whether this table has produced a mismatch yet.
pub struct RangeComparator {
    target_block_size: u64,
    estimated_row_width: u64,
    diverged: bool,
}

impl RangeComparator {
    pub fn new(target_block_size: u64) -> Self {
        Self {
            target_block_size: target_block_size.max(1),
            estimated_row_width: 128,
            diverged: false,
        }
    }

    fn rows_per_block(&self) -> u64 {
        (self.target_block_size / self.estimated_row_width.max(1)).max(1)
    }

    /// A tail this many rows or fewer gets folded into an in-flight rows
    /// command instead of costing one more hash round trip.
    fn inline_tail_rows(&self) -> u64 {
        (self.rows_per_block() / 4).max(1)
    }

    fn observe_row_width(&mut self, bytes: u64, rows: u64) {
        if rows > 0 {
            self.estimated_row_width = ((self.estimated_row_width + bytes / rows) / 2).max(1);
        }
    }

    fn hash_range<C: DatabaseClient>(
        &mut self,
        client: &mut C,
        table: &Table,
        prev: &[Value],
        last: &[Value],
    ) -> Result<RangeHash> {
        let mut hasher = RowHasher::new();
        let mut last_key: ColumnValues = Vec::new();
        let row_count = client.query_rows(table, prev, last, None, &mut |row| {
            last_key = row_key(table, &row);
            hasher.add_row(&row)
        })?;
        let (digest, bytes) = hasher.finish();
        self.observe_row_width(bytes, row_count);
        Ok(RangeHash {
            digest,
            row_count,
            last_key,
        })
    }

    /// Hashes the next block after `boundary`, querying one row past the
    /// block to learn whether the table ends within it.
    fn scan_block<C: DatabaseClient>(
        &mut self,
        client: &mut C,
        table: &Table,
        boundary: &[Value],
    ) -> Result<BlockScan> {
        let block_rows = self.rows_per_block();
        let mut hasher = RowHasher::new();
        let mut last_key: ColumnValues = Vec::new();
        let mut hashed = 0u64;
        let mut overflowed = false;
        client.query_rows(table, boundary, &[], Some(block_rows + 1), &mut |row| {
            if hashed < block_rows {
                last_key = row_key(table, &row);
                hasher.add_row(&row)?;
                hashed += 1;
            } else {
                overflowed = true;
            }
            Ok(())
        })?;
        let (digest, bytes) = hasher.finish();
        self.observe_row_width(bytes, hashed);
        Ok(BlockScan {
            digest,
            row_count: hashed,
            last_key,
            at_end: !overflowed,
        })
    }

    /// The From side's first command after `OPEN`: a claim over the first
    /// block, with an empty `last` when the block swallows the whole table
    /// (including the degenerate empty-table case).
    pub fn initial_claim<C: DatabaseClient>(
        &mut self,
        client: &mut C,
        table: &Table,
    ) -> Result<Outgoing> {
        Ok(Outgoing::Hash(self.next_claim(client, table, &[])?))
    }

    fn next_claim<C: DatabaseClient>(
        &mut self,
        client: &mut C,
        table: &Table,
        boundary: &[Value],
    ) -> Result<HashPart> {
        let scan = self.scan_block(client, table, boundary)?;
        let last = if scan.at_end { Vec::new() } else { scan.last_key };
        Ok(HashPart::Next {
            prev: boundary.to_vec(),
            last,
            hash: scan.digest,
        })
    }

    /// The transition policy: answers a peer's hash claim over
    /// `(prev, last]`. `failed_last`, when present, bounds a wider range the
    /// peer already knows to differ.
    pub fn handle_hash<C: DatabaseClient>(
        &mut self,
        client: &mut C,
        table: &Table,
        prev: &[Value],
        last: &[Value],
        failed_last: Option<&[Value]>,
        their_hash: &[u8],
    ) -> Result<Outgoing> {
        if failed_last.is_some() {
            // a failed bound means the peer already found a difference here
            self.diverged = true;
        }
        let ours = self.hash_range(client, table, prev, last)?;

        if ours.digest == their_hash {
            if last.is_empty() {
                // matched through the end of the table; terminate with an
                // empty range starting at the last row either side holds
                let boundary = if ours.last_key.is_empty() {
                    prev.to_vec()
                } else {
                    ours.last_key
                };
                return Ok(Outgoing::Rows(RowsPart {
                    prev: boundary,
                    last: Vec::new(),
                }));
            }
            if let Some(failed) = failed_last {
                // the lower half of a differing range matched, so the
                // difference must sit in (last, failed]
                return self.subdivide_failed(client, table, last, failed);
            }
            let scan = self.scan_block(client, table, last)?;
            if self.diverged && scan.at_end && scan.row_count <= self.inline_tail_rows() {
                // the rest of the table is small and this table has already
                // needed rows shipped; sending the remainder outright beats
                // one more hash round trip. Tables with no mismatch so far
                // keep trading hashes only.
                return Ok(Outgoing::Rows(RowsPart {
                    prev: last.to_vec(),
                    last: Vec::new(),
                }));
            }
            let claim_last = if scan.at_end { Vec::new() } else { scan.last_key };
            return Ok(Outgoing::Hash(HashPart::Next {
                prev: last.to_vec(),
                last: claim_last,
                hash: scan.digest,
            }));
        }

        self.diverged = true;
        if ours.row_count > MIN_SPLIT_ROWS {
            // halve by row count so splits stay balanced on skewed keys
            let mid = client
                .nth_key(table, prev, last, ours.row_count.div_ceil(2))?
                .ok_or_else(|| SyncError::database("range midpoint disappeared mid-comparison"))?;
            let lower = self.hash_range(client, table, prev, &mid)?;
            return Ok(Outgoing::Hash(HashPart::Fail {
                prev: prev.to_vec(),
                last: mid,
                failed_last: last.to_vec(),
                hash: lower.digest,
            }));
        }

        // at most one local row in a differing range: resolve it with rows
        if last.is_empty() {
            return Ok(Outgoing::Rows(RowsPart {
                prev: prev.to_vec(),
                last: Vec::new(),
            }));
        }
        if let Some(failed) = failed_last {
            // the mismatch may or may not extend past `last`; claim the
            // remainder (last, failed] exactly rather than guessing a block
            let upper = self.hash_range(client, table, last, failed)?;
            return Ok(Outgoing::RowsAndHash(
                RowsPart {
                    prev: prev.to_vec(),
                    last: last.to_vec(),
                },
                HashPart::Next {
                    prev: last.to_vec(),
                    last: failed.to_vec(),
                    hash: upper.digest,
                },
            ));
        }
        self.continue_after_rows(client, table, prev, last)
    }

    /// Subdivides `(prev, failed]`, a range known to differ, without waiting
    /// for another claim over it.
    fn subdivide_failed<C: DatabaseClient>(
        &mut self,
        client: &mut C,
        table: &Table,
        prev: &[Value],
        failed: &[Value],
    ) -> Result<Outgoing> {
        let row_count = client.count_rows(table, prev, failed)?;
        if row_count > MIN_SPLIT_ROWS {
            let mid = client
                .nth_key(table, prev, failed, row_count.div_ceil(2))?
                .ok_or_else(|| SyncError::database("range midpoint disappeared mid-comparison"))?;
            let lower = self.hash_range(client, table, prev, &mid)?;
            return Ok(Outgoing::Hash(HashPart::Fail {
                prev: prev.to_vec(),
                last: mid,
                failed_last: failed.to_vec(),
                hash: lower.digest,
            }));
        }
        if failed.is_empty() {
            return Ok(Outgoing::Rows(RowsPart {
                prev: prev.to_vec(),
                last: Vec::new(),
            }));
        }
        self.continue_after_rows(client, table, prev, failed)
    }

    /// Chooses the command that ships (or requests) rows for
    /// `(rows_prev, rows_last]` while keeping the dialog moving past
    /// `rows_last`: a fused claim over the next block, or a plain terminal
    /// rows command when the rest of the table is small enough to fold in.
    pub fn continue_after_rows<C: DatabaseClient>(
        &mut self,
        client: &mut C,
        table: &Table,
        rows_prev: &[Value],
        rows_last: &[Value],
    ) -> Result<Outgoing> {
        let scan = self.scan_block(client, table, rows_last)?;
        if scan.at_end && scan.row_count <= self.inline_tail_rows() {
            return Ok(Outgoing::Rows(RowsPart {
                prev: rows_prev.to_vec(),
                last: Vec::new(),
            }));
        }
        let last = if scan.at_end { Vec::new() } else { scan.last_key };
        Ok(Outgoing::RowsAndHash(
            RowsPart {
                prev: rows_prev.to_vec(),
                last: rows_last.to_vec(),
            },
            HashPart::Next {
                prev: rows_last.to_vec(),
                last,
                hash: scan.digest,
            },
        ))
    }
}

/// Combines rows the From side still owes for `(owed.prev, owed.last]` with
/// its answer to an accompanying hash claim. Adjacent ranges merge into one
/// fused command, which keeps the claim ahead of the row bytes; otherwise
/// the owed rows go out first so the cursor the peer observes only ever
/// moves forward.
pub fn merge_owed_rows(owed: RowsPart, reply: Outgoing) -> Vec<Outgoing> {
    match reply {
        Outgoing::Rows(r) if r.prev == owed.last => vec![Outgoing::Rows(RowsPart {
            prev: owed.prev,
            last: r.last,
        })],
        Outgoing::RowsAndHash(r, h) if r.prev == owed.last => vec![Outgoing::RowsAndHash(
            RowsPart {
                prev: owed.prev,
                last: r.last,
            },
            h,
        )],
        Outgoing::Hash(h) if *h.prev() == owed.last => vec![Outgoing::RowsAndHash(owed, h)],
        other => vec![Outgoing::Rows(owed), other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::MemoryClient;
    use crate::protocol::value::Value;
    use crate::schema::tests_support::table_named;

    fn int_key(n: i64) -> ColumnValues {
        vec![Value::Int(n)]
    }

    fn two_column_table() -> Table {
        let mut table = table_named("t");
        table.columns = vec![
            crate::schema::Column {
                name: "id".into(),
                column_type: crate::schema::ColumnType::Integer,
                nullable: false,
            },
            crate::schema::Column {
                name: "body".into(),
                column_type: crate::schema::ColumnType::Text,
                nullable: true,
            },
        ];
        table.primary_key_columns = vec![0];
        table
    }

    fn row(n: i64, body: &str) -> Row {
        vec![Value::Int(n), Value::bytes(body)]
    }

    fn hash_of(rows: &[Row]) -> Vec<u8> {
        let mut hasher = RowHasher::new();
        for r in rows {
            hasher.add_row(r).unwrap();
        }
        hasher.finish().0
    }

    #[test]
    fn initial_claim_on_an_empty_table_covers_the_whole_table() {
        let table = two_column_table();
        let mut client = MemoryClient::new(vec![]);
        let mut comparator = RangeComparator::new(1024);
        let claim = comparator.initial_claim(&mut client, &table).unwrap();
        match claim {
            Outgoing::Hash(HashPart::Next { prev, last, hash }) => {
                assert!(prev.is_empty());
                assert!(last.is_empty());
                assert_eq!(hash, hash_of(&[]));
            }
            other => panic!("unexpected claim {:?}", other),
        }
    }

    #[test]
    fn matching_claim_at_table_end_produces_the_terminal_command() {
        let table = two_column_table();
        let rows = vec![row(1, "a")];
        let mut client = MemoryClient::new(rows.clone());
        let mut comparator = RangeComparator::new(1024);
        let reply = comparator
            .handle_hash(&mut client, &table, &[], &[], None, &hash_of(&rows))
            .unwrap();
        assert_eq!(
            reply,
            Outgoing::Rows(RowsPart {
                prev: int_key(1),
                last: vec![],
            })
        );
    }

    #[test]
    fn mismatched_multi_row_range_is_halved_by_row_count() {
        let table = two_column_table();
        let rows = vec![row(1, "a"), row(2, "b"), row(3, "c"), row(4, "d")];
        let mut client = MemoryClient::new(rows.clone());
        let mut comparator = RangeComparator::new(1024);
        let reply = comparator
            .handle_hash(&mut client, &table, &[], &[], None, b"something else")
            .unwrap();
        match reply {
            Outgoing::Hash(HashPart::Fail {
                prev,
                last,
                failed_last,
                hash,
            }) => {
                assert!(prev.is_empty());
                assert_eq!(last, int_key(2));
                assert!(failed_last.is_empty());
                assert_eq!(hash, hash_of(&rows[..2]));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn matched_lower_half_of_a_failed_range_subdivides_the_remainder() {
        let table = two_column_table();
        let rows = vec![row(1, "a"), row(2, "b"), row(3, "c")];
        let mut client = MemoryClient::new(rows.clone());
        let mut comparator = RangeComparator::new(1024);
        // peer sent HASH_FAIL over ((), (1)] with the whole table as the
        // failed range; our hash of ((), (1)] agrees
        let reply = comparator
            .handle_hash(
                &mut client,
                &table,
                &[],
                &int_key(1),
                Some(&[]),
                &hash_of(&rows[..1]),
            )
            .unwrap();
        match reply {
            Outgoing::Hash(HashPart::Fail {
                prev,
                last,
                failed_last,
                hash,
            }) => {
                assert_eq!(prev, int_key(1));
                assert_eq!(last, int_key(2));
                assert!(failed_last.is_empty());
                assert_eq!(hash, hash_of(&rows[1..2]));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn single_row_mismatch_resolves_with_rows_and_a_fused_claim() {
        let table = two_column_table();
        // we hold nothing in ((1), (2)] but more rows beyond it
        let rows = vec![row(1, "a"), row(3, "c")];
        let mut client = MemoryClient::new(rows.clone());
        let mut comparator = RangeComparator::new(1024);
        let reply = comparator
            .handle_hash(
                &mut client,
                &table,
                &int_key(1),
                &int_key(2),
                Some(&[]),
                b"their hash of row 2",
            )
            .unwrap();
        match reply {
            Outgoing::RowsAndHash(rows_part, HashPart::Next { prev, last, hash }) => {
                assert_eq!(rows_part.prev, int_key(1));
                assert_eq!(rows_part.last, int_key(2));
                assert_eq!(prev, int_key(2));
                assert!(last.is_empty());
                assert_eq!(hash, hash_of(&rows[1..]));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn small_tail_is_folded_into_the_rows_command() {
        let table = two_column_table();
        let rows = vec![row(1, "a"), row(2, "b")];
        let mut client = MemoryClient::new(rows);
        let mut comparator = RangeComparator::new(64 * 1024);
        let reply = comparator
            .continue_after_rows(&mut client, &table, &[], &int_key(1))
            .unwrap();
        assert_eq!(
            reply,
            Outgoing::Rows(RowsPart {
                prev: vec![],
                last: vec![],
            })
        );
    }

    #[test]
    fn matched_claim_ships_a_small_tail_once_the_table_has_diverged() {
        let table = two_column_table();
        let rows: Vec<Row> = (1..=5).map(|n| row(n, "x")).collect();
        let mut client = MemoryClient::new(rows.clone());
        let mut comparator = RangeComparator::new(64 * 1024);

        // a mismatched claim marks the table as divergent
        let first = comparator
            .handle_hash(&mut client, &table, &[], &int_key(3), None, b"not our hash")
            .unwrap();
        assert!(matches!(first, Outgoing::Hash(HashPart::Fail { .. })));

        // a later match with the end of the table in sight ships the
        // remainder instead of claiming one more hash
        let reply = comparator
            .handle_hash(&mut client, &table, &[], &int_key(4), None, &hash_of(&rows[..4]))
            .unwrap();
        assert_eq!(
            reply,
            Outgoing::Rows(RowsPart {
                prev: int_key(4),
                last: vec![],
            })
        );
    }

    #[test]
    fn matched_claim_keeps_hashing_while_nothing_has_diverged() {
        let table = two_column_table();
        let rows: Vec<Row> = (1..=5).map(|n| row(n, "x")).collect();
        let mut client = MemoryClient::new(rows.clone());
        let mut comparator = RangeComparator::new(64 * 1024);
        let reply = comparator
            .handle_hash(&mut client, &table, &[], &int_key(4), None, &hash_of(&rows[..4]))
            .unwrap();
        match reply {
            Outgoing::Hash(HashPart::Next { prev, last, hash }) => {
                assert_eq!(prev, int_key(4));
                assert!(last.is_empty());
                assert_eq!(hash, hash_of(&rows[4..]));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn merge_fuses_adjacent_ranges() {
        let owed = RowsPart {
            prev: int_key(1),
            last: int_key(2),
        };
        let claim = HashPart::Fail {
            prev: int_key(2),
            last: int_key(3),
            failed_last: int_key(4),
            hash: vec![0; 32],
        };
        let merged = merge_owed_rows(owed.clone(), Outgoing::Hash(claim.clone()));
        assert_eq!(merged, vec![Outgoing::RowsAndHash(owed, claim)]);
    }

    #[test]
    fn merge_extends_an_adjacent_terminal_rows_reply() {
        let owed = RowsPart {
            prev: int_key(1),
            last: int_key(2),
        };
        let reply = Outgoing::Rows(RowsPart {
            prev: int_key(2),
            last: vec![],
        });
        let merged = merge_owed_rows(owed, reply);
        assert_eq!(
            merged,
            vec![Outgoing::Rows(RowsPart {
                prev: int_key(1),
                last: vec![],
            })]
        );
    }

    #[test]
    fn merge_keeps_a_non_adjacent_terminal_last() {
        let owed = RowsPart {
            prev: int_key(1),
            last: int_key(2),
        };
        let terminal = Outgoing::Rows(RowsPart {
            prev: int_key(9),
            last: vec![],
        });
        let merged = merge_owed_rows(owed.clone(), terminal.clone());
        assert_eq!(merged, vec![Outgoing::Rows(owed), terminal]);
    }

    #[test]
    fn merge_puts_the_rows_before_a_non_adjacent_claim() {
        let owed = RowsPart {
            prev: int_key(1),
            last: int_key(2),
        };
        let claim = Outgoing::Hash(HashPart::Next {
            prev: int_key(5),
            last: int_key(9),
            hash: vec![0; 32],
        });
        let merged = merge_owed_rows(owed.clone(), claim.clone());
        assert_eq!(merged, vec![Outgoing::Rows(owed), claim]);
    }
}
