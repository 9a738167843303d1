// ABOUTME: Leader-side structural schema comparison before any data flows
// ABOUTME: Both ends' table sets are filtered identically so ignored tables cost nothing

use std::collections::HashSet;

use crate::errors::{Result, SyncError};
use crate::schema::{Database, Table};

/// Returns the tables that survive the ignore/only filters, in catalog order.
/// `ignore` beats `only`; the CLI rejects names in both sets before this runs.
pub fn filter_tables<'a>(
    tables: &'a [Table],
    ignore: &HashSet<String>,
    only: &HashSet<String>,
) -> Vec<&'a Table> {
    tables
        .iter()
        .filter(|t| !ignore.contains(&t.name))
        .filter(|t| only.is_empty() || only.contains(&t.name))
        .collect()
}

/// Verifies the two ends agree on every table that will be synced: same table
/// set after filtering, identical columns (name, order, type, nullability)
/// and identical primary keys. Collects every difference so one run reports
/// them all.
pub fn check_schema_match(
    from_database: &Database,
    to_database: &Database,
    ignore: &HashSet<String>,
    only: &HashSet<String>,
) -> Result<()> {
    let from_tables = filter_tables(&from_database.tables, ignore, only);
    let to_tables = filter_tables(&to_database.tables, ignore, only);
    let mut problems = Vec::new();

    let from_names: HashSet<&str> = from_tables.iter().map(|t| t.name.as_str()).collect();
    let to_names: HashSet<&str> = to_tables.iter().map(|t| t.name.as_str()).collect();

    for table in &from_tables {
        if !to_names.contains(table.name.as_str()) {
            problems.push(format!("table {} is missing at the destination", table.name));
        }
    }
    for table in &to_tables {
        if !from_names.contains(table.name.as_str()) {
            problems.push(format!("table {} is missing at the source", table.name));
        }
    }

    for from_table in &from_tables {
        let Some(to_table) = to_tables.iter().find(|t| t.name == from_table.name) else {
            continue;
        };
        compare_table(from_table, to_table, &mut problems);
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(SyncError::SchemaMismatch(problems.join("\n")))
    }
}

fn compare_table(from_table: &Table, to_table: &Table, problems: &mut Vec<String>) {
    let name = &from_table.name;

    if from_table.columns.len() != to_table.columns.len() {
        problems.push(format!(
            "table {} has {} columns at the source but {} at the destination",
            name,
            from_table.columns.len(),
            to_table.columns.len()
        ));
        return;
    }

    for (from_column, to_column) in from_table.columns.iter().zip(&to_table.columns) {
        if from_column.name != to_column.name {
            problems.push(format!(
                "table {} column order differs: {} at the source vs {} at the destination",
                name, from_column.name, to_column.name
            ));
        } else {
            if from_column.column_type != to_column.column_type {
                problems.push(format!(
                    "table {} column {} has incompatible types ({:?} vs {:?})",
                    name, from_column.name, from_column.column_type, to_column.column_type
                ));
            }
            if from_column.nullable != to_column.nullable {
                problems.push(format!(
                    "table {} column {} differs in nullability",
                    name, from_column.name
                ));
            }
        }
    }

    if from_table.primary_key_columns != to_table.primary_key_columns {
        problems.push(format!("table {} has a different primary key", name));
    }
}
