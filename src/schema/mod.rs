// ABOUTME: Table and column model loaded from the catalog and shipped over the wire
// ABOUTME: Frozen after the leader's schema comparison; key order drives everything else

pub mod compare;

use crate::errors::{Result, SyncError};
use crate::protocol::value::Value;

/// Coarse column type classification, enough to decide the canonical value
/// encoding and to check cross-end compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Unknown = 0,
    Integer = 1,
    Real = 2,
    Decimal = 3,
    Text = 4,
    Blob = 5,
    Boolean = 6,
    Date = 7,
    Time = 8,
    DateTime = 9,
}

impl ColumnType {
    pub fn from_u64(v: u64) -> Self {
        match v {
            1 => Self::Integer,
            2 => Self::Real,
            3 => Self::Decimal,
            4 => Self::Text,
            5 => Self::Blob,
            6 => Self::Boolean,
            7 => Self::Date,
            8 => Self::Time,
            9 => Self::DateTime,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// A secondary key; unique keys can stand in for a missing primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key_columns: Vec<usize>,
    pub keys: Vec<Key>,
}

impl Table {
    /// Indices of the columns that are not part of the primary key.
    pub fn non_key_columns(&self) -> Vec<usize> {
        (0..self.columns.len())
            .filter(|i| !self.primary_key_columns.contains(i))
            .collect()
    }
}

/// The set of tables loaded from one end's catalog, in catalog order.
#[derive(Debug, Clone, Default)]
pub struct Database {
    pub tables: Vec<Table>,
}

/// Tables without an explicit primary key can still be synced if they carry
/// a unique key over non-nullable columns; promote the first such key.
pub fn choose_surrogate_primary_key(table: &mut Table) {
    if !table.primary_key_columns.is_empty() {
        return;
    }
    for key in &table.keys {
        if key.unique
            && key
                .columns
                .iter()
                .all(|&c| !table.columns[c].nullable)
        {
            table.primary_key_columns = key.columns.clone();
            return;
        }
    }
}

// Wire form: the whole database is a single value tree so the SCHEMA reply
// is one self-delimiting value on the stream.
//   database := [table...]
//   table    := [name, [column...], [pk index...], [key...]]
//   column   := [name, type, nullable]
//   key      := [name, unique, [column index...]]

pub fn pack_database(database: &Database) -> Value {
    Value::Array(database.tables.iter().map(pack_table).collect())
}

fn pack_table(table: &Table) -> Value {
    Value::Array(vec![
        Value::bytes(table.name.as_bytes().to_vec()),
        Value::Array(table.columns.iter().map(pack_column).collect()),
        Value::Array(
            table
                .primary_key_columns
                .iter()
                .map(|&i| Value::Uint(i as u64))
                .collect(),
        ),
        Value::Array(table.keys.iter().map(pack_key).collect()),
    ])
}

fn pack_column(column: &Column) -> Value {
    Value::Array(vec![
        Value::bytes(column.name.as_bytes().to_vec()),
        Value::Uint(column.column_type as u64),
        Value::Uint(column.nullable as u64),
    ])
}

fn pack_key(key: &Key) -> Value {
    Value::Array(vec![
        Value::bytes(key.name.as_bytes().to_vec()),
        Value::Uint(key.unique as u64),
        Value::Array(key.columns.iter().map(|&i| Value::Uint(i as u64)).collect()),
    ])
}

pub fn unpack_database(value: &Value) -> Result<Database> {
    let tables = expect_array(value, "database")?;
    Ok(Database {
        tables: tables.iter().map(unpack_table).collect::<Result<_>>()?,
    })
}

fn unpack_table(value: &Value) -> Result<Table> {
    let fields = expect_array(value, "table")?;
    if fields.len() != 4 {
        return Err(SyncError::protocol("malformed table in schema"));
    }
    let columns = expect_array(&fields[1], "columns")?
        .iter()
        .map(unpack_column)
        .collect::<Result<Vec<_>>>()?;
    let primary_key_columns = unpack_indices(&fields[2], columns.len(), "primary key")?;
    let keys = expect_array(&fields[3], "keys")?
        .iter()
        .map(|k| unpack_key(k, columns.len()))
        .collect::<Result<_>>()?;
    Ok(Table {
        name: expect_string(&fields[0], "table name")?,
        columns,
        primary_key_columns,
        keys,
    })
}

fn unpack_column(value: &Value) -> Result<Column> {
    let fields = expect_array(value, "column")?;
    if fields.len() != 3 {
        return Err(SyncError::protocol("malformed column in schema"));
    }
    Ok(Column {
        name: expect_string(&fields[0], "column name")?,
        column_type: ColumnType::from_u64(expect_uint(&fields[1], "column type")?),
        nullable: expect_uint(&fields[2], "column nullability")? != 0,
    })
}

fn unpack_key(value: &Value, column_count: usize) -> Result<Key> {
    let fields = expect_array(value, "key")?;
    if fields.len() != 3 {
        return Err(SyncError::protocol("malformed key in schema"));
    }
    Ok(Key {
        name: expect_string(&fields[0], "key name")?,
        unique: expect_uint(&fields[1], "key uniqueness")? != 0,
        columns: unpack_indices(&fields[2], column_count, "key")?,
    })
}

fn unpack_indices(value: &Value, column_count: usize, what: &str) -> Result<Vec<usize>> {
    expect_array(value, what)?
        .iter()
        .map(|v| {
            let index = expect_uint(v, what)? as usize;
            if index >= column_count {
                return Err(SyncError::protocol(format!(
                    "{} column index {} out of range",
                    what, index
                )));
            }
            Ok(index)
        })
        .collect()
}

fn expect_array<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    match value {
        Value::Array(values) => Ok(values),
        _ => Err(SyncError::protocol(format!(
            "schema {} should be an array",
            what
        ))),
    }
}

fn expect_string(value: &Value, what: &str) -> Result<String> {
    match value {
        Value::Bytes(b) => String::from_utf8(b.clone())
            .map_err(|_| SyncError::protocol(format!("schema {} is not valid UTF-8", what))),
        _ => Err(SyncError::protocol(format!(
            "schema {} should be a string",
            what
        ))),
    }
}

fn expect_uint(value: &Value, what: &str) -> Result<u64> {
    match value {
        Value::Uint(u) => Ok(*u),
        _ => Err(SyncError::protocol(format!(
            "schema {} should be an unsigned integer",
            what
        ))),
    }
}
