// ABOUTME: SQLite adapter: catalog introspection, keyed range reads, batched writes
// ABOUTME: Values map by storage class; declared types only steer key binding

use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::client::DatabaseClient;
use crate::errors::{Result, SyncError};
use crate::protocol::value::{ColumnValues, Row, Value};
use crate::schema::{
    choose_surrogate_primary_key, Column, ColumnType, Database, Key, Table,
};

/// SQLite's historical bound parameter limit; staying under it keeps the
/// batched statements portable to older library builds.
const MAX_BOUND_PARAMS: usize = 900;

pub struct SqliteClient {
    conn: Connection,
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Database(Box::new(e))
    }
}

impl SqliteClient {
    pub fn connect(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    fn quote_ident(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn key_columns_tuple(table: &Table) -> String {
        let cols: Vec<String> = table
            .primary_key_columns
            .iter()
            .map(|&i| Self::quote_ident(&table.columns[i].name))
            .collect();
        format!("({})", cols.join(", "))
    }

    fn order_by(table: &Table) -> String {
        let cols: Vec<String> = table
            .primary_key_columns
            .iter()
            .map(|&i| Self::quote_ident(&table.columns[i].name))
            .collect();
        format!(" ORDER BY {}", cols.join(", "))
    }

    /// `(pk...) > (?...) AND (pk...) <= (?...)`, omitting whichever bound is
    /// empty. Returns the SQL fragment and the bound values.
    fn range_where(
        table: &Table,
        prev_key: &[Value],
        last_key: &[Value],
    ) -> Result<(String, Vec<rusqlite::types::Value>)> {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for (op, key) in [(">", prev_key), ("<=", last_key)] {
            if key.is_empty() {
                continue;
            }
            let placeholders = vec!["?"; key.len()].join(", ");
            clauses.push(format!(
                "{} {} ({})",
                Self::key_columns_tuple(table),
                op,
                placeholders
            ));
            for (value, &column_index) in key.iter().zip(&table.primary_key_columns) {
                params.push(Self::bind_value(&table.columns[column_index], value)?);
            }
        }
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        Ok((sql, params))
    }

    /// Maps a canonical value back to an SQLite binding, using the declared
    /// column type to pick the storage class for byte strings.
    fn bind_value(column: &Column, value: &Value) -> Result<rusqlite::types::Value> {
        Ok(match value {
            Value::Nil => rusqlite::types::Value::Null,
            Value::Int(i) => rusqlite::types::Value::Integer(*i),
            Value::Uint(u) => rusqlite::types::Value::Integer(*u as i64),
            Value::Bytes(bytes) => match column.column_type {
                ColumnType::Blob => rusqlite::types::Value::Blob(bytes.clone()),
                ColumnType::Real | ColumnType::Decimal => {
                    let text = std::str::from_utf8(bytes).map_err(|_| {
                        SyncError::database(format!("non-UTF-8 numeric value in {}", column.name))
                    })?;
                    rusqlite::types::Value::Real(text.parse().map_err(|_| {
                        SyncError::database(format!("bad numeric value for {}", column.name))
                    })?)
                }
                _ => rusqlite::types::Value::Text(
                    String::from_utf8(bytes.clone()).map_err(|_| {
                        SyncError::database(format!("non-UTF-8 text value in {}", column.name))
                    })?,
                ),
            },
            Value::Array(_) => {
                return Err(SyncError::database("arrays cannot be bound as column values"))
            }
        })
    }

    /// Canonical value from an SQLite cell: the storage class decides, which
    /// matches SQLite's own dynamic typing.
    fn canonical_value(cell: ValueRef<'_>) -> Value {
        match cell {
            ValueRef::Null => Value::Nil,
            ValueRef::Integer(i) => Value::Int(i),
            ValueRef::Real(f) => Value::Bytes(format!("{}", f).into_bytes()),
            ValueRef::Text(t) => Value::Bytes(t.to_vec()),
            ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
        }
    }

    fn column_type_from_declaration(declared: &str) -> ColumnType {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            ColumnType::Text
        } else if upper.contains("BLOB") || upper.is_empty() {
            ColumnType::Blob
        } else if upper.contains("BOOL") {
            ColumnType::Boolean
        } else if upper.contains("DATETIME") || upper.contains("TIMESTAMP") {
            ColumnType::DateTime
        } else if upper.contains("DATE") {
            ColumnType::Date
        } else if upper.contains("TIME") {
            ColumnType::Time
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            ColumnType::Real
        } else if upper.contains("DEC") || upper.contains("NUMERIC") {
            ColumnType::Decimal
        } else {
            ColumnType::Unknown
        }
    }

    fn table_schema(&self, name: &str) -> Result<Table> {
        let mut columns = Vec::new();
        let mut pk_positions: Vec<(i64, usize)> = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA table_info({})", Self::quote_ident(name)))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let column_name: String = row.get("name")?;
                let declared: String = row.get("type")?;
                let not_null: bool = row.get("notnull")?;
                let pk: i64 = row.get("pk")?;
                if pk > 0 {
                    pk_positions.push((pk, columns.len()));
                }
                columns.push(Column {
                    name: column_name,
                    column_type: Self::column_type_from_declaration(&declared),
                    nullable: !not_null,
                });
            }
        }
        pk_positions.sort();
        let primary_key_columns = pk_positions.into_iter().map(|(_, i)| i).collect();

        let mut keys = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA index_list({})", Self::quote_ident(name)))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let index_name: String = row.get("name")?;
                let unique: bool = row.get("unique")?;
                let origin: String = row.get("origin")?;
                let partial: bool = row.get("partial")?;
                if origin == "pk" || partial {
                    continue;
                }
                keys.push((index_name, unique));
            }
        }
        let keys = keys
            .into_iter()
            .map(|(index_name, unique)| {
                let mut column_indices = Vec::new();
                let mut stmt = self.conn.prepare(&format!(
                    "PRAGMA index_info({})",
                    Self::quote_ident(&index_name)
                ))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    let cid: i64 = row.get("cid")?;
                    if cid >= 0 {
                        column_indices.push(cid as usize);
                    }
                }
                Ok(Key {
                    name: index_name,
                    unique,
                    columns: column_indices,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut table = Table {
            name: name.to_string(),
            columns,
            primary_key_columns,
            keys,
        };
        choose_surrogate_primary_key(&mut table);
        Ok(table)
    }
}

impl DatabaseClient for SqliteClient {
    fn start_read_transaction(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn start_write_transaction(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn populate_database_schema(&mut self) -> Result<Database> {
        let names: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type='table' AND name NOT LIKE 'sqlite_%' \
                 ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        let tables = names
            .iter()
            .map(|name| self.table_schema(name))
            .collect::<Result<_>>()?;
        Ok(Database { tables })
    }

    fn disable_referential_integrity(&mut self) -> Result<()> {
        // per-transaction and self-clearing at commit
        self.conn.execute_batch("PRAGMA defer_foreign_keys = ON")?;
        Ok(())
    }

    fn enable_referential_integrity(&mut self) -> Result<()> {
        self.conn.execute_batch("PRAGMA defer_foreign_keys = OFF")?;
        Ok(())
    }

    fn query_rows(
        &mut self,
        table: &Table,
        prev_key: &[Value],
        last_key: &[Value],
        limit: Option<u64>,
        visit: &mut dyn FnMut(Row) -> Result<()>,
    ) -> Result<u64> {
        let column_list: Vec<String> = table
            .columns
            .iter()
            .map(|c| Self::quote_ident(&c.name))
            .collect();
        let (where_sql, params) = Self::range_where(table, prev_key, last_key)?;
        let mut sql = format!(
            "SELECT {} FROM {}{}{}",
            column_list.join(", "),
            Self::quote_ident(&table.name),
            where_sql,
            Self::order_by(table)
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut count = 0u64;
        while let Some(row) = rows.next()? {
            let values: Row = (0..table.columns.len())
                .map(|i| Ok(Self::canonical_value(row.get_ref(i)?)))
                .collect::<Result<_>>()?;
            visit(values)?;
            count += 1;
        }
        Ok(count)
    }

    fn count_rows(
        &mut self,
        table: &Table,
        prev_key: &[Value],
        last_key: &[Value],
    ) -> Result<u64> {
        let (where_sql, params) = Self::range_where(table, prev_key, last_key)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            Self::quote_ident(&table.name),
            where_sql
        );
        let count: i64 = self
            .conn
            .query_row(&sql, rusqlite::params_from_iter(params), |row| row.get(0))?;
        Ok(count as u64)
    }

    fn nth_key(
        &mut self,
        table: &Table,
        prev_key: &[Value],
        last_key: &[Value],
        n: u64,
    ) -> Result<Option<ColumnValues>> {
        if n == 0 {
            return Ok(None);
        }
        let key_columns: Vec<String> = table
            .primary_key_columns
            .iter()
            .map(|&i| Self::quote_ident(&table.columns[i].name))
            .collect();
        let (where_sql, params) = Self::range_where(table, prev_key, last_key)?;
        let sql = format!(
            "SELECT {} FROM {}{}{} LIMIT 1 OFFSET {}",
            key_columns.join(", "),
            Self::quote_ident(&table.name),
            where_sql,
            Self::order_by(table),
            n - 1
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        match rows.next()? {
            Some(row) => Ok(Some(
                (0..table.primary_key_columns.len())
                    .map(|i| Ok(Self::canonical_value(row.get_ref(i)?)))
                    .collect::<Result<_>>()?,
            )),
            None => Ok(None),
        }
    }

    fn insert_rows(&mut self, table: &Table, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let column_list: Vec<String> = table
            .columns
            .iter()
            .map(|c| Self::quote_ident(&c.name))
            .collect();
        let row_placeholders = format!("({})", vec!["?"; table.columns.len()].join(", "));
        let rows_per_statement = (MAX_BOUND_PARAMS / table.columns.len().max(1)).max(1);

        for chunk in rows.chunks(rows_per_statement) {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                Self::quote_ident(&table.name),
                column_list.join(", "),
                vec![row_placeholders.clone(); chunk.len()].join(", ")
            );
            let mut params = Vec::with_capacity(chunk.len() * table.columns.len());
            for row in chunk {
                for (value, column) in row.iter().zip(&table.columns) {
                    params.push(Self::bind_value(column, value)?);
                }
            }
            self.conn
                .execute(&sql, rusqlite::params_from_iter(params))?;
        }
        Ok(())
    }

    fn update_rows(&mut self, table: &Table, rows: &[Row]) -> Result<()> {
        let non_key = table.non_key_columns();
        if rows.is_empty() || non_key.is_empty() {
            return Ok(());
        }
        let assignments: Vec<String> = non_key
            .iter()
            .map(|&i| format!("{} = ?", Self::quote_ident(&table.columns[i].name)))
            .collect();
        let key_placeholders = vec!["?"; table.primary_key_columns.len()].join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ({})",
            Self::quote_ident(&table.name),
            assignments.join(", "),
            Self::key_columns_tuple(table),
            key_placeholders
        );
        let mut stmt = self.conn.prepare(&sql)?;
        for row in rows {
            let mut params = Vec::with_capacity(non_key.len() + table.primary_key_columns.len());
            for &i in &non_key {
                params.push(Self::bind_value(&table.columns[i], &row[i])?);
            }
            for &i in &table.primary_key_columns {
                params.push(Self::bind_value(&table.columns[i], &row[i])?);
            }
            stmt.execute(rusqlite::params_from_iter(params))?;
        }
        Ok(())
    }

    fn delete_rows(&mut self, table: &Table, keys: &[ColumnValues]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let key_width = table.primary_key_columns.len().max(1);
        let keys_per_statement = (MAX_BOUND_PARAMS / key_width).max(1);
        let row_placeholders = format!("({})", vec!["?"; key_width].join(", "));

        for chunk in keys.chunks(keys_per_statement) {
            let sql = format!(
                "DELETE FROM {} WHERE {} IN (VALUES {})",
                Self::quote_ident(&table.name),
                Self::key_columns_tuple(table),
                vec![row_placeholders.clone(); chunk.len()].join(", ")
            );
            let mut params = Vec::with_capacity(chunk.len() * key_width);
            for key in chunk {
                for (value, &column_index) in key.iter().zip(&table.primary_key_columns) {
                    params.push(Self::bind_value(&table.columns[column_index], value)?);
                }
            }
            self.conn
                .execute(&sql, rusqlite::params_from_iter(params))?;
        }
        Ok(())
    }
}
