// ABOUTME: PostgreSQL adapter with real snapshot export/import for multi-worker runs
// ABOUTME: Canonical values read through casts so both ends hash identical bytes

use postgres::types::ToSql;
use postgres::{Client, NoTls};

use crate::client::DatabaseClient;
use crate::errors::{Result, SyncError};
use crate::protocol::value::{ColumnValues, Row, Value};
use crate::schema::{
    choose_surrogate_primary_key, Column, ColumnType, Database, Key, Table,
};

/// PostgreSQL caps bound parameters per statement at 65535; the margin
/// mirrors what the batched writers elsewhere leave for safety.
const MAX_BOUND_PARAMS: usize = 65000;

pub struct PostgresClient {
    client: Client,
}

impl From<postgres::Error> for SyncError {
    fn from(e: postgres::Error) -> Self {
        SyncError::Database(Box::new(e))
    }
}

type Param = Box<dyn ToSql + Sync + Send>;

impl PostgresClient {
    pub fn connect(
        host: &str,
        port: &str,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let mut config = postgres::Config::new();
        config.host(if host.is_empty() { "localhost" } else { host });
        if !port.is_empty() {
            config.port(port.parse::<u16>().map_err(|_| {
                SyncError::database(format!("invalid port number {}", port))
            })?);
        }
        config.dbname(database);
        if !username.is_empty() {
            config.user(username);
        }
        if !password.is_empty() {
            config.password(password);
        }
        let client = config.connect(NoTls)?;
        Ok(Self { client })
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

    /// Cast appended to a placeholder so text-encoded values compare with
    /// the column's own type semantics rather than as strings.
    fn placeholder_cast(column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::Integer | ColumnType::Text | ColumnType::Blob => "",
            ColumnType::Real => "::float8",
            ColumnType::Decimal => "::numeric",
            ColumnType::Boolean => "::boolean",
            ColumnType::Date => "::date",
            ColumnType::Time => "::time",
            ColumnType::DateTime => "::timestamp",
            ColumnType::Unknown => "::text",
        }
    }

    /// Select expression producing the canonical encoding of a column:
    /// integers natively, text and bytea natively, everything else through
    /// its text rendering.
    fn select_expression(column: &Column) -> String {
        let quoted = Self::quote_ident(&column.name);
        match column.column_type {
            ColumnType::Integer => format!("{}::int8", quoted),
            ColumnType::Text | ColumnType::Blob => quoted,
            _ => format!("{}::text", quoted),
        }
    }

    fn bind_value(column: &Column, value: &Value) -> Result<Param> {
        let param: Param = match (column.column_type, value) {
            (_, Value::Int(i)) => Box::new(*i),
            (_, Value::Uint(u)) => Box::new(*u as i64),
            (ColumnType::Integer, Value::Nil) => Box::new(None::<i64>),
            (ColumnType::Blob, Value::Nil) => Box::new(None::<Vec<u8>>),
            (_, Value::Nil) => Box::new(None::<String>),
            (ColumnType::Blob, Value::Bytes(b)) => Box::new(b.clone()),
            (_, Value::Bytes(b)) => Box::new(String::from_utf8(b.clone()).map_err(|_| {
                SyncError::database(format!("non-UTF-8 text value in {}", column.name))
            })?),
            (_, Value::Array(_)) => {
                return Err(SyncError::database("arrays cannot be bound as column values"))
            }
        };
        Ok(param)
    }

    fn canonical_value(row: &postgres::Row, index: usize, column: &Column) -> Result<Value> {
        Ok(match column.column_type {
            ColumnType::Integer => match row.try_get::<_, Option<i64>>(index)? {
                Some(i) => Value::Int(i),
                None => Value::Nil,
            },
            ColumnType::Blob => match row.try_get::<_, Option<Vec<u8>>>(index)? {
                Some(b) => Value::Bytes(b),
                None => Value::Nil,
            },
            _ => match row.try_get::<_, Option<String>>(index)? {
                Some(s) => Value::Bytes(s.into_bytes()),
                None => Value::Nil,
            },
        })
    }

    /// Range WHERE clause with numbered, type-cast placeholders, plus the
    /// values to bind. `offset` is the number of placeholders already used
    /// in the statement.
    fn range_where(
        table: &Table,
        prev_key: &[Value],
        last_key: &[Value],
    ) -> Result<(String, Vec<Param>)> {
        let mut clauses = Vec::new();
        let mut params: Vec<Param> = Vec::new();
        for (op, key) in [(">", prev_key), ("<=", last_key)] {
            if key.is_empty() {
                continue;
            }
            let placeholders: Vec<String> = table
                .primary_key_columns
                .iter()
                .enumerate()
                .map(|(n, &column_index)| {
                    format!(
                        "${}{}",
                        params.len() + n + 1,
                        Self::placeholder_cast(table.columns[column_index].column_type)
                    )
                })
                .collect();
            clauses.push(format!(
                "{} {} ({})",
                Self::key_columns_tuple(table),
                op,
                placeholders.join(", ")
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

    fn table_schema(&mut self, name: &str) -> Result<Table> {
        let mut columns = Vec::new();
        for row in self.client.query(
            "SELECT column_name, data_type, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 \
             ORDER BY ordinal_position",
            &[&name],
        )? {
            let column_name: String = row.get(0);
            let data_type: String = row.get(1);
            let is_nullable: String = row.get(2);
            columns.push(Column {
                name: column_name,
                column_type: Self::column_type_from_data_type(&data_type),
                nullable: is_nullable == "YES",
            });
        }

        let primary_key_columns = self.primary_key_column_indices(name, &columns)?;
        let keys = self.unique_keys(name, &columns)?;

        let mut table = Table {
            name: name.to_string(),
            columns,
            primary_key_columns,
            keys,
        };
        choose_surrogate_primary_key(&mut table);
        Ok(table)
    }

    fn primary_key_column_indices(
        &mut self,
        table_name: &str,
        columns: &[Column],
    ) -> Result<Vec<usize>> {
        let rows = self.client.query(
            "SELECT a.attname \
             FROM pg_index i \
             JOIN pg_class c ON c.oid = i.indrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace, \
             unnest(i.indkey) WITH ORDINALITY k(attnum, ord) \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum \
             WHERE n.nspname = 'public' AND c.relname = $1 AND i.indisprimary \
             ORDER BY k.ord",
            &[&table_name],
        )?;
        rows.iter()
            .map(|row| {
                let column_name: String = row.get(0);
                columns
                    .iter()
                    .position(|c| c.name == column_name)
                    .ok_or_else(|| {
                        SyncError::database(format!(
                            "key column {} not found in {}",
                            column_name, table_name
                        ))
                    })
            })
            .collect()
    }

    fn unique_keys(&mut self, table_name: &str, columns: &[Column]) -> Result<Vec<Key>> {
        let index_rows = self.client.query(
            "SELECT ic.relname, i.indisunique \
             FROM pg_index i \
             JOIN pg_class c ON c.oid = i.indrelid \
             JOIN pg_class ic ON ic.oid = i.indexrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = 'public' AND c.relname = $1 \
               AND NOT i.indisprimary AND i.indpred IS NULL \
             ORDER BY ic.relname",
            &[&table_name],
        )?;
        let mut keys = Vec::new();
        for index_row in index_rows {
            let index_name: String = index_row.get(0);
            let unique: bool = index_row.get(1);
            let column_rows = self.client.query(
                "SELECT a.attname \
                 FROM pg_index i \
                 JOIN pg_class ic ON ic.oid = i.indexrelid, \
                 unnest(i.indkey) WITH ORDINALITY k(attnum, ord) \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum \
                 WHERE ic.relname = $1 \
                 ORDER BY k.ord",
                &[&index_name],
            )?;
            let column_indices = column_rows
                .iter()
                .map(|row| {
                    let column_name: String = row.get(0);
                    columns.iter().position(|c| c.name == column_name)
                })
                .collect::<Option<Vec<_>>>();
            // expression indexes have no plain column list; skip them
            if let Some(column_indices) = column_indices {
                keys.push(Key {
                    name: index_name,
                    unique,
                    columns: column_indices,
                });
            }
        }
        Ok(keys)
    }

    fn column_type_from_data_type(data_type: &str) -> ColumnType {
        match data_type {
            "smallint" | "integer" | "bigint" => ColumnType::Integer,
            "text" | "character varying" | "character" => ColumnType::Text,
            "bytea" => ColumnType::Blob,
            "real" | "double precision" => ColumnType::Real,
            "numeric" => ColumnType::Decimal,
            "boolean" => ColumnType::Boolean,
            "date" => ColumnType::Date,
            "time without time zone" | "time with time zone" => ColumnType::Time,
            "timestamp without time zone" | "timestamp with time zone" => ColumnType::DateTime,
            _ => ColumnType::Unknown,
        }
    }

    fn param_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
        params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

impl DatabaseClient for PostgresClient {
    fn supports_snapshots(&self) -> bool {
        true
    }

    /// Snapshot export is free on PostgreSQL: siblings adopt the exported
    /// snapshot without any blocking, so there is nothing to unhold.
    fn export_snapshot(&mut self) -> Result<String> {
        self.client
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")?;
        let row = self.client.query_one("SELECT pg_export_snapshot()", &[])?;
        Ok(row.get(0))
    }

    fn import_snapshot(&mut self, token: &str) -> Result<()> {
        self.client
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")?;
        self.client.batch_execute(&format!(
            "SET TRANSACTION SNAPSHOT '{}'",
            token.replace('\'', "''")
        ))?;
        Ok(())
    }

    fn start_read_transaction(&mut self) -> Result<()> {
        self.client
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")?;
        Ok(())
    }

    fn start_write_transaction(&mut self) -> Result<()> {
        self.client.batch_execute("BEGIN")?;
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.client.batch_execute("COMMIT")?;
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        self.client.batch_execute("ROLLBACK")?;
        Ok(())
    }

    fn populate_database_schema(&mut self) -> Result<Database> {
        let names: Vec<String> = self
            .client
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[],
            )?
            .iter()
            .map(|row| row.get(0))
            .collect();
        let tables = names
            .iter()
            .map(|name| self.table_schema(name))
            .collect::<Result<_>>()?;
        Ok(Database { tables })
    }

    fn disable_referential_integrity(&mut self) -> Result<()> {
        self.client
            .batch_execute("SET session_replication_role = replica")?;
        Ok(())
    }

    fn enable_referential_integrity(&mut self) -> Result<()> {
        self.client
            .batch_execute("SET session_replication_role = DEFAULT")?;
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
        let select_list: Vec<String> =
            table.columns.iter().map(Self::select_expression).collect();
        let (where_sql, params) = Self::range_where(table, prev_key, last_key)?;
        let mut sql = format!(
            "SELECT {} FROM {}{}{}",
            select_list.join(", "),
            Self::quote_ident(&table.name),
            where_sql,
            Self::order_by(table)
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let rows = self.client.query(&sql, &Self::param_refs(&params))?;
        let mut count = 0u64;
        for row in rows {
            let values: Row = table
                .columns
                .iter()
                .enumerate()
                .map(|(i, column)| Self::canonical_value(&row, i, column))
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
        let row = self.client.query_one(&sql, &Self::param_refs(&params))?;
        let count: i64 = row.get(0);
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
        let select_list: Vec<String> = table
            .primary_key_columns
            .iter()
            .map(|&i| Self::select_expression(&table.columns[i]))
            .collect();
        let (where_sql, params) = Self::range_where(table, prev_key, last_key)?;
        let sql = format!(
            "SELECT {} FROM {}{}{} LIMIT 1 OFFSET {}",
            select_list.join(", "),
            Self::quote_ident(&table.name),
            where_sql,
            Self::order_by(table),
            n - 1
        );
        let rows = self.client.query(&sql, &Self::param_refs(&params))?;
        match rows.first() {
            Some(row) => Ok(Some(
                table
                    .primary_key_columns
                    .iter()
                    .enumerate()
                    .map(|(i, &column_index)| {
                        Self::canonical_value(row, i, &table.columns[column_index])
                    })
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
        let rows_per_statement = (MAX_BOUND_PARAMS / table.columns.len().max(1)).max(1);

        for chunk in rows.chunks(rows_per_statement) {
            let mut params: Vec<Param> = Vec::with_capacity(chunk.len() * table.columns.len());
            let mut tuples = Vec::with_capacity(chunk.len());
            for row in chunk {
                let placeholders: Vec<String> = table
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(n, column)| {
                        format!(
                            "${}{}",
                            params.len() + n + 1,
                            Self::placeholder_cast(column.column_type)
                        )
                    })
                    .collect();
                tuples.push(format!("({})", placeholders.join(", ")));
                for (value, column) in row.iter().zip(&table.columns) {
                    params.push(Self::bind_value(column, value)?);
                }
            }
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                Self::quote_ident(&table.name),
                column_list.join(", "),
                tuples.join(", ")
            );
            self.client.execute(&sql, &Self::param_refs(&params))?;
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
            .enumerate()
            .map(|(n, &i)| {
                format!(
                    "{} = ${}{}",
                    Self::quote_ident(&table.columns[i].name),
                    n + 1,
                    Self::placeholder_cast(table.columns[i].column_type)
                )
            })
            .collect();
        let key_placeholders: Vec<String> = table
            .primary_key_columns
            .iter()
            .enumerate()
            .map(|(n, &i)| {
                format!(
                    "${}{}",
                    non_key.len() + n + 1,
                    Self::placeholder_cast(table.columns[i].column_type)
                )
            })
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ({})",
            Self::quote_ident(&table.name),
            assignments.join(", "),
            Self::key_columns_tuple(table),
            key_placeholders.join(", ")
        );
        for row in rows {
            let mut params: Vec<Param> =
                Vec::with_capacity(non_key.len() + table.primary_key_columns.len());
            for &i in &non_key {
                params.push(Self::bind_value(&table.columns[i], &row[i])?);
            }
            for &i in &table.primary_key_columns {
                params.push(Self::bind_value(&table.columns[i], &row[i])?);
            }
            self.client.execute(&sql, &Self::param_refs(&params))?;
        }
        Ok(())
    }

    fn delete_rows(&mut self, table: &Table, keys: &[ColumnValues]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let key_width = table.primary_key_columns.len().max(1);
        let keys_per_statement = (MAX_BOUND_PARAMS / key_width).max(1);

        for chunk in keys.chunks(keys_per_statement) {
            let mut params: Vec<Param> = Vec::with_capacity(chunk.len() * key_width);
            let mut tuples = Vec::with_capacity(chunk.len());
            for key in chunk {
                let placeholders: Vec<String> = table
                    .primary_key_columns
                    .iter()
                    .enumerate()
                    .map(|(n, &i)| {
                        format!(
                            "${}{}",
                            params.len() + n + 1,
                            Self::placeholder_cast(table.columns[i].column_type)
                        )
                    })
                    .collect();
                tuples.push(format!("({})", placeholders.join(", ")));
                for (value, &column_index) in key.iter().zip(&table.primary_key_columns) {
                    params.push(Self::bind_value(&table.columns[column_index], value)?);
                }
            }
            let sql = format!(
                "DELETE FROM {} WHERE {} IN (VALUES {})",
                Self::quote_ident(&table.name),
                Self::key_columns_tuple(table),
                tuples.join(", ")
            );
            self.client.execute(&sql, &Self::param_refs(&params))?;
        }
        Ok(())
    }
}
