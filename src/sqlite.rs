//! SQLite driver for the record layer, built on `rusqlite`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};

use crate::backend::{Backend, StoreConnection};
use crate::config::DatabaseConfig;
use crate::error::{DataError, DataResult};
use crate::query::SqlQuery;
use crate::schema::EntitySchema;
use crate::value::{DataType, Value};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl From<rusqlite::Error> for DataError {
    fn from(err: rusqlite::Error) -> Self {
        DataError::DataAccess(Box::new(err))
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            Value::Boolean(v) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*v))),
        })
    }
}

fn decode(raw: ValueRef<'_>, data_type: DataType) -> DataResult<Value> {
    Ok(match (raw, data_type) {
        (ValueRef::Null, _) => Value::Null,
        (ValueRef::Integer(v), DataType::Boolean) => Value::Boolean(v != 0),
        (ValueRef::Integer(v), DataType::Real) => Value::Real(v as f64),
        (ValueRef::Integer(v), _) => Value::Integer(v),
        (ValueRef::Real(v), _) => Value::Real(v),
        (ValueRef::Text(bytes), _) => Value::Text(
            String::from_utf8(bytes.to_vec()).map_err(|e| DataError::DataAccess(Box::new(e)))?,
        ),
        (ValueRef::Blob(bytes), _) => Value::Blob(bytes.to_vec()),
    })
}

/// Opens file-backed SQLite connections.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Uses the configured database name as the file path.
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(&config.database)
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backend for SqliteBackend {
    type Connection = SqliteConnection;

    fn open(&self) -> DataResult<SqliteConnection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        debug!("opened sqlite connection to {}", self.path.display());
        Ok(SqliteConnection { conn })
    }

    fn target(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }
}

/// A single `rusqlite` connection.
pub struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    /// Direct access to the driver connection.
    pub fn raw(&self) -> &Connection {
        &self.conn
    }
}

impl StoreConnection for SqliteConnection {
    fn ping(&mut self) -> bool {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    // IMMEDIATE takes the write lock up front so concurrent writers wait on
    // the busy timeout instead of failing on lock upgrade.
    fn begin(&mut self) -> DataResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    // Deferred, so readers only take a shared lock and never queue behind a writer.
    fn begin_read(&mut self) -> DataResult<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> DataResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> DataResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn execute(&mut self, sql: &SqlQuery) -> DataResult<usize> {
        let mut stmt = self.conn.prepare_cached(&sql.statement)?;
        let affected = stmt.execute(params_from_iter(sql.params.iter()))?;
        Ok(affected)
    }

    fn query(&mut self, sql: &SqlQuery, schema: &EntitySchema) -> DataResult<Vec<Vec<Value>>> {
        let mut stmt = self.conn.prepare_cached(&sql.statement)?;
        let mut rows = stmt.query(params_from_iter(sql.params.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(schema.len());
            for (i, field) in schema.fields().iter().enumerate() {
                values.push(decode(row.get_ref(i)?, field.data_type)?);
            }
            result.push(values);
        }
        Ok(result)
    }

    fn execute_batch(&mut self, sql: &str) -> DataResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}
