//! The capability set the record layer needs from a backing store.
//!
//! Pooling, sessions, and the record engine only talk to a store through
//! these two traits. [`crate::sqlite::SqliteBackend`] is the shipped driver.

use crate::error::DataResult;
use crate::query::SqlQuery;
use crate::schema::EntitySchema;
use crate::value::Value;

/// Opens connections to one backing-store target.
pub trait Backend: Send + Sync + 'static {
    type Connection: StoreConnection;

    fn open(&self) -> DataResult<Self::Connection>;

    /// Human readable target, used in log lines. Must not include secrets.
    fn target(&self) -> String;
}

/// A live connection to the store.
pub trait StoreConnection: Send + 'static {
    /// Lightweight liveness probe.
    fn ping(&mut self) -> bool;

    fn begin(&mut self) -> DataResult<()>;

    /// Opens a transaction that will only read. Stores that lock less for
    /// readers override this.
    fn begin_read(&mut self) -> DataResult<()> {
        self.begin()
    }

    fn commit(&mut self) -> DataResult<()>;

    fn rollback(&mut self) -> DataResult<()>;

    /// Runs a statement and returns the affected row count.
    fn execute(&mut self, sql: &SqlQuery) -> DataResult<usize>;

    /// Runs a SELECT whose columns are the schema's fields in declaration order.
    fn query(&mut self, sql: &SqlQuery, schema: &EntitySchema) -> DataResult<Vec<Vec<Value>>>;

    /// Runs parameterless statements, e.g. table creation.
    fn execute_batch(&mut self, sql: &str) -> DataResult<()>;
}
