//! Transactional sessions over pooled connections.
//!
//! A [`Session`] owns one pooled connection with an open transaction. It is
//! only reachable through [`run_in_session`], which commits when the work
//! succeeds, rolls back when it fails, and always hands the connection back
//! to the pool. A session dropped while still open (for example while a
//! panic unwinds) rolls back in its destructor.
//!
//! [`run_read_only`] opens a session that refuses writes, which lets the
//! store begin a lighter transaction.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::backend::{Backend, StoreConnection};
use crate::error::{DataError, DataResult};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::query::{Query, SqlQuery};
use crate::schema::{EntitySchema, Record};
use crate::value::Value;

/// Lifecycle of a session's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Committing,
    Committed,
    RolledBack,
}

/// A record change waiting to be written back at commit.
struct PendingWrite {
    record: Record,
    key: Vec<Value>,
}

/// A unit of work bound to one pooled connection.
pub struct Session<'p, B: Backend> {
    conn: PooledConnection<'p, B>,
    state: SessionState,
    read_only: bool,
    trace_sql: bool,
    pending: Vec<PendingWrite>,
}

impl<'p, B: Backend> Session<'p, B> {
    fn begin(
        mut conn: PooledConnection<'p, B>,
        read_only: bool,
        trace_sql: bool,
    ) -> DataResult<Self> {
        if trace_sql {
            let mode = if read_only { " (read only)" } else { "" };
            info!(target: "sql", "BEGIN{}", mode);
        }
        if read_only {
            conn.begin_read()?;
        } else {
            conn.begin()?;
        }
        Ok(Self {
            conn,
            state: SessionState::Open,
            read_only,
            trace_sql,
            pending: Vec::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of records staged for write-back.
    pub fn tracked(&self) -> usize {
        self.pending.len()
    }

    pub fn insert(&mut self, record: &Record) -> DataResult<usize> {
        self.execute_sql(&SqlQuery::insert(record))
    }

    /// Loads matching records. `limit` is passed to the store as-is.
    pub fn select(
        &mut self,
        schema: &Arc<EntitySchema>,
        query: &Query,
        order_by: Option<&str>,
        limit: Option<usize>,
    ) -> DataResult<Vec<Record>> {
        let sql = SqlQuery::select(schema, query, order_by, limit)?;
        self.trace(&sql);
        self.conn
            .query(&sql, schema)?
            .into_iter()
            .map(|row| Record::from_row(schema, row))
            .collect()
    }

    pub fn delete(&mut self, schema: &EntitySchema, query: &Query) -> DataResult<usize> {
        self.execute_sql(&SqlQuery::delete(schema, query)?)
    }

    /// Stages a modified record to be written back at commit.
    ///
    /// `key` is the primary key the record was loaded with, so key fields
    /// may themselves be modified.
    pub fn track(&mut self, record: Record, key: Vec<Value>) {
        self.pending.push(PendingWrite { record, key });
    }

    /// Runs a raw statement inside the session's transaction.
    ///
    /// Fails without touching the store in a read-only session.
    pub fn execute_sql(&mut self, sql: &SqlQuery) -> DataResult<usize> {
        if self.read_only {
            return Err(DataError::access(format!(
                "read-only session refused `{}`",
                sql.statement
            )));
        }
        self.trace(sql);
        self.conn.execute(sql)
    }

    fn trace(&self, sql: &SqlQuery) {
        if self.trace_sql {
            info!(target: "sql", "{}", sql);
        }
    }

    fn flush(&mut self) -> DataResult<usize> {
        let pending = std::mem::take(&mut self.pending);
        let mut written = 0;
        for write in &pending {
            let sql = SqlQuery::update(&write.record, &write.key)?;
            written += self.execute_sql(&sql)?;
        }
        Ok(written)
    }

    fn commit(mut self) -> DataResult<()> {
        self.state = SessionState::Committing;
        // Flushing drains the pending list, which detaches every tracked record.
        let result = self.flush().and_then(|written| {
            if self.trace_sql {
                info!(target: "sql", "COMMIT");
            }
            self.conn.commit()?;
            Ok(written)
        });
        match result {
            Ok(written) => {
                self.state = SessionState::Committed;
                debug!("session committed ({} records written back)", written);
                Ok(())
            }
            Err(e) => {
                // A failed rollback is logged by `abort`; the commit failure is reported.
                let _ = self.abort();
                Err(DataError::TransactionFailed(Box::new(e)))
            }
        }
    }

    fn rollback(mut self) -> DataResult<()> {
        self.abort()
    }

    fn abort(&mut self) -> DataResult<()> {
        self.pending.clear();
        self.state = SessionState::RolledBack;
        if self.trace_sql {
            info!(target: "sql", "ROLLBACK");
        }
        match self.conn.rollback() {
            Ok(()) => {
                debug!("session rolled back");
                Ok(())
            }
            Err(e) => {
                warn!("rollback failed, discarding connection: {}", e);
                self.conn.mark_broken();
                Err(e)
            }
        }
    }
}

impl<'p, B: Backend> Drop for Session<'p, B> {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Open | SessionState::Committing) {
            let _ = self.abort();
        }
    }
}

/// Runs `work` in a fresh session on a connection from `pool`.
///
/// Commits when `work` returns `Ok`; a commit failure is reported as
/// `TransactionFailed`. When `work` returns `Err` the transaction is rolled
/// back and that error is returned unchanged. The connection goes back to
/// the pool on every path.
pub fn run_in_session<B, T, E, F>(pool: &ConnectionPool<B>, work: F) -> Result<T, E>
where
    B: Backend,
    F: FnOnce(&mut Session<'_, B>) -> Result<T, E>,
    E: From<DataError>,
{
    run(pool, false, work)
}

/// Like [`run_in_session`], but the session only reads.
///
/// Writes through the session fail with `DataAccess`. Staged records are
/// never written back, so tracking one fails the commit.
pub fn run_read_only<B, T, E, F>(pool: &ConnectionPool<B>, work: F) -> Result<T, E>
where
    B: Backend,
    F: FnOnce(&mut Session<'_, B>) -> Result<T, E>,
    E: From<DataError>,
{
    run(pool, true, work)
}

fn run<B, T, E, F>(pool: &ConnectionPool<B>, read_only: bool, work: F) -> Result<T, E>
where
    B: Backend,
    F: FnOnce(&mut Session<'_, B>) -> Result<T, E>,
    E: From<DataError>,
{
    let conn = pool.acquire()?;
    let mut session = Session::begin(conn, read_only, pool.config().trace_sql)?;
    match work(&mut session) {
        Ok(value) => {
            session.commit()?;
            Ok(value)
        }
        Err(err) => {
            let _ = session.rollback();
            Err(err)
        }
    }
}
