//! The record access engine.
//!
//! [`RecordStore`] owns the connection pool and the schema registry and
//! exposes add/query/update/delete. Every call runs in its own session, so
//! a call either fully commits or leaves the store as it found it.

use std::sync::Arc;

use log::{debug, info};

use crate::backend::Backend;
use crate::config::DatabaseConfig;
use crate::error::{DataError, DataResult};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::query::{
    CreateOperation, CrudOperation, CrudOutcome, DeleteOperation, Query, ReadOperation,
    SqlQuery, UpdateOperation,
};
use crate::schema::{EntitySchema, FieldId, Record, SchemaRegistry};
use crate::session::{self, Session};
use crate::sqlite::SqliteBackend;
use crate::value::Value;

/// A Rust type stored as records of one schema.
pub trait Entity: Sized {
    /// Name of the schema the type is stored under.
    const SCHEMA: &'static str;

    /// Declares the schema, for registration.
    fn schema() -> DataResult<Arc<EntitySchema>>;

    fn to_record(&self, schema: &Arc<EntitySchema>) -> DataResult<Record>;

    fn from_record(record: &Record) -> DataResult<Self>;
}

/// Pooled, transactional access to the records of a set of schemas.
pub struct RecordStore<B: Backend = SqliteBackend> {
    pool: ConnectionPool<B>,
    schemas: SchemaRegistry,
}

impl RecordStore<SqliteBackend> {
    /// Opens a SQLite-backed store and creates any missing tables.
    pub fn open(config: &DatabaseConfig, schemas: SchemaRegistry) -> DataResult<Self> {
        config.validate()?;
        Self::with_backend(
            SqliteBackend::from_config(config),
            config.pool.clone(),
            schemas,
        )
    }
}

impl<B: Backend> RecordStore<B> {
    pub fn with_backend(
        backend: B,
        pool_config: PoolConfig,
        schemas: SchemaRegistry,
    ) -> DataResult<Self> {
        let target = backend.target();
        let store = Self {
            pool: ConnectionPool::new(backend, pool_config)?,
            schemas,
        };
        store.create_tables()?;
        info!(
            "record store ready at {} ({} schemas)",
            target,
            store.schemas.len()
        );
        Ok(store)
    }

    fn create_tables(&self) -> DataResult<()> {
        self.run_in_session(|session| {
            for schema in self.schemas.iter() {
                session.execute_sql(&SqlQuery::new(&schema.create_table_sql()))?;
                for statement in schema.create_index_sql() {
                    session.execute_sql(&SqlQuery::new(&statement))?;
                }
            }
            Ok(())
        })
    }

    pub fn schema(&self, name: &str) -> DataResult<&Arc<EntitySchema>> {
        self.schemas.get(name)
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn pool(&self) -> &ConnectionPool<B> {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Runs caller-defined work in one transaction. See [`session::run_in_session`].
    pub fn run_in_session<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut Session<'_, B>) -> Result<T, E>,
        E: From<DataError>,
    {
        session::run_in_session(&self.pool, work)
    }

    /// Runs caller-defined reads in one transaction. See [`session::run_read_only`].
    pub fn run_read_only<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut Session<'_, B>) -> Result<T, E>,
        E: From<DataError>,
    {
        session::run_read_only(&self.pool, work)
    }

    /// Inserts records of `schema` and returns how many were inserted.
    ///
    /// Every record must belong to `schema`; a stray record fails the whole
    /// call with `SchemaMismatch` before anything is written.
    pub fn add<I>(&self, schema: &str, records: I) -> DataResult<usize>
    where
        I: IntoIterator<Item = Record>,
    {
        let schema = self.schemas.get(schema)?;
        let records: Vec<Record> = records.into_iter().collect();
        if let Some(stray) = records.iter().find(|r| !belongs_to(r, schema)) {
            return Err(DataError::SchemaMismatch {
                expected: schema.name().to_string(),
                found: stray.schema_name().to_string(),
            });
        }
        self.insert_all(schema, &records)
    }

    /// Inserts only the records that belong to `schema`, skipping the rest.
    pub fn add_matching<I>(&self, schema: &str, records: I) -> DataResult<usize>
    where
        I: IntoIterator<Item = Record>,
    {
        let schema = self.schemas.get(schema)?;
        let records: Vec<Record> = records
            .into_iter()
            .filter(|r| belongs_to(r, schema))
            .collect();
        self.insert_all(schema, &records)
    }

    fn insert_all(&self, schema: &EntitySchema, records: &[Record]) -> DataResult<usize> {
        let inserted = self.run_in_session(|session| -> DataResult<usize> {
            for record in records {
                session.insert(record)?;
            }
            Ok(records.len())
        })?;
        debug!("added {} `{}` records", inserted, schema.name());
        Ok(inserted)
    }

    /// Deletes every record matching `query`; an empty query deletes all rows.
    pub fn delete(&self, schema: &str, query: &Query) -> DataResult<usize> {
        let schema = self.schemas.get(schema)?;
        let deleted = self.run_in_session(|session| session.delete(schema, query))?;
        debug!("deleted {} `{}` records", deleted, schema.name());
        Ok(deleted)
    }

    /// Applies `updates` to every record matching `query`.
    ///
    /// Fields the schema does not declare are skipped. Returns the number of
    /// records visited, whether or not any value actually changed.
    pub fn update<I, K, V>(&self, schema: &str, query: &Query, updates: I) -> DataResult<usize>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let schema = self.schemas.get(schema)?;
        let updates: Vec<(FieldId, Value)> = updates
            .into_iter()
            .filter_map(|(field, value)| match schema.field_id(field.as_ref()) {
                Some(id) => Some((id, value.into())),
                None => {
                    debug!(
                        "skipping update of unknown field `{}` on `{}`",
                        field.as_ref(),
                        schema.name()
                    );
                    None
                }
            })
            .collect();
        if !updates.is_empty() && schema.primary_key().is_empty() {
            return Err(DataError::access(format!(
                "schema `{}` has no primary key; records cannot be updated",
                schema.name()
            )));
        }

        let visited = self.run_in_session(|session| {
            let records = session.select(schema, query, None, None)?;
            let visited = records.len();
            for mut record in records {
                let key = record.key();
                let mut changed = false;
                for (id, value) in &updates {
                    changed |= record.set_by_id(*id, value.clone())?;
                }
                if changed {
                    session.track(record, key);
                }
            }
            Ok::<_, DataError>(visited)
        })?;
        debug!("updated {} `{}` records", visited, schema.name());
        Ok(visited)
    }

    /// Returns the records matching `query`, ascending by `order_by` if given.
    ///
    /// `limit == Some(1)` returns at most the first match. Any other limit
    /// is ignored and every match is returned.
    pub fn query(
        &self,
        schema: &str,
        query: &Query,
        order_by: Option<&str>,
        limit: Option<usize>,
    ) -> DataResult<Vec<Record>> {
        let schema = self.schemas.get(schema)?;
        let first_only = limit == Some(1);
        self.run_read_only(|session| {
            session.select(schema, query, order_by, first_only.then_some(1))
        })
    }

    /// Runs one CRUD operation.
    pub fn execute(&self, op: CrudOperation) -> DataResult<CrudOutcome> {
        match op {
            CrudOperation::Create(CreateOperation { schema, records }) => {
                self.add(&schema, records).map(CrudOutcome::Inserted)
            }
            CrudOperation::Read(ReadOperation {
                schema,
                query,
                order_by,
                limit,
            }) => self
                .query(&schema, &query, order_by.as_deref(), limit)
                .map(CrudOutcome::Records),
            CrudOperation::Update(UpdateOperation {
                schema,
                query,
                updates,
            }) => self
                .update(&schema, &query, updates)
                .map(CrudOutcome::Updated),
            CrudOperation::Delete(DeleteOperation { schema, query }) => {
                self.delete(&schema, &query).map(CrudOutcome::Deleted)
            }
        }
    }

    /// Inserts typed entities.
    pub fn add_entities<E: Entity>(&self, items: &[E]) -> DataResult<usize> {
        let schema = self.schemas.get(E::SCHEMA)?;
        let records = items
            .iter()
            .map(|item| item.to_record(schema))
            .collect::<DataResult<Vec<_>>>()?;
        self.add(E::SCHEMA, records)
    }

    /// Queries typed entities. Same ordering and limit rules as [`RecordStore::query`].
    pub fn query_entities<E: Entity>(
        &self,
        query: &Query,
        order_by: Option<&str>,
        limit: Option<usize>,
    ) -> DataResult<Vec<E>> {
        self.query(E::SCHEMA, query, order_by, limit)?
            .iter()
            .map(E::from_record)
            .collect()
    }

    /// Disposes the pool. Later calls fail with `PoolClosed`.
    pub fn close(&self) {
        self.pool.dispose();
    }
}

impl<B: Backend> Drop for RecordStore<B> {
    fn drop(&mut self) {
        self.pool.dispose();
    }
}

impl<B: Backend> std::fmt::Debug for RecordStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("pool", &self.pool)
            .field("schemas", &self.schemas.len())
            .finish()
    }
}

fn belongs_to(record: &Record, schema: &EntitySchema) -> bool {
    let declared: &EntitySchema = record.schema();
    declared == schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::schema::FieldDefinition;
    use crate::value::DataType;

    fn users() -> Arc<EntitySchema> {
        EntitySchema::builder("users")
            .field(FieldDefinition::new("id", DataType::Integer).primary_key())
            .column("name", DataType::Text)
            .build()
            .unwrap()
    }

    fn orders() -> Arc<EntitySchema> {
        EntitySchema::builder("orders")
            .field(FieldDefinition::new("id", DataType::Integer).primary_key())
            .build()
            .unwrap()
    }

    fn store(backend: &MockBackend) -> RecordStore<MockBackend> {
        let schemas = SchemaRegistry::new()
            .with_schema(users())
            .unwrap()
            .with_schema(orders())
            .unwrap();
        RecordStore::with_backend(backend.clone(), PoolConfig::default(), schemas).unwrap()
    }

    #[test]
    fn test_construction_creates_tables() {
        let backend = MockBackend::default();
        let _store = store(&backend);
        assert_eq!(
            backend.events(),
            vec![
                "BEGIN",
                r#"CREATE TABLE IF NOT EXISTS "users" ("id" INTEGER PRIMARY KEY, "name" TEXT)"#,
                r#"CREATE TABLE IF NOT EXISTS "orders" ("id" INTEGER PRIMARY KEY)"#,
                "COMMIT",
            ]
        );
    }

    #[test]
    fn test_add_rejects_stray_records_before_writing() {
        let backend = MockBackend::default();
        let store = store(&backend);
        let before = backend.events().len();

        let user = Record::from_pairs(&users(), [("id", 1)]).unwrap();
        let order = Record::from_pairs(&orders(), [("id", 1)]).unwrap();
        let err = store.add("users", vec![user, order]).unwrap_err();

        assert!(matches!(
            err,
            DataError::SchemaMismatch { ref expected, ref found }
                if expected == "users" && found == "orders"
        ));
        assert_eq!(backend.events().len(), before);
    }

    #[test]
    fn test_add_matching_narrows() {
        let backend = MockBackend::default();
        let store = store(&backend);

        let user = Record::from_pairs(&users(), [("id", 1)]).unwrap();
        let order = Record::from_pairs(&orders(), [("id", 1)]).unwrap();
        assert_eq!(store.add_matching("users", vec![user, order]).unwrap(), 1);
        assert!(backend
            .events()
            .contains(&r#"INSERT INTO "users" ("id") VALUES (?)"#.to_string()));
    }

    #[test]
    fn test_query_runs_in_read_transaction() {
        let backend = MockBackend::default();
        let store = store(&backend);
        let before = backend.events().len();

        store
            .query("users", &Query::from_pairs([("id", 1)]), None, Some(1))
            .unwrap();
        assert_eq!(
            backend.events()[before..].to_vec(),
            vec![
                "BEGIN READ",
                r#"SELECT "id", "name" FROM "users" WHERE "id" = ? LIMIT 1"#,
                "COMMIT",
            ]
        );
    }

    #[test]
    fn test_unknown_schema() {
        let backend = MockBackend::default();
        let store = store(&backend);
        assert!(matches!(
            store.delete("invoices", &Query::all()),
            Err(DataError::UnknownSchema(_))
        ));
    }

    #[test]
    fn test_update_without_primary_key() {
        let backend = MockBackend::default();
        let log = EntitySchema::builder("log")
            .column("line", DataType::Text)
            .build()
            .unwrap();
        let schemas = SchemaRegistry::new().with_schema(log).unwrap();
        let store =
            RecordStore::with_backend(backend.clone(), PoolConfig::default(), schemas).unwrap();

        let err = store
            .update("log", &Query::all(), [("line", "x")])
            .unwrap_err();
        assert!(matches!(err, DataError::DataAccess(_)));
        // Unknown fields only: nothing to write back, so no key is needed.
        assert_eq!(
            store.update("log", &Query::all(), [("missing", "x")]).unwrap(),
            0
        );
    }

    #[test]
    fn test_close_disposes_pool() {
        let backend = MockBackend::default();
        let store = store(&backend);
        store.close();
        assert!(matches!(
            store.query("users", &Query::all(), None, None),
            Err(DataError::PoolClosed)
        ));
    }
}
