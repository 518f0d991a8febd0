//! Pooled, transactional record access for the Runar ecosystem.
//!
//! # Intention
//!
//! - Provide one API for adding, querying, updating, and deleting records
//!   of declared schemas.
//! - Run every operation in its own transaction on a pooled connection, so
//!   a failed call leaves no partial effect.
//! - Keep store-specific logic behind the [`Backend`] seam; SQLite is the
//!   shipped driver.
//!
//! # Architectural Boundaries
//!
//! - Only record access code belongs here: values, schemas, predicates,
//!   pooling, sessions, and the store façade.
//! - No migrations, retries, or dialect-specific SQL beyond what the
//!   operations need.
//!
//! # Example
//!
//! ```rust,no_run
//! use rust_records::{
//!     DataType, DatabaseConfig, EntitySchema, FieldDefinition, Query, Record, RecordStore,
//!     SchemaRegistry, Value,
//! };
//!
//! # fn main() -> Result<(), rust_records::DataError> {
//! let users = EntitySchema::builder("users")
//!     .field(FieldDefinition::new("id", DataType::Integer).primary_key())
//!     .field(FieldDefinition::new("name", DataType::Text).not_null())
//!     .build()?;
//! let store = RecordStore::open(
//!     &DatabaseConfig::new("records.db"),
//!     SchemaRegistry::new().with_schema(users.clone())?,
//! )?;
//!
//! let alice = Record::from_pairs(&users, [("id", Value::from(1)), ("name", "alice".into())])?;
//! store.add("users", vec![alice])?;
//! store.update("users", &Query::new().where_eq("id", 1), [("name", "alicia")])?;
//! let found = store.query("users", &Query::new().where_eq("id", 1), None, Some(1))?;
//! assert_eq!(found.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod pool;
pub mod query;
pub mod schema;
pub mod session;
pub mod sqlite;
pub mod store;
pub mod value;

pub use backend::{Backend, StoreConnection};
pub use config::DatabaseConfig;
pub use error::{DataError, DataResult};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use query::{
    CreateOperation, CrudOperation, CrudOutcome, DeleteOperation, Predicate, Query,
    QueryOperator, ReadOperation, SqlQuery, UpdateOperation,
};
pub use schema::{
    ColumnConstraint, DefaultValue, EntitySchema, FieldDefinition, FieldId, IndexDefinition,
    Record, SchemaBuilder, SchemaRegistry,
};
pub use session::{run_in_session, run_read_only, Session, SessionState};
pub use sqlite::{SqliteBackend, SqliteConnection};
pub use store::{Entity, RecordStore};
pub use value::{DataType, Value};
