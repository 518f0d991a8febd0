//! Entity schemas, the schema registry, and in-memory records.
//!
//! A schema is declared once, validated, and frozen behind an `Arc`. Field
//! names are resolved to positions when the schema is built, so records
//! store their values positionally and every by-name access is a single map
//! lookup followed by a type check.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{DataError, DataResult};
use crate::value::{DataType, Value};

/// Position of a field inside its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId(usize);

impl FieldId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnConstraint {
    PrimaryKey,
    NotNull,
    Unique,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Integer(i64),
    Text(String),
    Real(f64),
    Null,
    CurrentTimestamp,
}

impl DefaultValue {
    fn as_sql(&self) -> String {
        match self {
            DefaultValue::Integer(v) => v.to_string(),
            DefaultValue::Text(v) => format!("'{}'", v.replace('\'', "''")),
            DefaultValue::Real(v) => v.to_string(),
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
        }
    }
}

/// A single declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub data_type: DataType,
    pub constraints: Vec<ColumnConstraint>,
    pub default_value: Option<DefaultValue>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            constraints: Vec::new(),
            default_value: None,
        }
    }

    pub fn primary_key(self) -> Self {
        self.with_constraint(ColumnConstraint::PrimaryKey)
    }

    pub fn not_null(self) -> Self {
        self.with_constraint(ColumnConstraint::NotNull)
    }

    pub fn unique(self) -> Self {
        self.with_constraint(ColumnConstraint::Unique)
    }

    pub fn with_constraint(mut self, constraint: ColumnConstraint) -> Self {
        if !self.constraints.contains(&constraint) {
            self.constraints.push(constraint);
        }
        self
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default_value = Some(default);
        self
    }

    pub fn is_primary_key(&self) -> bool {
        self.constraints.contains(&ColumnConstraint::PrimaryKey)
    }

    fn column_sql(&self, inline_pk: bool) -> String {
        let mut sql = format!("{} {}", quote_identifier(&self.name), self.data_type.as_sql());
        for constraint in &self.constraints {
            match constraint {
                ColumnConstraint::PrimaryKey if inline_pk => sql.push_str(" PRIMARY KEY"),
                ColumnConstraint::PrimaryKey => {}
                ColumnConstraint::NotNull => sql.push_str(" NOT NULL"),
                ColumnConstraint::Unique => sql.push_str(" UNIQUE"),
            }
        }
        if let Some(default) = &self.default_value {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default.as_sql());
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Immutable description of a record type.
#[derive(Debug)]
pub struct EntitySchema {
    name: String,
    fields: Vec<FieldDefinition>,
    by_name: HashMap<String, FieldId>,
    primary_key: Vec<FieldId>,
    indexes: Vec<IndexDefinition>,
}

impl EntitySchema {
    /// Starts declaring a schema.
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_id(&self, name: &str) -> Option<FieldId> {
        self.by_name.get(name).copied()
    }

    pub fn field(&self, id: FieldId) -> &FieldDefinition {
        &self.fields[id.0]
    }

    /// Looks a field up by name, failing with `UnknownField`.
    pub fn require_field(&self, name: &str) -> DataResult<FieldId> {
        self.field_id(name).ok_or_else(|| DataError::UnknownField {
            schema: self.name.clone(),
            field: name.to_string(),
        })
    }

    pub fn primary_key(&self) -> &[FieldId] {
        &self.primary_key
    }

    pub fn indexes(&self) -> &[IndexDefinition] {
        &self.indexes
    }

    /// Column list in declaration order, for SELECT statements.
    pub fn column_list(&self) -> String {
        self.fields
            .iter()
            .map(|f| quote_identifier(&f.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this schema.
    pub fn create_table_sql(&self) -> String {
        let inline_pk = self.primary_key.len() == 1;
        let mut columns: Vec<String> = self
            .fields
            .iter()
            .map(|f| f.column_sql(inline_pk))
            .collect();
        if self.primary_key.len() > 1 {
            let keys: Vec<String> = self
                .primary_key
                .iter()
                .map(|id| quote_identifier(&self.field(*id).name))
                .collect();
            columns.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&self.name),
            columns.join(", ")
        )
    }

    pub fn create_index_sql(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|index| {
                let columns: Vec<String> =
                    index.columns.iter().map(|c| quote_identifier(c)).collect();
                format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    quote_identifier(&index.name),
                    quote_identifier(&self.name),
                    columns.join(", ")
                )
            })
            .collect()
    }
}

impl PartialEq for EntitySchema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.fields == other.fields
    }
}

/// Builder returned by [`EntitySchema::builder`].
#[derive(Debug)]
pub struct SchemaBuilder {
    name: String,
    fields: Vec<FieldDefinition>,
    indexes: Vec<IndexDefinition>,
}

impl SchemaBuilder {
    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    /// Shorthand for a field without constraints.
    pub fn column(self, name: &str, data_type: DataType) -> Self {
        self.field(FieldDefinition::new(name, data_type))
    }

    pub fn index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    /// Validates the declaration and freezes it.
    pub fn build(self) -> DataResult<Arc<EntitySchema>> {
        check_identifier(&self.name)?;
        if self.fields.is_empty() {
            return Err(DataError::InvalidSchema(format!(
                "schema `{}` declares no fields",
                self.name
            )));
        }

        let mut by_name = HashMap::with_capacity(self.fields.len());
        let mut primary_key = Vec::new();
        for (i, field) in self.fields.iter().enumerate() {
            check_identifier(&field.name)?;
            if by_name.insert(field.name.clone(), FieldId(i)).is_some() {
                return Err(DataError::InvalidSchema(format!(
                    "schema `{}` declares field `{}` twice",
                    self.name, field.name
                )));
            }
            if field.is_primary_key() {
                primary_key.push(FieldId(i));
            }
        }

        for index in &self.indexes {
            check_identifier(&index.name)?;
            if let Some(missing) = index.columns.iter().find(|c| !by_name.contains_key(*c)) {
                return Err(DataError::InvalidSchema(format!(
                    "index `{}` refers to unknown field `{}`",
                    index.name, missing
                )));
            }
        }

        Ok(Arc::new(EntitySchema {
            name: self.name,
            fields: self.fields,
            by_name,
            primary_key,
            indexes: self.indexes,
        }))
    }
}

/// Double-quotes a name for use in SQL text, so keywords such as `group`
/// stay valid column and table names.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// Names are interpolated into SQL text, so only plain identifiers are accepted.
fn check_identifier(name: &str) -> DataResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DataError::InvalidSchema(format!(
            "`{}` is not a valid identifier",
            name
        )))
    }
}

/// The set of schemas a store is built with.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    schemas: Vec<Arc<EntitySchema>>,
    by_name: HashMap<String, usize>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema; names must be unique.
    pub fn register(&mut self, schema: Arc<EntitySchema>) -> DataResult<()> {
        if self.by_name.contains_key(schema.name()) {
            return Err(DataError::InvalidSchema(format!(
                "schema `{}` registered twice",
                schema.name()
            )));
        }
        self.by_name
            .insert(schema.name().to_string(), self.schemas.len());
        self.schemas.push(schema);
        Ok(())
    }

    pub fn with_schema(mut self, schema: Arc<EntitySchema>) -> DataResult<Self> {
        self.register(schema)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> DataResult<&Arc<EntitySchema>> {
        self.by_name
            .get(name)
            .map(|i| &self.schemas[*i])
            .ok_or_else(|| DataError::UnknownSchema(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.schemas.iter()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// An in-memory instance of an [`EntitySchema`].
#[derive(Clone)]
pub struct Record {
    schema: Arc<EntitySchema>,
    values: Vec<Value>,
}

impl Record {
    /// Creates a record with every field set to `Null`.
    pub fn new(schema: &Arc<EntitySchema>) -> Self {
        Self {
            schema: Arc::clone(schema),
            values: vec![Value::Null; schema.len()],
        }
    }

    /// Builds a record from `(field, value)` pairs.
    pub fn from_pairs<I, K, V>(schema: &Arc<EntitySchema>, pairs: I) -> DataResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut record = Self::new(schema);
        for (field, value) in pairs {
            record.set(field.as_ref(), value)?;
        }
        Ok(record)
    }

    /// Wraps positional values decoded from a row.
    pub(crate) fn from_row(schema: &Arc<EntitySchema>, values: Vec<Value>) -> DataResult<Self> {
        if values.len() != schema.len() {
            return Err(DataError::access(format!(
                "row for `{}` has {} columns, expected {}",
                schema.name(),
                values.len(),
                schema.len()
            )));
        }
        Ok(Self {
            schema: Arc::clone(schema),
            values,
        })
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn schema_name(&self) -> &str {
        self.schema.name()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.schema.field_id(field).map(|id| &self.values[id.0])
    }

    pub fn get_by_id(&self, id: FieldId) -> &Value {
        &self.values[id.0]
    }

    /// Sets a field by name. Returns whether the stored value changed.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> DataResult<bool> {
        let id = self.schema.require_field(field)?;
        self.set_by_id(id, value)
    }

    /// Sets a field by position. Returns whether the stored value changed.
    pub fn set_by_id(&mut self, id: FieldId, value: impl Into<Value>) -> DataResult<bool> {
        let definition = self.schema.field(id);
        let value = coerce(value.into(), definition.data_type);
        if !value.fits(definition.data_type) {
            return Err(DataError::TypeMismatch {
                field: definition.name.clone(),
                expected: definition.data_type.name(),
            });
        }
        if self.values[id.0] == value {
            return Ok(false);
        }
        self.values[id.0] = value;
        Ok(true)
    }

    /// Primary key values, in key order.
    pub fn key(&self) -> Vec<Value> {
        self.schema
            .primary_key()
            .iter()
            .map(|id| self.values[id.0].clone())
            .collect()
    }

    /// Borrowed `(field, value)` pairs in declaration order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema
            .fields()
            .iter()
            .map(|f| f.name.as_str())
            .zip(self.values.iter())
    }
}

// Integer literals are widened into real columns so stored values compare equal
// to what a query reads back. 0 and 1 are the stored form of booleans.
fn coerce(value: Value, data_type: DataType) -> Value {
    match (value, data_type) {
        (Value::Integer(v), DataType::Real) => Value::Real(v as f64),
        (Value::Integer(v @ (0 | 1)), DataType::Boolean) => Value::Boolean(v == 1),
        (value, _) => value,
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name() == other.schema.name() && self.values == other.values
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.schema.name());
        for (name, value) in self.pairs() {
            s.field(name, value);
        }
        s.finish()
    }
}
