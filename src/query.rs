//! Predicates, filters, and the SQL statements built from them.

use std::fmt;

use crate::error::{DataError, DataResult};
use crate::schema::{quote_identifier, EntitySchema, Record};
use crate::value::Value;

/// Comparison applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOperator {
    Equal(Value),
    In(Vec<Value>),
}

impl QueryOperator {
    pub fn equal(value: impl Into<Value>) -> Self {
        QueryOperator::Equal(value.into())
    }

    pub fn any_of<I>(values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        QueryOperator::In(values.into_iter().map(Into::into).collect())
    }
}

/// A scalar compares for equality.
impl From<Value> for QueryOperator {
    fn from(value: Value) -> Self {
        QueryOperator::Equal(value)
    }
}

macro_rules! scalar_operator {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for QueryOperator {
                fn from(value: $ty) -> Self {
                    QueryOperator::Equal(value.into())
                }
            }
        )*
    };
}

scalar_operator!(i64, i32, u32, f64, bool, &str, String);

/// `None` compares as `IS NULL`.
impl<T: Into<Value>> From<Option<T>> for QueryOperator {
    fn from(value: Option<T>) -> Self {
        QueryOperator::Equal(value.into())
    }
}

/// A sequence compares for membership.
impl<T: Into<Value>> From<Vec<T>> for QueryOperator {
    fn from(values: Vec<T>) -> Self {
        QueryOperator::any_of(values)
    }
}

/// One field comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub operator: QueryOperator,
}

/// Ordered conjunction of predicates.
///
/// An empty query matches every record of the schema it is applied to.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Query {
    conditions: Vec<Predicate>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches everything. Spelled out for call sites that mean it.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_condition(mut self, field: &str, op: QueryOperator) -> Self {
        self.conditions.push(Predicate {
            field: field.to_string(),
            operator: op,
        });
        self
    }

    pub fn where_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.with_condition(field, QueryOperator::equal(value))
    }

    pub fn where_in<I>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.with_condition(field, QueryOperator::any_of(values))
    }

    /// Builds a query from an ordered `field -> value` mapping.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<QueryOperator>,
    {
        pairs
            .into_iter()
            .fold(Self::new(), |q, (k, v)| q.with_condition(k.as_ref(), v.into()))
    }

    pub fn conditions(&self) -> &[Predicate] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Renders the WHERE clause (empty when unconstrained) and its parameters.
    ///
    /// `Null` operands compare with `IS NULL`, both alone and inside an `IN` list.
    pub(crate) fn where_clause(&self, schema: &EntitySchema) -> DataResult<(String, Vec<Value>)> {
        if self.conditions.is_empty() {
            return Ok((String::new(), Vec::new()));
        }
        let mut terms = Vec::with_capacity(self.conditions.len());
        let mut params = Vec::new();
        for predicate in &self.conditions {
            if schema.field_id(&predicate.field).is_none() {
                return Err(DataError::access(format!(
                    "malformed predicate: `{}` has no field `{}`",
                    schema.name(),
                    predicate.field
                )));
            }
            let column = quote_identifier(&predicate.field);
            match &predicate.operator {
                QueryOperator::Equal(Value::Null) => terms.push(format!("{} IS NULL", column)),
                QueryOperator::Equal(value) => {
                    terms.push(format!("{} = ?", column));
                    params.push(value.clone());
                }
                QueryOperator::In(values) => {
                    let (nulls, listed): (Vec<&Value>, Vec<&Value>) =
                        values.iter().partition(|v| v.is_null());
                    let membership = format!(
                        "{} IN ({})",
                        column,
                        vec!["?"; listed.len()].join(", ")
                    );
                    let term = match (listed.is_empty(), nulls.is_empty()) {
                        (true, true) => "1 = 0".to_string(),
                        (true, false) => format!("{} IS NULL", column),
                        (false, true) => membership,
                        (false, false) => format!("({} OR {} IS NULL)", membership, column),
                    };
                    terms.push(term);
                    params.extend(listed.into_iter().cloned());
                }
            }
        }
        Ok((format!(" WHERE {}", terms.join(" AND ")), params))
    }
}

/// SQL statement with positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub statement: String,
    pub params: Vec<Value>,
}

impl SqlQuery {
    pub fn new(statement: &str) -> Self {
        Self {
            statement: statement.to_string(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// SELECT of every field, filtered and optionally ordered ascending.
    pub fn select(
        schema: &EntitySchema,
        query: &Query,
        order_by: Option<&str>,
        limit: Option<usize>,
    ) -> DataResult<Self> {
        let (clause, params) = query.where_clause(schema)?;
        let mut statement = format!(
            "SELECT {} FROM {}{}",
            schema.column_list(),
            quote_identifier(schema.name()),
            clause
        );
        if let Some(field) = order_by {
            schema.require_field(field)?;
            statement.push_str(" ORDER BY ");
            statement.push_str(&quote_identifier(field));
        }
        if let Some(limit) = limit {
            statement.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(Self { statement, params })
    }

    pub fn delete(schema: &EntitySchema, query: &Query) -> DataResult<Self> {
        let (clause, params) = query.where_clause(schema)?;
        Ok(Self {
            statement: format!("DELETE FROM {}{}", quote_identifier(schema.name()), clause),
            params,
        })
    }

    /// INSERT of the record's non-null fields, so column defaults still apply.
    pub fn insert(record: &Record) -> Self {
        let (columns, params): (Vec<String>, Vec<Value>) = record
            .pairs()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (quote_identifier(name), value.clone()))
            .unzip();
        let table = quote_identifier(record.schema_name());
        let statement = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", table)
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            )
        };
        Self { statement, params }
    }

    /// UPDATE of every field, key fields included, addressed by the key the
    /// record was loaded with.
    pub fn update(record: &Record, key: &[Value]) -> DataResult<Self> {
        let schema = record.schema();
        if schema.primary_key().is_empty() {
            return Err(DataError::access(format!(
                "schema `{}` has no primary key; records cannot be written back",
                schema.name()
            )));
        }
        let mut assignments = Vec::with_capacity(schema.len());
        let mut params = Vec::with_capacity(schema.len() + key.len());
        for (name, value) in record.pairs() {
            assignments.push(format!("{} = ?", quote_identifier(name)));
            params.push(value.clone());
        }
        let mut terms = Vec::with_capacity(key.len());
        for (id, value) in schema.primary_key().iter().zip(key) {
            terms.push(format!("{} = ?", quote_identifier(&schema.field(*id).name)));
            params.push(value.clone());
        }
        Ok(Self {
            statement: format!(
                "UPDATE {} SET {} WHERE {}",
                quote_identifier(schema.name()),
                assignments.join(", "),
                terms.join(" AND ")
            ),
            params,
        })
    }
}

impl fmt::Display for SqlQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.statement)?;
        if !self.params.is_empty() {
            let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
            write!(f, " [{}]", params.join(", "))?;
        }
        Ok(())
    }
}

/// CRUD operation types
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOperation {
    pub schema: String,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOperation {
    pub schema: String,
    pub query: Query,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOperation {
    pub schema: String,
    pub query: Query,
    pub updates: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOperation {
    pub schema: String,
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrudOperation {
    Create(CreateOperation),
    Read(ReadOperation),
    Update(UpdateOperation),
    Delete(DeleteOperation),
}

/// Result of a [`CrudOperation`].
#[derive(Debug, Clone, PartialEq)]
pub enum CrudOutcome {
    Inserted(usize),
    Records(Vec<Record>),
    Updated(usize),
    Deleted(usize),
}

impl CrudOutcome {
    /// Row count for mutations, record count for reads.
    pub fn count(&self) -> usize {
        match self {
            CrudOutcome::Inserted(n) | CrudOutcome::Updated(n) | CrudOutcome::Deleted(n) => *n,
            CrudOutcome::Records(records) => records.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDefinition;
    use crate::value::DataType;
    use std::sync::Arc;

    fn users() -> Arc<EntitySchema> {
        EntitySchema::builder("users")
            .field(FieldDefinition::new("id", DataType::Integer).primary_key())
            .column("name", DataType::Text)
            .column("active", DataType::Boolean)
            .build()
            .unwrap()
    }

    #[test]
    fn test_empty_query_is_unconstrained() {
        let schema = users();
        let sql = SqlQuery::select(&schema, &Query::all(), None, None).unwrap();
        assert_eq!(sql.statement, r#"SELECT "id", "name", "active" FROM "users""#);
        assert!(sql.params.is_empty());
    }

    #[test]
    fn test_scalar_and_sequence_mapping() {
        let query = Query::from_pairs(vec![
            ("name", QueryOperator::from(Value::from("a"))),
            ("id", QueryOperator::from(vec![Value::from(1), Value::from(2)])),
        ]);
        assert_eq!(
            query.conditions()[0].operator,
            QueryOperator::Equal(Value::from("a"))
        );

        let sql = SqlQuery::select(&users(), &query, Some("id"), None).unwrap();
        assert_eq!(
            sql.statement,
            r#"SELECT "id", "name", "active" FROM "users" WHERE "name" = ? AND "id" IN (?, ?) ORDER BY "id""#
        );
        assert_eq!(
            sql.params,
            vec![Value::from("a"), Value::from(1), Value::from(2)]
        );
    }

    #[test]
    fn test_order_changes_text_only() {
        let a = Query::new().where_eq("id", 1).where_eq("name", "x");
        let b = Query::new().where_eq("name", "x").where_eq("id", 1);
        let sa = SqlQuery::delete(&users(), &a).unwrap();
        let sb = SqlQuery::delete(&users(), &b).unwrap();
        assert_eq!(sa.statement, r#"DELETE FROM "users" WHERE "id" = ? AND "name" = ?"#);
        assert_eq!(sb.statement, r#"DELETE FROM "users" WHERE "name" = ? AND "id" = ?"#);
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let query = Query::new().where_in("id", Vec::<i64>::new());
        let sql = SqlQuery::delete(&users(), &query).unwrap();
        assert_eq!(sql.statement, r#"DELETE FROM "users" WHERE 1 = 0"#);
    }

    #[test]
    fn test_unknown_predicate_field() {
        let query = Query::new().where_eq("email", "x");
        let err = SqlQuery::select(&users(), &query, None, None).unwrap_err();
        assert!(matches!(err, DataError::DataAccess(_)));

        let err = SqlQuery::select(&users(), &Query::all(), Some("email"), None).unwrap_err();
        assert!(matches!(err, DataError::UnknownField { .. }));
    }

    #[test]
    fn test_insert_skips_nulls() {
        let schema = users();
        let record = Record::from_pairs(&schema, [("name", "a")]).unwrap();
        let sql = SqlQuery::insert(&record);
        assert_eq!(sql.statement, r#"INSERT INTO "users" ("name") VALUES (?)"#);

        let empty = SqlQuery::insert(&Record::new(&schema));
        assert_eq!(empty.statement, r#"INSERT INTO "users" DEFAULT VALUES"#);
    }

    #[test]
    fn test_update_addresses_original_key() {
        let schema = users();
        let mut record =
            Record::from_pairs(&schema, [("id", Value::from(1)), ("name", "a".into())]).unwrap();
        let key = record.key();
        record.set("id", 7).unwrap();
        let sql = SqlQuery::update(&record, &key).unwrap();
        assert_eq!(
            sql.statement,
            r#"UPDATE "users" SET "id" = ?, "name" = ?, "active" = ? WHERE "id" = ?"#
        );
        assert_eq!(sql.params.last(), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_null_compares_with_is_null() {
        let query = Query::new().where_eq("name", Value::Null);
        let sql = SqlQuery::delete(&users(), &query).unwrap();
        assert_eq!(sql.statement, r#"DELETE FROM "users" WHERE "name" IS NULL"#);
        assert!(sql.params.is_empty());

        let query = Query::new().where_in("name", vec![Value::from("a"), Value::Null]);
        let sql = SqlQuery::delete(&users(), &query).unwrap();
        assert_eq!(
            sql.statement,
            r#"DELETE FROM "users" WHERE ("name" IN (?) OR "name" IS NULL)"#
        );
        assert_eq!(sql.params, vec![Value::from("a")]);

        let query = Query::new().where_in("name", vec![Value::Null]);
        let sql = SqlQuery::delete(&users(), &query).unwrap();
        assert_eq!(sql.statement, r#"DELETE FROM "users" WHERE "name" IS NULL"#);
    }

    #[test]
    fn test_plain_scalars_convert_to_operators() {
        let query = Query::from_pairs([("id", 1)]);
        assert_eq!(
            query.conditions()[0].operator,
            QueryOperator::Equal(Value::Integer(1))
        );

        let query = Query::from_pairs([("id", vec![1, 2])]);
        assert_eq!(
            query.conditions()[0].operator,
            QueryOperator::In(vec![Value::Integer(1), Value::Integer(2)])
        );

        let query = Query::from_pairs([("name", None::<&str>)]);
        assert_eq!(query.conditions()[0].operator, QueryOperator::Equal(Value::Null));
    }

    #[test]
    fn test_display_includes_params() {
        let sql = SqlQuery::new("SELECT 1 WHERE ? = ?").with_param(1).with_param("a");
        assert_eq!(sql.to_string(), "SELECT 1 WHERE ? = ? [1, 'a']");
    }
}
