//! The table store contract: a small query language over named tables of
//! JSON rows, and the trait backends implement to answer it.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::DataAccessError;

/// A row as returned by the table store: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// A row-filter predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`
    Eq(String, Value),
    /// `column <> value`. Rows where the column is null do not match.
    Neq(String, Value),
    /// `column` is one of the values.
    In(String, Vec<Value>),
    /// `column` is null.
    IsNull(String),
    /// `column` is null or differs from the value.
    NullOrNeq(String, Value),
}

/// Sort direction of an [`Order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Smallest first, nulls last.
    Ascending,
    /// Largest first, nulls first.
    Descending,
}

/// An ordering term.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    /// Column to sort by.
    pub column: String,
    /// Sort direction.
    pub direction: Direction,
}

/// A read against a single table, built up from filters, orderings and a
/// limit.
///
/// ```rust
/// use store_ops::table::{Direction, Query};
///
/// let query = Query::table("daily_store_sales")
///     .eq("store_code", "BLR01")
///     .order_by("sale_date", Direction::Descending)
///     .limit(1);
///
/// assert_eq!(query.table_name(), "daily_store_sales");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    table: String,
    filters: Vec<Filter>,
    order: Vec<Order>,
    limit: Option<usize>,
}

impl Query {
    /// Starts a query against `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    /// Adds an equality filter.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.into(), value.into()));
        self
    }

    /// Adds an inequality filter.
    pub fn neq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Neq(column.into(), value.into()));
        self
    }

    /// Adds a membership filter.
    pub fn is_in<V: Into<Value>>(
        mut self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.filters.push(Filter::In(column.into(), values));
        self
    }

    /// Adds a null filter.
    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.filters.push(Filter::IsNull(column.into()));
        self
    }

    /// Adds a "null or not equal" filter.
    pub fn null_or_neq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters
            .push(Filter::NullOrNeq(column.into(), value.into()));
        self
    }

    /// Appends an ordering term. Earlier terms take precedence.
    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order.push(Order {
            column: column.into(),
            direction,
        });
        self
    }

    /// Caps the number of rows returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The queried table.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// The filters, in the order they were added.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// The ordering terms.
    pub fn ordering(&self) -> &[Order] {
        &self.order
    }

    /// The row limit, if any.
    pub fn row_limit(&self) -> Option<usize> {
        self.limit
    }
}

/// A relational data service queried by row-filter predicates.
///
/// Any backend for which this is implemented may serve the
/// [`Hydrator`](crate::Hydrator) and the store-manager services. An in-memory
/// implementation is provided by [`MemoryStore`](crate::MemoryStore); the
/// `rest` feature adds an HTTP implementation.
///
/// A query matching nothing yields an empty result, never an error.
#[async_trait]
pub trait TableStore: Debug + Clone + Send + Sync + 'static {
    /// Returns every row matching the query.
    async fn query_rows(&self, query: &Query) -> Result<Vec<Row>, DataAccessError>;

    /// Returns the first row matching the query, if any.
    async fn query_row(&self, query: &Query) -> Result<Option<Row>, DataAccessError> {
        let query = query.clone().limit(1);
        Ok(self.query_rows(&query).await?.into_iter().next())
    }

    /// Inserts a row into `table` and returns it as stored.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, DataAccessError>;

    /// Merges `patch` into every row matching the query and returns the
    /// updated rows.
    async fn update(&self, query: &Query, patch: Row) -> Result<Vec<Row>, DataAccessError>;

    /// Inserts `row`, or merges it into the existing row whose
    /// `on_conflict` columns are equal.
    async fn upsert(
        &self,
        table: &str,
        row: Row,
        on_conflict: &[&str],
    ) -> Result<Row, DataAccessError>;
}

/// Decodes a row into a typed record.
pub fn decode<T: DeserializeOwned>(row: Row) -> Result<T, DataAccessError> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

/// Decodes every row into a typed record.
pub fn decode_all<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>, DataAccessError> {
    rows.into_iter().map(decode).collect()
}

/// Builds a [`Row`] from a JSON object literal. Non-objects give an empty row.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}
