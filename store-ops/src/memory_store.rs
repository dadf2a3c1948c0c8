//! An in-memory implementation of `TableStore`.

use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    table::{Direction, Filter, Query, Row, TableStore},
    tasks::ProofStorage,
    DataAccessError,
};

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Vec<Row>>,
    objects: HashMap<String, (Vec<u8>, String)>,
    next_id: u64,
}

/// An ephemeral store, useful for testing and demonstration purposes.
///
/// Rows inserted without an `id` column are given a generated one. Uploaded
/// proof objects are kept alongside the tables.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Creates an empty memory store.
    ///
    /// ```rust
    /// use store_ops::MemoryStore;
    ///
    /// let store = MemoryStore::new();
    /// let same_tables = store.clone();
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends rows to `table` as-is.
    pub async fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        self.inner
            .write()
            .await
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Returns a copy of every row in `table`.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .read()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns an uploaded object and its content type.
    pub async fn object(&self, path: &str) -> Option<(Vec<u8>, String)> {
        self.inner.read().await.objects.get(path).cloned()
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn query_rows(&self, query: &Query) -> Result<Vec<Row>, DataAccessError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Row> = inner
            .tables
            .get(query.table_name())
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_all(row, query.filters()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        rows.sort_by(|a, b| {
            for order in query.ordering() {
                let ord = compare(a.get(&order.column), b.get(&order.column));
                let ord = match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        if let Some(limit) = query.row_limit() {
            rows.truncate(limit);
        }

        Ok(rows)
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, DataAccessError> {
        let mut inner = self.inner.write().await;
        if !row.contains_key("id") {
            inner.next_id += 1;
            let id = format!("{table}-{}", inner.next_id);
            row.insert("id".to_string(), Value::String(id));
        }

        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());

        Ok(row)
    }

    async fn update(&self, query: &Query, patch: Row) -> Result<Vec<Row>, DataAccessError> {
        let mut inner = self.inner.write().await;
        let Some(rows) = inner.tables.get_mut(query.table_name()) else {
            return Ok(Vec::new());
        };

        let mut updated = Vec::new();
        for row in rows.iter_mut() {
            if matches_all(row, query.filters()) {
                row.extend(patch.clone());
                updated.push(row.clone());
            }
        }

        Ok(updated)
    }

    async fn upsert(
        &self,
        table: &str,
        row: Row,
        on_conflict: &[&str],
    ) -> Result<Row, DataAccessError> {
        {
            let mut inner = self.inner.write().await;
            let existing = inner.tables.get_mut(table).and_then(|rows| {
                rows.iter_mut().find(|existing| {
                    on_conflict
                        .iter()
                        .all(|column| existing.get(*column) == row.get(*column))
                })
            });

            if let Some(existing) = existing {
                existing.extend(row);
                return Ok(existing.clone());
            }
        }

        self.insert(table, row).await
    }
}

#[async_trait]
impl ProofStorage for MemoryStore {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), DataAccessError> {
        let mut inner = self.inner.write().await;
        if inner.objects.contains_key(path) {
            return Err(DataAccessError::Rejected {
                status: 409,
                message: format!("object `{path}` already exists"),
            });
        }

        inner
            .objects
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }
}

fn is_null(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn matches(row: &Row, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(column, value) => row.get(column) == Some(value),
        Filter::Neq(column, value) => {
            let current = row.get(column);
            !is_null(current) && current != Some(value)
        }
        Filter::In(column, values) => row
            .get(column)
            .is_some_and(|current| !current.is_null() && values.contains(current)),
        Filter::IsNull(column) => is_null(row.get(column)),
        Filter::NullOrNeq(column, value) => {
            let current = row.get(column);
            is_null(current) || current != Some(value)
        }
    }
}

fn matches_all(row: &Row, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| matches(row, filter))
}

/// Nulls sort above every other value, as they do in Postgres.
fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (a, b) if is_null(a) && is_null(b) => Ordering::Equal,
        (a, _) if is_null(a) => Ordering::Greater,
        (_, b) if is_null(b) => Ordering::Less,
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            let (a, b) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        _ => Ordering::Equal,
    }
}
