use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde_json::Value;

use super::{error_message, execute, RestClient};
use crate::{
    table::{Direction, Filter, Query, Row, TableStore},
    DataAccessError,
};

const RETURN_REPRESENTATION: &str = "return=representation";
const MERGE_DUPLICATES: &str = "resolution=merge-duplicates,return=representation";

/// A filter operand as the gateway expects it.
fn operand(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// A list member, quoted when it contains reserved characters.
fn list_member(value: &Value) -> String {
    let text = operand(value);
    if text
        .chars()
        .any(|c| matches!(c, ',' | '(' | ')' | '"' | '\\') || c.is_whitespace())
    {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        text
    }
}

/// Encodes a query's filters, ordering and limit as query-string pairs.
pub(super) fn query_pairs(query: &Query) -> Vec<(String, String)> {
    let mut pairs = Vec::new();

    for filter in query.filters() {
        let pair = match filter {
            Filter::Eq(column, value) => (column.clone(), format!("eq.{}", operand(value))),
            Filter::Neq(column, value) => (column.clone(), format!("neq.{}", operand(value))),
            Filter::In(column, values) => {
                let members: Vec<String> = values.iter().map(list_member).collect();
                (column.clone(), format!("in.({})", members.join(",")))
            }
            Filter::IsNull(column) => (column.clone(), "is.null".to_string()),
            Filter::NullOrNeq(column, value) => (
                "or".to_string(),
                format!("({column}.is.null,{column}.neq.{})", list_member(value)),
            ),
        };
        pairs.push(pair);
    }

    if !query.ordering().is_empty() {
        let terms: Vec<String> = query
            .ordering()
            .iter()
            .map(|order| match order.direction {
                Direction::Ascending => format!("{}.asc", order.column),
                Direction::Descending => format!("{}.desc", order.column),
            })
            .collect();
        pairs.push(("order".to_string(), terms.join(",")));
    }

    if let Some(limit) = query.row_limit() {
        pairs.push(("limit".to_string(), limit.to_string()));
    }

    pairs
}

impl RestClient {
    fn table_request(&self, method: Method, table: &str) -> RequestBuilder {
        self.request(method, &format!("/rest/v1/{table}"))
    }
}

async fn fetch_rows(request: RequestBuilder) -> Result<Vec<Row>, DataAccessError> {
    let reply = execute(request)
        .await
        .map_err(|err| DataAccessError::Transport(err.to_string()))?;

    if !reply.status.is_success() {
        return Err(DataAccessError::Rejected {
            status: reply.status.as_u16(),
            message: error_message(reply.status, &reply.body),
        });
    }

    if reply.body.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&reply.body)?)
}

fn first_row(rows: Vec<Row>, table: &str) -> Result<Row, DataAccessError> {
    rows.into_iter()
        .next()
        .ok_or_else(|| DataAccessError::Rejected {
            status: 200,
            message: format!("no row was returned from `{table}`"),
        })
}

#[async_trait]
impl TableStore for RestClient {
    #[tracing::instrument(level = "debug", skip_all, fields(table = %query.table_name()), err)]
    async fn query_rows(&self, query: &Query) -> Result<Vec<Row>, DataAccessError> {
        let mut pairs = vec![("select".to_string(), "*".to_string())];
        pairs.extend(query_pairs(query));

        fetch_rows(
            self.table_request(Method::GET, query.table_name())
                .query(&pairs),
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, row), err)]
    async fn insert(&self, table: &str, row: Row) -> Result<Row, DataAccessError> {
        let rows = fetch_rows(
            self.table_request(Method::POST, table)
                .header("Prefer", RETURN_REPRESENTATION)
                .json(&row),
        )
        .await?;
        first_row(rows, table)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(table = %query.table_name()), err)]
    async fn update(&self, query: &Query, patch: Row) -> Result<Vec<Row>, DataAccessError> {
        fetch_rows(
            self.table_request(Method::PATCH, query.table_name())
                .header("Prefer", RETURN_REPRESENTATION)
                .query(&query_pairs(query))
                .json(&patch),
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, row), err)]
    async fn upsert(
        &self,
        table: &str,
        row: Row,
        on_conflict: &[&str],
    ) -> Result<Row, DataAccessError> {
        let rows = fetch_rows(
            self.table_request(Method::POST, table)
                .header("Prefer", MERGE_DUPLICATES)
                .query(&[("on_conflict", on_conflict.join(","))])
                .json(&row),
        )
        .await?;
        first_row(rows, table)
    }
}
