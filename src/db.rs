//! External SQL boundary: trace tables behind a narrow query interface.
//!
//! The engine never owns the relational store; it only issues the two
//! fixed queries below through [`DbClient`]. The SQL strings are the
//! contract — a conforming backend can be rusqlite, Postgres, or a test
//! double.

use std::collections::BTreeSet;
use std::collections::HashMap;

use serde_json::Value;

use crate::error::DbError;

/// Result type for database operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Positional query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Float(f64),
}

/// One result row: column name → JSON value.
pub type Row = HashMap<String, Value>;

/// Minimal SQL client boundary.
pub trait DbClient: Send + Sync {
    fn query(&self, sql: &str, params: &[SqlParam]) -> DbResult<Vec<Row>>;
}

/// Per-user executed workflows with their task results.
pub const EXECUTION_TRACE_QUERY: &str = "SELECT task_results, capability_id, executed_at \
     FROM execution_trace \
     WHERE user_id = ?1 AND executed_at >= ?2 \
     ORDER BY executed_at ASC";

/// System-wide algorithm decisions for the emergence timeseries.
pub const ALGORITHM_TRACES_QUERY: &str = "SELECT decision, timestamp \
     FROM algorithm_traces \
     WHERE timestamp >= ?1 \
     ORDER BY timestamp ASC";

/// Time range selector for the metrics endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Range {
    Hour,
    Day,
    Week,
    Month,
}

impl Range {
    /// Parse the query-string form (`1h|24h|7d|30d`).
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "1h" => Some(Range::Hour),
            "24h" => Some(Range::Day),
            "7d" => Some(Range::Week),
            "30d" => Some(Range::Month),
            _ => None,
        }
    }

    /// Length of the range in seconds.
    pub fn seconds(self) -> u64 {
        match self {
            Range::Hour => 3_600,
            Range::Day => 86_400,
            Range::Week => 7 * 86_400,
            Range::Month => 30 * 86_400,
        }
    }
}

/// The set of tool ids a user executed since `since_epoch_s`.
///
/// Parses each row's `task_results` JSON array, accepting `tool_id` or
/// `tool` keys per entry. The result is an ordered set: the same query
/// against unchanged data always yields the same collection.
pub fn get_executed_tool_ids(
    db: &dyn DbClient,
    user_id: &str,
    since_epoch_s: u64,
) -> DbResult<BTreeSet<String>> {
    let rows = db.query(
        EXECUTION_TRACE_QUERY,
        &[
            SqlParam::Text(user_id.to_string()),
            SqlParam::Int(since_epoch_s as i64),
        ],
    )?;

    let mut tools = BTreeSet::new();
    for row in rows {
        let Some(results) = row.get("task_results") else {
            continue;
        };
        // Column may arrive as a JSON array or as serialized JSON text.
        let parsed: Value = match results {
            Value::String(text) => {
                serde_json::from_str(text).map_err(|e| DbError::MalformedRow {
                    table: "execution_trace",
                    message: format!("task_results is not JSON: {e}"),
                })?
            }
            other => other.clone(),
        };
        let Some(entries) = parsed.as_array() else {
            return Err(DbError::MalformedRow {
                table: "execution_trace",
                message: "task_results is not an array".into(),
            });
        };
        for entry in entries {
            let tool = entry
                .get("tool_id")
                .or_else(|| entry.get("tool"))
                .and_then(Value::as_str);
            if let Some(tool) = tool {
                tools.insert(tool.to_string());
            }
        }
    }
    Ok(tools)
}

/// Algorithm decisions since `since_epoch_s`, oldest first.
pub fn get_algorithm_decisions(
    db: &dyn DbClient,
    since_epoch_s: u64,
) -> DbResult<Vec<(String, u64)>> {
    let rows = db.query(
        ALGORITHM_TRACES_QUERY,
        &[SqlParam::Int(since_epoch_s as i64)],
    )?;
    rows.into_iter()
        .map(|row| {
            let decision = row
                .get("decision")
                .and_then(Value::as_str)
                .ok_or_else(|| DbError::MalformedRow {
                    table: "algorithm_traces",
                    message: "missing decision column".into(),
                })?
                .to_string();
            let timestamp = row
                .get("timestamp")
                .and_then(Value::as_u64)
                .ok_or_else(|| DbError::MalformedRow {
                    table: "algorithm_traces",
                    message: "missing timestamp column".into(),
                })?;
            Ok((decision, timestamp))
        })
        .collect()
}
