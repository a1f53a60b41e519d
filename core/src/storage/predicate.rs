//! Row filters: free-form predicates and structured field filters.
//!
//! The predicate language is SQLite's scalar boolean-expression grammar over
//! the `flows` columns. Statement separators are refused outright; whatever
//! remains must compile to a read-only statement and run once under
//! `SELECT 1 ... LIMIT 1` before it is spliced into a real query.

use rusqlite::types::Value;
use rusqlite::Connection;

use crate::error::{CoreError, CoreResult};
use crate::models::{FieldFilter, FlowFilter};

const STATEMENT_SEPARATOR: char = ';';

/// Cheap syntactic gate, applied before any storage access.
pub(crate) fn reject_separator(predicate: &str) -> CoreResult<()> {
    if predicate.contains(STATEMENT_SEPARATOR) {
        tracing::debug!("Rejected predicate containing a statement separator");
        return Err(CoreError::invalid_query(
            predicate,
            "statement separators are not allowed",
        ));
    }
    Ok(())
}

/// Trimmed predicate, or `None` when blank.
pub(crate) fn normalize_predicate(predicate: Option<&str>) -> Option<String> {
    predicate
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

/// Compile and execute the predicate once against a one-row trial query.
pub(crate) fn validate_predicate(conn: &Connection, predicate: &str) -> CoreResult<()> {
    reject_separator(predicate)?;

    let trial = format!("SELECT 1 FROM flows WHERE ({predicate}) LIMIT 1");
    let mut stmt = conn
        .prepare(&trial)
        .map_err(|e| CoreError::invalid_query(predicate, e))?;
    if !stmt.readonly() {
        return Err(CoreError::invalid_query(
            predicate,
            "predicate must be a read-only expression",
        ));
    }
    stmt.exists([])
        .map_err(|e| CoreError::invalid_query(predicate, e))?;
    Ok(())
}

/// WHERE clause text plus its positional parameters.
#[derive(Debug, Default)]
pub(crate) struct WhereClause {
    conditions: Vec<String>,
    pub params: Vec<Value>,
}

impl WhereClause {
    /// Predicate must already have passed [`validate_predicate`].
    pub fn build(filter: &FlowFilter) -> Self {
        let mut clause = Self::default();
        if let Some(predicate) = normalize_predicate(filter.predicate.as_deref()) {
            clause.conditions.push(format!("({predicate})"));
        }
        clause.add_fields(&filter.fields);
        clause
    }

    pub fn sql(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.conditions.join(" AND "))
        }
    }

    fn add_fields(&mut self, fields: &FieldFilter) {
        if let Some(q) = non_blank(&fields.q) {
            self.conditions
                .push("(url LIKE ? OR req_preview LIKE ? OR resp_preview LIKE ?)".to_string());
            let like = like_pattern(q);
            for _ in 0..3 {
                self.params.push(Value::from(like.clone()));
            }
        }
        if let Some(host) = non_blank(&fields.host) {
            self.push("host = ?", Value::from(host.to_string()));
        }
        if let Some(method) = non_blank(&fields.method) {
            self.push("method = ?", Value::from(method.to_ascii_uppercase()));
        }
        if let Some(status) = fields.status {
            self.push("status = ?", Value::from(status as i64));
        }
        if let Some(needle) = non_blank(&fields.url_contains) {
            self.push("url LIKE ?", Value::from(like_pattern(needle)));
        }
        if let Some(needle) = non_blank(&fields.body_contains) {
            self.conditions
                .push("(req_preview LIKE ? OR resp_body_text LIKE ?)".to_string());
            let like = like_pattern(needle);
            self.params.push(Value::from(like.clone()));
            self.params.push(Value::from(like));
        }
        if let Some(min) = fields.duration_min {
            self.push("duration IS NOT NULL AND duration >= ?", Value::from(min));
        }
        if let Some(max) = fields.duration_max {
            self.push("duration IS NOT NULL AND duration <= ?", Value::from(max));
        }
        if let Some(min) = fields.resp_size_min {
            self.push("resp_size >= ?", Value::from(min as i64));
        }
        if let Some(max) = fields.resp_size_max {
            self.push("resp_size <= ?", Value::from(max as i64));
        }
    }

    fn push(&mut self, condition: &str, param: Value) {
        self.conditions.push(format!("({condition})"));
        self.params.push(param);
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn like_pattern(needle: &str) -> String {
    format!("%{needle}%")
}
