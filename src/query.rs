//! Evaluates [`Query`]s over an [`Entry`]'s content: identity, text-view, JSON-path, and
//! JSON-as-value (accepting real JSON-5 syntax — comments, trailing commas, unquoted
//! keys, single-quoted strings — and plain YAML as a fallback).
//!
//! Queries are pure functions of `(revision, query)`: the same entry content and query
//! always yield byte-identical output, independent of when the query runs.
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Entry, EntryContent, Query, QueryType};

/// Runs `query` against `entry`, returning a new entry holding the query's result (same
/// revision and path, transformed content).
pub fn run(entry: &Entry, query: &Query) -> Result<Entry> {
    let content = match &query.r#type {
        QueryType::Identity => entry.content.clone(),
        QueryType::OfText => EntryContent::Text(of_text(&entry.content)?),
        QueryType::OfJson => EntryContent::Json(of_json(&entry.content)?),
        QueryType::JsonPath(exprs) => {
            let mut value = of_json(&entry.content)?;
            for expr in exprs {
                value = apply_json_path(&value, expr)?;
            }
            EntryContent::Json(value)
        }
    };
    Ok(Entry {
        path: entry.path.clone(),
        content,
        revision: entry.revision,
    })
}

fn of_text(content: &EntryContent) -> Result<String> {
    match content {
        EntryContent::Text(t) => Ok(t.clone()),
        EntryContent::Json(v) => serde_json::to_string_pretty(v)
            .map_err(|e| Error::QueryExecution(format!("failed to serialize JSON: {e}"))),
        EntryContent::Yaml(v) => serde_json::to_string_pretty(v)
            .map_err(|e| Error::QueryExecution(format!("failed to serialize YAML tree: {e}"))),
        EntryContent::Directory => Err(Error::QueryExecution(
            "cannot view a directory as text".to_string(),
        )),
    }
}

fn of_json(content: &EntryContent) -> Result<Value> {
    match content {
        EntryContent::Json(v) | EntryContent::Yaml(v) => Ok(v.clone()),
        EntryContent::Text(t) => json5::from_str(t).or_else(|json5_err| {
            serde_yaml::from_str(t).map_err(|yaml_err| {
                Error::QueryExecution(format!(
                    "failed to parse as JSON-5 ({json5_err}) or YAML ({yaml_err})"
                ))
            })
        }),
        EntryContent::Directory => Err(Error::QueryExecution(
            "cannot view a directory as JSON".to_string(),
        )),
    }
}

/// Applies a single JSON path expression. Missing nodes are a `query-execution` error;
/// an expression that yields more than one node returns a JSON array of the matches so
/// chained expressions still have a single value to operate on.
fn apply_json_path(value: &Value, expr: &str) -> Result<Value> {
    let path = serde_json_path::JsonPath::parse(expr)
        .map_err(|e| Error::QueryExecution(format!("invalid JSON path '{expr}': {e}")))?;
    let found = path.query(value);
    let nodes: Vec<Value> = found.all().into_iter().cloned().collect();
    match nodes.len() {
        0 => Err(Error::QueryExecution(format!(
            "JSON path '{expr}' matched no nodes"
        ))),
        1 => Ok(nodes.into_iter().next().unwrap()),
        _ => Ok(Value::Array(nodes)),
    }
}
