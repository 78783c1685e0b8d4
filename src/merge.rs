//! Combines several files into one JSON tree: fetch sources, deep-merge left to right,
//! optionally run JSON path expressions over the merged result.
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Entry, EntryContent, Revision};

/// One input to a merge: a path plus whether its absence is tolerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSource {
    pub path: String,
    pub required: bool,
}

impl MergeSource {
    pub fn required(path: impl Into<String>) -> Self {
        MergeSource {
            path: path.into(),
            required: true,
        }
    }

    pub fn optional(path: impl Into<String>) -> Self {
        MergeSource {
            path: path.into(),
            required: false,
        }
    }
}

/// A merge request: the sources to combine, in priority order (later sources win on
/// conflicting scalar keys), plus JSON path expressions applied to the merged result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeQuery {
    pub sources: Vec<MergeSource>,
    pub json_paths: Vec<String>,
}

impl MergeQuery {
    pub fn new(sources: Vec<MergeSource>) -> Self {
        MergeQuery {
            sources,
            json_paths: Vec::new(),
        }
    }

    pub fn with_json_paths(mut self, json_paths: Vec<String>) -> Self {
        self.json_paths = json_paths;
        self
    }
}

/// Result of a merge: the combined value, the revision it was computed at, the paths
/// that actually contributed (required sources plus any optional source that was
/// present), and whether every contributing source was YAML-sourced (in which case the
/// result is presented as YAML too — see DESIGN.md's resolution of the merge
/// output-type open question).
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEntry {
    pub value: Value,
    pub revision: Revision,
    pub contributing_paths: Vec<String>,
    pub all_yaml: bool,
}

/// Merges `query.sources` as read through `fetch`, a caller-provided accessor over a
/// single fixed revision (so this module stays independent of how entries are stored).
pub fn merge(
    query: MergeQuery,
    fetch: impl Fn(&str) -> Result<Option<Entry>>,
) -> Result<MergedEntry> {
    if query.sources.is_empty() {
        return Err(Error::InvalidPush("merge requires at least one source".to_string()));
    }

    let mut contributions: Vec<(String, Value, bool)> = Vec::new();
    for source in &query.sources {
        match fetch(&source.path)? {
            Some(entry) => {
                let (value, is_yaml) = as_json_value(&entry)?;
                contributions.push((source.path.clone(), value, is_yaml));
            }
            None if source.required => {
                return Err(Error::EntryNotFound(source.path.clone()));
            }
            None => continue,
        }
    }

    if contributions.is_empty() {
        return Err(Error::EntryNotFound(
            query
                .sources
                .iter()
                .map(|s| s.path.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        ));
    }

    let all_yaml = contributions.iter().all(|(_, _, is_yaml)| *is_yaml);
    let contributing_paths = contributions.iter().map(|(p, _, _)| p.clone()).collect();
    let mut merged = Value::Null;
    for (_, value, _) in contributions {
        merged = deep_merge(merged, value)?;
    }

    for expr in &query.json_paths {
        merged = apply_json_path(&merged, expr)?;
    }

    Ok(MergedEntry {
        value: merged,
        revision: Revision::from(0),
        contributing_paths,
        all_yaml,
    })
}

fn as_json_value(entry: &Entry) -> Result<(Value, bool)> {
    match &entry.content {
        EntryContent::Json(v) => Ok((v.clone(), false)),
        EntryContent::Yaml(v) => Ok((v.clone(), true)),
        EntryContent::Text(_) | EntryContent::Directory => Err(Error::ChangeFormat(format!(
            "{} is not a JSON or YAML file and cannot be merged",
            entry.path
        ))),
    }
}

/// Deep-merges `overlay` onto `base`: objects merge key by key (recursively), arrays and
/// scalars are replaced wholesale by the overlay. Merging values of different JSON types
/// at the same key is a `query-execution` failure (spec.md §4.5/§7) — a conflict a caller
/// must resolve by restructuring sources, not something this merge can paper over.
fn deep_merge(base: Value, overlay: Value) -> Result<Value> {
    match (base, overlay) {
        (Value::Null, overlay) => Ok(overlay),
        (base, Value::Null) => Ok(base),
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                let merged = match base_map.remove(&k) {
                    Some(existing) => deep_merge(existing, v)?,
                    None => v,
                };
                base_map.insert(k, merged);
            }
            Ok(Value::Object(base_map))
        }
        (base, overlay) => {
            if std::mem::discriminant(&base) != std::mem::discriminant(&overlay) {
                return Err(Error::QueryExecution(format!(
                    "merge type mismatch: cannot merge {} into {}",
                    type_name(&overlay),
                    type_name(&base)
                )));
            }
            Ok(overlay)
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

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
