//! Decodes user-supplied [`Change`]s into a normalized form the repository engine can
//! apply directly, and encodes the normalized set back for the commit log.
//!
//! JSON patches follow RFC 6902 (via the `json_patch` crate) plus a `test-absence(path)`
//! extension operation that fails if the pointer resolves to anything. Text patches use
//! unified diff, applied strictly line-by-line against the baseline text. JSON upserts
//! accept either a parsed tree or a string that must itself parse as JSON-5 (comments,
//! trailing commas, unquoted keys, single-quoted strings all accepted, via the `json5`
//! crate).

use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Change, ChangeContent, EntryContent};

/// A change with patches already resolved against a baseline, ready to be applied to a
/// tree and recorded in the commit log. The original change is retained for the log
/// (renames stay renames even though they are applied as remove+upsert).
#[derive(Debug, Clone)]
pub struct NormalizedChange {
    pub original: Change,
    pub effect: Effect,
}

#[derive(Debug, Clone)]
pub enum Effect {
    Upsert { path: String, content: EntryContent },
    Remove { path: String },
    /// A rename decomposes into a remove of the old path and an upsert at the new path,
    /// both applied atomically as one effect.
    Rename {
        from: String,
        to: String,
        content: EntryContent,
    },
}

/// Resolves `change` against the current `baseline` lookup (by absolute path) into a
/// [`NormalizedChange`]. `baseline` must return the current content of a path, or `None`
/// if the path does not currently exist.
pub fn normalize(
    change: Change,
    baseline: impl Fn(&str) -> Option<EntryContent>,
) -> Result<NormalizedChange> {
    match &change.content {
        ChangeContent::UpsertJson(json) => {
            let parsed = parse_json_upsert(json)?;
            let content = EntryContent::Json(parsed);
            Ok(NormalizedChange {
                effect: Effect::Upsert {
                    path: change.path.clone(),
                    content,
                },
                original: change,
            })
        }
        ChangeContent::UpsertText(text) => {
            let content = EntryContent::Text(text.clone());
            Ok(NormalizedChange {
                effect: Effect::Upsert {
                    path: change.path.clone(),
                    content,
                },
                original: change,
            })
        }
        ChangeContent::Remove => {
            if baseline(&change.path).is_none() {
                return Err(Error::ChangeConflict(format!(
                    "cannot remove non-existent path {}",
                    change.path
                )));
            }
            Ok(NormalizedChange {
                effect: Effect::Remove {
                    path: change.path.clone(),
                },
                original: change,
            })
        }
        ChangeContent::Rename(new_path) => {
            let current = baseline(&change.path).ok_or_else(|| {
                Error::ChangeConflict(format!("cannot rename non-existent path {}", change.path))
            })?;
            if baseline(new_path).is_some() {
                return Err(Error::ChangeConflict(format!(
                    "rename target {} already exists",
                    new_path
                )));
            }
            Ok(NormalizedChange {
                effect: Effect::Rename {
                    from: change.path.clone(),
                    to: new_path.clone(),
                    content: current,
                },
                original: change,
            })
        }
        ChangeContent::ApplyJsonPatch(patch_doc) => {
            let current = baseline(&change.path).ok_or_else(|| {
                Error::ChangeConflict(format!(
                    "cannot apply json patch to non-existent path {}",
                    change.path
                ))
            })?;
            let base_json = match &current {
                EntryContent::Json(v) | EntryContent::Yaml(v) => v.clone(),
                _ => {
                    return Err(Error::ChangeFormat(format!(
                        "{} is not a JSON file",
                        change.path
                    )))
                }
            };
            let patched = apply_json_patch(base_json, patch_doc)?;
            Ok(NormalizedChange {
                effect: Effect::Upsert {
                    path: change.path.clone(),
                    content: EntryContent::Json(patched),
                },
                original: change,
            })
        }
        ChangeContent::ApplyTextPatch(diff_text) => {
            let current = baseline(&change.path).ok_or_else(|| {
                Error::ChangeConflict(format!(
                    "cannot apply text patch to non-existent path {}",
                    change.path
                ))
            })?;
            let base_text = match &current {
                EntryContent::Text(t) => t.clone(),
                _ => {
                    return Err(Error::ChangeFormat(format!(
                        "{} is not a text file",
                        change.path
                    )))
                }
            };
            let patched = apply_unified_diff(&base_text, diff_text)?;
            Ok(NormalizedChange {
                effect: Effect::Upsert {
                    path: change.path.clone(),
                    content: EntryContent::Text(patched),
                },
                original: change,
            })
        }
    }
}

/// Parses a JSON upsert value supplied either as an already-parsed tree or as a string
/// that must itself parse as JSON-5 text.
pub fn parse_json_upsert(value: &Value) -> Result<Value> {
    match value {
        Value::String(s) => {
            json5::from_str(s).map_err(|e| Error::ChangeFormat(format!("invalid JSON: {e}")))
        }
        other => Ok(other.clone()),
    }
}

/// Extension over RFC 6902: `{"op": "testAbsence", "path": "/a/b"}` fails if the pointer
/// resolves to anything.
fn apply_json_patch(mut base: Value, patch_doc: &Value) -> Result<Value> {
    let ops = patch_doc
        .as_array()
        .ok_or_else(|| Error::ChangeFormat("json patch must be an array".to_string()))?;

    let mut rfc_ops = Vec::new();
    for op in ops {
        let op_name = op
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ChangeFormat("patch operation missing 'op'".to_string()))?;

        if op_name == "testAbsence" {
            // Flush any buffered RFC 6902 ops before evaluating the extension op so
            // ordering between mixed extension/standard ops is respected.
            if !rfc_ops.is_empty() {
                base = apply_rfc6902(base, std::mem::take(&mut rfc_ops))?;
            }
            let pointer = op
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::ChangeFormat("testAbsence missing 'path'".to_string()))?;
            if base.pointer(pointer).is_some() {
                return Err(Error::ChangeConflict(format!(
                    "test-absence failed: {pointer} exists"
                )));
            }
            continue;
        }
        rfc_ops.push(op.clone());
    }
    if !rfc_ops.is_empty() {
        base = apply_rfc6902(base, rfc_ops)?;
    }
    Ok(base)
}

fn apply_rfc6902(base: Value, ops: Vec<Value>) -> Result<Value> {
    let patch: json_patch::Patch = serde_json::from_value(Value::Array(ops))
        .map_err(|e| Error::ChangeFormat(format!("invalid json patch: {e}")))?;
    let mut doc = base;
    json_patch::patch(&mut doc, &patch)
        .map_err(|e| Error::ChangeConflict(format!("json patch failed to apply: {e}")))?;
    Ok(doc)
}

/// A single hunk of a unified diff.
struct Hunk {
    /// 0-based start line in the original file.
    orig_start: usize,
    lines: Vec<DiffLine>,
}

enum DiffLine {
    Context(String),
    Removed(String),
    Added(String),
}

/// Parses and strictly applies a unified diff against `base`. Every context/removed line
/// must match the baseline text exactly at the position the hunk header claims, or the
/// patch fails with `change-conflict`.
fn apply_unified_diff(base: &str, diff_text: &str) -> Result<String> {
    let hunks = parse_unified_diff(diff_text)?;
    let base_lines: Vec<&str> = base.lines().collect();
    let mut result: Vec<String> = Vec::new();
    let mut cursor = 0usize;

    for hunk in &hunks {
        if hunk.orig_start < cursor {
            return Err(Error::ChangeConflict(
                "text patch hunks are out of order".to_string(),
            ));
        }
        // Copy through any untouched lines before this hunk.
        result.extend(base_lines[cursor..hunk.orig_start].iter().map(|s| s.to_string()));
        cursor = hunk.orig_start;

        for line in &hunk.lines {
            match line {
                DiffLine::Context(text) => {
                    let actual = base_lines.get(cursor).ok_or_else(|| {
                        Error::ChangeConflict("text patch context extends past end of file".to_string())
                    })?;
                    if actual != text {
                        return Err(Error::ChangeConflict(format!(
                            "text patch context mismatch at line {}",
                            cursor + 1
                        )));
                    }
                    result.push(text.clone());
                    cursor += 1;
                }
                DiffLine::Removed(text) => {
                    let actual = base_lines.get(cursor).ok_or_else(|| {
                        Error::ChangeConflict("text patch removal extends past end of file".to_string())
                    })?;
                    if actual != text {
                        return Err(Error::ChangeConflict(format!(
                            "text patch removal mismatch at line {}",
                            cursor + 1
                        )));
                    }
                    cursor += 1;
                }
                DiffLine::Added(text) => {
                    result.push(text.clone());
                }
            }
        }
    }
    result.extend(base_lines[cursor..].iter().map(|s| s.to_string()));

    let mut joined = result.join("\n");
    if base.ends_with('\n') || base.is_empty() {
        joined.push('\n');
    }
    Ok(joined)
}

fn parse_unified_diff(diff_text: &str) -> Result<Vec<Hunk>> {
    let mut hunks = Vec::new();
    let mut lines = diff_text.lines().peekable();

    while let Some(line) = lines.peek() {
        if line.starts_with("--- ") || line.starts_with("+++ ") {
            lines.next();
            continue;
        }
        if line.starts_with("@@") {
            let header = lines.next().unwrap();
            let orig_start = parse_hunk_header(header)?;
            let mut body = Vec::new();
            while let Some(l) = lines.peek() {
                if l.starts_with("@@") || l.starts_with("--- ") {
                    break;
                }
                let l = lines.next().unwrap();
                if let Some(rest) = l.strip_prefix(' ') {
                    body.push(DiffLine::Context(rest.to_string()));
                } else if let Some(rest) = l.strip_prefix('-') {
                    body.push(DiffLine::Removed(rest.to_string()));
                } else if let Some(rest) = l.strip_prefix('+') {
                    body.push(DiffLine::Added(rest.to_string()));
                } else if l.is_empty() {
                    body.push(DiffLine::Context(String::new()));
                } else {
                    return Err(Error::ChangeFormat(format!(
                        "malformed unified diff line: {l}"
                    )));
                }
            }
            hunks.push(Hunk {
                orig_start,
                lines: body,
            });
        } else {
            return Err(Error::ChangeFormat(format!(
                "unexpected unified diff line: {line}"
            )));
        }
    }
    Ok(hunks)
}

/// Parses `@@ -l,s +l,s @@` and returns the 0-based original start line.
fn parse_hunk_header(header: &str) -> Result<usize> {
    let body = header
        .trim_start_matches('@')
        .trim_end_matches('@')
        .trim();
    let orig = body
        .split_whitespace()
        .next()
        .and_then(|s| s.strip_prefix('-'))
        .ok_or_else(|| Error::ChangeFormat(format!("malformed hunk header: {header}")))?;
    let line_no: usize = orig
        .split(',')
        .next()
        .unwrap()
        .parse()
        .map_err(|_| Error::ChangeFormat(format!("malformed hunk header: {header}")))?;
    Ok(line_no.saturating_sub(1))
}
