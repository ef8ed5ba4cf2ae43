//! Input/Output data-flow transforms.
//!
//! Three projection points control what data a state sees, produces, and
//! passes onward: `InputPath` scopes the state's view of its input,
//! `ResultPath` nests the state's raw result back into the input, and
//! `OutputPath` filters what the next state receives.  All three are pure
//! functions over `serde_json::Value`.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::PathError;

// ---------------------------------------------------------------------------
// PathSpec
// ---------------------------------------------------------------------------

/// One `InputPath` / `ResultPath` / `OutputPath` field.
///
/// The Amazon States Language distinguishes an *absent* path (defaults to
/// `"$"`, the whole value) from an explicit `null` (discard semantics), so a
/// plain `Option<String>` is not enough.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PathSpec {
    /// Field absent, or explicitly `"$"` — the whole value passes through.
    #[default]
    Identity,
    /// Field explicitly `null`.
    Discard,
    /// A projection path such as `"$.order.items[0]"`.
    Path(String),
}

impl PathSpec {
    pub fn from_raw(raw: Option<String>) -> Self {
        match raw {
            None => PathSpec::Discard,
            Some(s) if s == "$" => PathSpec::Identity,
            Some(s) => PathSpec::Path(s),
        }
    }
}

impl<'de> Deserialize<'de> for PathSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // `null` deserializes to `None` and means discard; serde's field
        // default covers the absent case with `Identity`.
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(Self::from_raw(raw))
    }
}

// ---------------------------------------------------------------------------
// Path parsing & resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn malformed(path: &str, detail: impl Into<String>) -> PathError {
    PathError::Malformed {
        path: path.to_owned(),
        detail: detail.into(),
    }
}

/// Parse the supported JSON-path subset: `$`, `.key`, `["key"]`, `['key']`,
/// `[index]`.
fn parse_path(path: &str) -> Result<Vec<Segment>, PathError> {
    let mut rest = path
        .strip_prefix('$')
        .ok_or_else(|| malformed(path, "must start with '$'"))?;

    let mut segments = Vec::new();
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix('.') {
            let end = r.find(['.', '[']).unwrap_or(r.len());
            let key = &r[..end];
            if key.is_empty() {
                return Err(malformed(path, "empty key segment"));
            }
            segments.push(Segment::Key(key.to_owned()));
            rest = &r[end..];
        } else if let Some(r) = rest.strip_prefix('[') {
            let close = r
                .find(']')
                .ok_or_else(|| malformed(path, "unterminated '['"))?;
            let token = &r[..close];
            let segment = if let Some(key) = token
                .strip_prefix('\'')
                .and_then(|t| t.strip_suffix('\''))
                .or_else(|| token.strip_prefix('"').and_then(|t| t.strip_suffix('"')))
            {
                Segment::Key(key.to_owned())
            } else {
                let index = token
                    .parse::<usize>()
                    .map_err(|_| malformed(path, format!("bad bracket segment '[{token}]'")))?;
                Segment::Index(index)
            };
            segments.push(segment);
            rest = &r[close + 1..];
        } else {
            return Err(malformed(path, format!("unexpected '{rest}'")));
        }
    }

    Ok(segments)
}

/// Resolve `path` against `data`, returning the first (and in this subset,
/// only) match.
pub fn resolve<'a>(data: &'a Value, path: &str) -> Result<&'a Value, PathError> {
    let mut current = data;
    for segment in &parse_path(path)? {
        current = match segment {
            Segment::Key(key) => current.get(key.as_str()),
            Segment::Index(index) => current.get(*index),
        }
        .ok_or_else(|| PathError::NoMatch {
            path: path.to_owned(),
        })?;
    }
    Ok(current)
}

// ---------------------------------------------------------------------------
// The three transforms
// ---------------------------------------------------------------------------

/// Scope the state's input.  `null` discards it entirely (the state sees
/// `{}`), the default `"$"` passes it through unchanged.
pub fn apply_input_path(data: &Value, spec: &PathSpec) -> Result<Value, PathError> {
    match spec {
        PathSpec::Identity => Ok(data.clone()),
        PathSpec::Discard => Ok(Value::Object(Map::new())),
        PathSpec::Path(path) => resolve(data, path).cloned(),
    }
}

/// Filter the state's output.  Same null/default semantics as `InputPath`.
pub fn apply_output_path(data: &Value, spec: &PathSpec) -> Result<Value, PathError> {
    match spec {
        PathSpec::Identity => Ok(data.clone()),
        PathSpec::Discard => Ok(Value::Object(Map::new())),
        PathSpec::Path(path) => resolve(data, path).cloned(),
    }
}

/// Nest the state's raw result into its original input.
///
/// With the default `"$"` the result replaces the whole value.  With a
/// concrete path, the result is grafted onto the input at that location,
/// creating intermediate objects as needed and leaving sibling data
/// untouched.  An explicit `null` drops the result and keeps the input.
pub fn apply_result_path(
    input: &Value,
    spec: &PathSpec,
    result: Value,
) -> Result<Value, PathError> {
    match spec {
        PathSpec::Identity => Ok(result),
        PathSpec::Discard => Ok(input.clone()),
        PathSpec::Path(path) => {
            let segments = parse_path(path)?;
            let mut combined = input.clone();
            graft(&mut combined, &segments, result);
            Ok(combined)
        }
    }
}

/// Write `payload` at `segments` inside `target`, growing structure on the
/// way down.  A non-object/non-array intermediate is replaced, the rest of
/// the tree is preserved.
fn graft(target: &mut Value, segments: &[Segment], payload: Value) {
    match segments.split_first() {
        None => *target = payload,
        Some((Segment::Key(key), rest)) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(map) = target {
                graft(map.entry(key.clone()).or_insert(Value::Null), rest, payload);
            }
        }
        Some((Segment::Index(index), rest)) => {
            if !target.is_array() {
                *target = Value::Array(Vec::new());
            }
            if let Value::Array(items) = target {
                while items.len() <= *index {
                    items.push(Value::Null);
                }
                graft(&mut items[*index], rest, payload);
            }
        }
    }
}
