//! Record extraction
//!
//! Pulls the record list out of a response body by walking a declared
//! field path (`list`, `records`, `items[0].children`). The same path
//! syntax is used for cursor fields and pagination token lookups.

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::http::transport::HttpResponse;

/// Walk a dotted field path with optional `[idx]` array indexing.
/// An empty path returns the value itself.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        let (field, indices) = split_indices(segment)?;
        if !field.is_empty() {
            current = current.as_object()?.get(field)?;
        }
        for idx in indices {
            current = current.as_array()?.get(idx)?;
        }
    }
    Some(current)
}

/// Split `items[0][1]` into `("items", [0, 1])`
fn split_indices(segment: &str) -> Option<(&str, Vec<usize>)> {
    match segment.find('[') {
        None => Some((segment, Vec::new())),
        Some(pos) => {
            let field = &segment[..pos];
            let mut indices = Vec::new();
            for part in segment[pos..].split('[').skip(1) {
                let inner = part.strip_suffix(']')?;
                indices.push(inner.parse().ok()?);
            }
            Some((field, indices))
        }
    }
}

/// Extract the records of one page.
///
/// The path's terminal value may be an array (the usual case), a single
/// object (yielded as one record), or null/absent (an empty page).
/// A malformed JSON body is an extraction error.
pub fn extract_records(response: &HttpResponse, record_path: &str) -> Result<Vec<Value>> {
    let body = response.json()?;

    let target = match lookup_path(&body, record_path) {
        Some(value) => value,
        None => return Ok(Vec::new()),
    };

    match target {
        Value::Array(items) => Ok(items.clone()),
        Value::Null => Ok(Vec::new()),
        Value::Object(_) => Ok(vec![target.clone()]),
        other => Err(EngineError::extract(format!(
            "record path {record_path:?} resolved to a scalar: {other}"
        ))),
    }
}
