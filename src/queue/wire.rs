//! Batch endpoint wire format.
//!
//! Request body: a JSON array of [`BatchPayloadItem`], ids starting at 1 in batch order.
//! Response body: `{"data": [item, ...]}` with one entry per payload item, matched by
//! position. An entry carrying `error` fails its request; one carrying `data` resolves
//! with that value; anything else resolves as itself.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::QueueError;

/// Header set on every batch call so the server can tell batches from plain requests.
pub const BATCH_MARKER_HEADER: &str = "x-batch-request";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchPayloadItem {
    pub id: usize,
    /// Origin-relative path, query and fragment.
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Per-item outcome: the resolved value or the remote error message.
pub type ItemResult = Result<Value, String>;

/// Decode a batch response body into per-item outcomes.
pub fn decode_batch_response(body: &[u8], batch_id: &str) -> Result<Vec<ItemResult>, QueueError> {
    let malformed = |reason: String| QueueError::BatchProcessing {
        batch_id: batch_id.to_string(),
        reason,
    };

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| malformed(format!("response is not valid JSON: {e}")))?;
    let data = value
        .as_object()
        .and_then(|obj| obj.get("data"))
        .ok_or_else(|| malformed("response has no data property".to_string()))?;
    let Value::Array(items) = data else {
        return Err(malformed("response data is not an array".to_string()));
    };

    Ok(items.iter().map(decode_item).collect())
}

fn decode_item(item: &Value) -> ItemResult {
    let Some(obj) = item.as_object() else {
        return Ok(item.clone());
    };
    match obj.get("error") {
        Some(Value::Null) | None => {}
        Some(Value::String(message)) => return Err(message.clone()),
        Some(other) => return Err(other.to_string()),
    }
    match obj.get("data") {
        Some(data) => Ok(data.clone()),
        None => Ok(item.clone()),
    }
}
