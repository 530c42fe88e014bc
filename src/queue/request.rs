use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::QueueError;

/// A logical HTTP request submitted to the queue.
///
/// Header names are stored lowercase. The URL may be origin-relative (`/posts?page=2`)
/// or absolute on the queue's origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    method: String,
    url: String,
    headers: BTreeMap<String, String>,
    body: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new("PUT", url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new("DELETE", url)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Raw text body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// JSON body; also sets `content-type: application/json`.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let encoded = serde_json::to_string(value)?;
        Ok(self.header("content-type", "application/json").body(encoded))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body_text(&self) -> Option<&str> {
        self.body.as_deref()
    }

    fn is_json(&self) -> bool {
        self.headers
            .get("content-type")
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"))
    }

    /// Body as it travels in the batch payload: parsed JSON for JSON requests, a string
    /// otherwise. Empty bodies are omitted.
    pub(crate) fn payload_body(&self) -> Result<Option<Value>, QueueError> {
        let Some(text) = self.body.as_deref().filter(|b| !b.is_empty()) else {
            return Ok(None);
        };
        if self.is_json() {
            serde_json::from_str(text).map(Some).map_err(|e| QueueError::InvalidRequest {
                reason: format!("body of {} {} is not valid JSON: {e}", self.method, self.url),
            })
        } else {
            Ok(Some(Value::String(text.to_string())))
        }
    }
}
