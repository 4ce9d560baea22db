//! Bulk file metadata: an open string-keyed JSON object.
//!
//! Peers are free to send any keys; the ones this crate understands are
//! `filename`, `mimeType`, `charset` and `size`. Everything else is kept
//! and passed through to the storage collaborator untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TunnelError;

pub const KEY_FILENAME: &str = "filename";
pub const KEY_MIME_TYPE: &str = "mimeType";
pub const KEY_CHARSET: &str = "charset";
pub const KEY_SIZE: &str = "size";

/// Metadata attached to one transferred file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BulkFileMetadata(Map<String, Value>);

impl BulkFileMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a metadata block. Anything but a JSON object is rejected.
    pub fn parse(text: &str) -> Result<Self, TunnelError> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(TunnelError::MetadataParse(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(TunnelError::MetadataParse(e.to_string())),
        }
    }

    /// Compact JSON rendering, as sent on the wire.
    pub fn to_json(&self) -> Result<String, TunnelError> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn filename(&self) -> Option<&str> {
        self.get(KEY_FILENAME).and_then(Value::as_str)
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.get(KEY_MIME_TYPE).and_then(Value::as_str)
    }

    pub fn charset(&self) -> Option<&str> {
        self.get(KEY_CHARSET).and_then(Value::as_str)
    }

    /// Declared size in bytes. Accepts a JSON number or a decimal string.
    pub fn size(&self) -> Option<u64> {
        match self.get(KEY_SIZE)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Fill in `mimeType` and `charset` when the peer left them out.
    ///
    /// The mime type is guessed from the filename extension; text types
    /// default to UTF-8. Values the peer sent are never replaced.
    pub fn backfill_inferred(&mut self) {
        if self.mime_type().is_none() {
            let guess = self
                .filename()
                .and_then(|name| mime_guess::from_path(name).first());
            if let Some(mime) = guess {
                self.insert(KEY_MIME_TYPE, mime.essence_str());
            }
        }
        if self.charset().is_none() && self.mime_type().is_some_and(|m| m.starts_with("text/")) {
            self.insert(KEY_CHARSET, "utf-8");
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
