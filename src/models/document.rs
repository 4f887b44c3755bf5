//! Wire shape of a synchronized item.
//!
//! Every collection is exchanged as loosely shaped JSON objects carrying
//! at least `id` and `updatedAt`. `Document` pins those two down and keeps
//! the rest as an opaque body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::utils::time;

/// Identity field reserved by the backing store. Clients may not send it.
pub const RESERVED_ID_FIELD: &str = "_id";

/// Client-only bookkeeping field, stripped on the way in.
pub const SYNC_STATUS_FIELD: &str = "_syncStatus";

/// A collection item as exchanged over the sync protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Document {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub body: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            updated_at,
            body: Map::new(),
        }
    }

    /// Builder-style body field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    /// Parse an untyped JSON value into a document.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::try_from(map),
            other => Err(AppError::invalid_input(format!(
                "sync item must be an object, got {other}"
            ))),
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.into())
    }
}

impl TryFrom<Map<String, Value>> for Document {
    type Error = AppError;

    fn try_from(mut map: Map<String, Value>) -> Result<Self> {
        if map.contains_key(RESERVED_ID_FIELD) {
            return Err(AppError::invalid_input(format!(
                "item carries reserved field '{RESERVED_ID_FIELD}'"
            )));
        }

        let id = match map.remove("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            Some(_) => return Err(AppError::invalid_input("item 'id' must be a non-empty string")),
            None => return Err(AppError::invalid_input("item is missing 'id'")),
        };

        let updated_at = match map.remove("updatedAt") {
            Some(value) => time::from_json(&value)?,
            None => {
                return Err(AppError::invalid_input(format!(
                    "item '{id}' is missing 'updatedAt'"
                )));
            }
        };

        map.remove(SYNC_STATUS_FIELD);

        Ok(Self {
            id,
            updated_at,
            body: map,
        })
    }
}

impl From<Document> for Map<String, Value> {
    fn from(doc: Document) -> Self {
        let mut map = Map::with_capacity(doc.body.len() + 2);
        map.insert("id".into(), Value::String(doc.id));
        map.insert(
            "updatedAt".into(),
            Value::String(time::format_utc(&doc.updated_at)),
        );
        map.extend(doc.body);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_with_epoch_millis_renders_text() {
        let doc = Document::from_value(json!({
            "id": "sys-1",
            "updatedAt": 1_704_067_200_000_i64,
            "name": "Garage bank",
        }))
        .unwrap();

        assert_eq!(doc.field("name"), Some(&json!("Garage bank")));
        let out = serde_json::to_value(&doc).unwrap();
        assert_eq!(out["updatedAt"], json!("2024-01-01T00:00:00.000Z"));
        assert_eq!(out["id"], json!("sys-1"));
    }

    #[test]
    fn test_reserved_identity_field_rejected() {
        let err = Document::from_value(json!({
            "_id": "abc",
            "id": "r1",
            "updatedAt": "2024-01-01T00:00:00Z",
        }))
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn test_missing_required_fields_rejected() {
        assert!(Document::from_value(json!({"updatedAt": "2024-01-01T00:00:00Z"})).is_err());
        assert!(Document::from_value(json!({"id": "r1"})).is_err());
        assert!(Document::from_value(json!({"id": "", "updatedAt": 0})).is_err());
        assert!(Document::from_value(json!(["r1"])).is_err());
    }

    #[test]
    fn test_sync_status_is_stripped() {
        let doc = Document::from_value(json!({
            "id": "r1",
            "updatedAt": "2024-01-01T00:00:00Z",
            "_syncStatus": "pending",
        }))
        .unwrap();
        assert!(doc.body.is_empty());
    }
}
