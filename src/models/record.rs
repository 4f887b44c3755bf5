//! Extraction record data structure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::models::{ContentHash, Document};
use crate::utils::time;

/// Upper bound of `validation_score`.
pub const MAX_VALIDATION_SCORE: u8 = 100;

/// Raw field map returned by the extractor.
pub type FieldMap = Map<String, Value>;

/// A single extraction result, identified for dedup by its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Opaque identifier, stable across upgrades
    pub id: String,

    /// Digest of the source image
    pub content_hash: ContentHash,

    /// Battery system this reading belongs to, resolved separately
    #[serde(default)]
    pub system_id: Option<String>,

    /// When the reading was taken
    #[serde(with = "time::flexible")]
    pub timestamp: DateTime<Utc>,

    /// Original upload file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    /// Raw extracted telemetry
    pub extracted_fields: FieldMap,

    /// Quality score of the kept extraction (0-100)
    pub validation_score: u8,

    /// Set when no attempt reached the acceptance threshold
    pub needs_review: bool,

    /// Total extraction attempts spent on this record
    pub extraction_attempts: u32,

    /// Server-assigned modification time
    #[serde(with = "time::flexible")]
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Convert into the sync wire shape.
    pub fn to_document(&self) -> Result<Document> {
        Document::from_value(serde_json::to_value(self)?)
    }

    /// Rebuild a typed record from a stored document.
    pub fn from_document(doc: &Document) -> Result<Self> {
        serde_json::from_value(doc.clone().into_value()).map_err(|e| {
            AppError::validation(format!("document '{}' is not a record: {e}", doc.id))
        })
    }
}

/// Client-side synchronization state of a cached row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Changed locally, not yet confirmed by the server
    Pending,
    /// Matches the server copy as of the last pull or push
    Synced,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> Record {
        Record {
            id: "rec-1".into(),
            content_hash: ContentHash::parse(&"ab".repeat(32)).unwrap(),
            system_id: Some("sys-1".into()),
            timestamp: time::parse_utc("2024-05-01T10:00:00Z").unwrap(),
            file_name: Some("bms.png".into()),
            extracted_fields: json!({"stateOfCharge": 87.5, "current": -12.1})
                .as_object()
                .cloned()
                .unwrap(),
            validation_score: 95,
            needs_review: false,
            extraction_attempts: 1,
            updated_at: time::parse_utc("2024-05-01T10:00:01Z").unwrap(),
        }
    }

    #[test]
    fn test_document_conversion_keeps_identity() {
        let record = sample_record();
        let doc = record.to_document().unwrap();

        assert_eq!(doc.id, "rec-1");
        assert_eq!(doc.updated_at, record.updated_at);
        assert_eq!(doc.field("contentHash"), Some(&json!("ab".repeat(32))));
        assert_eq!(Record::from_document(&doc).unwrap(), record);
    }

    #[test]
    fn test_camel_case_wire_names() {
        let value = serde_json::to_value(sample_record()).unwrap();
        assert!(value.get("validationScore").is_some());
        assert!(value.get("extractionAttempts").is_some());
        assert_eq!(value["updatedAt"], json!("2024-05-01T10:00:01.000Z"));
    }

    #[test]
    fn test_foreign_document_is_not_a_record() {
        let doc = Document::new("sys-1", Utc::now()).with_field("name", "Shed");
        assert!(Record::from_document(&doc).is_err());
    }
}
