//! Deletion markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Collection;
use crate::utils::time;

/// Durable record that a document was deleted.
///
/// Kept until every client has had the chance to pull it, then
/// garbage-collected by retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub record_id: String,
    pub collection: Collection,
    #[serde(with = "time::flexible")]
    pub deleted_at: DateTime<Utc>,
}
