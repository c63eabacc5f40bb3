use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::common::{content_hash, generate_uid, Id, Uid};

/// One concrete version of a logical row.
///
/// Identified the same triple way as tables (`id` / `version_id` /
/// `created_id`). A row version belongs to one or more table versions at
/// once: clones of a table re-attach the same row versions until a row-level
/// mutation clones the row itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowVersion {
    pub version_id: Uid,
    pub id: Id,
    pub created_id: Uid,
    pub readonly: bool,
    /// Arbitrary JSON conforming to the owning table's schema.
    pub data: Value,
    /// Opaque caller-managed metadata.
    pub meta: Value,
    /// Content hash of `data`, for change detection.
    pub hash: String,
    /// Hash of the schema version `data` was validated against.
    pub schema_hash: String,
    /// Derived from schema-declared publish-date leaves, first non-empty wins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RowVersion {
    pub fn new(id: Id, data: Value, schema_hash: String) -> Self {
        let now = Utc::now();
        let hash = content_hash(&data);
        Self {
            version_id: generate_uid(),
            id,
            created_id: generate_uid(),
            readonly: false,
            data,
            meta: Value::Null,
            hash,
            schema_hash,
            published_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A mutable clone of `self`: fresh `version_id`, same logical `id` and
    /// `created_id`, identical content.
    pub fn clone_version(&self) -> Self {
        Self {
            version_id: generate_uid(),
            id: self.id.clone(),
            created_id: self.created_id.clone(),
            readonly: false,
            data: self.data.clone(),
            meta: self.meta.clone(),
            hash: self.hash.clone(),
            schema_hash: self.schema_hash.clone(),
            published_at: self.published_at,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    /// Overwrite `data`, recomputing the content hash.
    pub fn set_data(&mut self, data: Value, schema_hash: String) {
        self.hash = content_hash(&data);
        self.data = data;
        self.schema_hash = schema_hash;
        self.updated_at = Utc::now();
    }
}
