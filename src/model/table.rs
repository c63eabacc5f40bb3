use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::common::{generate_uid, Id, Uid};

/// One concrete version of a logical table.
///
/// `id` is the renameable logical name, `version_id` identifies this clone,
/// `created_id` is the lineage marker shared by every version and rename of
/// the same logical table. A version turns `readonly` only when it is sealed
/// into a committed head revision; from then on it is structurally shared by
/// descendant revisions until a mutation forces a clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableVersion {
    pub version_id: Uid,
    pub id: Id,
    pub created_id: Uid,
    pub readonly: bool,
    /// System tables are invisible to regular listing.
    pub system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TableVersion {
    pub fn new(id: Id, system: bool) -> Self {
        let now = Utc::now();
        Self {
            version_id: generate_uid(),
            id,
            created_id: generate_uid(),
            readonly: false,
            system,
            created_at: now,
            updated_at: now,
        }
    }

    /// A mutable clone of `self`: fresh `version_id`, same logical `id` and
    /// `created_id`. Associations are carried over by the caller.
    pub fn clone_version(&self) -> Self {
        Self {
            version_id: generate_uid(),
            id: self.id.clone(),
            created_id: self.created_id.clone(),
            readonly: false,
            system: self.system,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_keeps_lineage_and_resets_readonly() {
        let mut original = TableVersion::new("products".into(), false);
        original.readonly = true;
        let clone = original.clone_version();
        assert_ne!(clone.version_id, original.version_id);
        assert_eq!(clone.id, original.id);
        assert_eq!(clone.created_id, original.created_id);
        assert!(!clone.readonly);
    }
}
