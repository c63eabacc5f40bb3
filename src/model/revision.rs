use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::common::{generate_uid, Uid};

/// A snapshot of a table set within a branch.
///
/// Exactly one revision per branch is the mutable draft and at most one is
/// the head (the last committed, immutable snapshot). `is_start` marks the
/// revision created when the branch was forked; only start revisions of the
/// project's very first branch may lack a parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: Uid,
    pub branch_id: Uid,
    pub parent_id: Option<Uid>,
    pub is_head: bool,
    pub is_draft: bool,
    pub is_start: bool,
    pub has_changes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Revision {
    /// The head revision created when a branch is forked (or bootstrapped).
    pub fn new_start(branch_id: Uid, parent_id: Option<Uid>) -> Self {
        Self {
            id: generate_uid(),
            branch_id,
            parent_id,
            is_head: true,
            is_draft: false,
            is_start: true,
            has_changes: false,
            comment: None,
            created_at: Utc::now(),
        }
    }

    /// A fresh mutable draft chained off `parent_id`.
    pub fn new_draft(branch_id: Uid, parent_id: Uid) -> Self {
        Self {
            id: generate_uid(),
            branch_id,
            parent_id: Some(parent_id),
            is_head: false,
            is_draft: true,
            is_start: false,
            has_changes: false,
            comment: None,
            created_at: Utc::now(),
        }
    }
}
