use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::common::{generate_uid, Uid, ROOT_BRANCH_NAME};

/// An independent line of revision history within a project.
///
/// Branch names are unique per project case-insensitively. Exactly one
/// branch per project carries `is_root`; it is created together with the
/// project and can never be deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Uid,
    pub project_id: Uid,
    pub name: String,
    pub is_root: bool,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn new_root(project_id: Uid) -> Self {
        Self {
            id: generate_uid(),
            project_id,
            name: ROOT_BRANCH_NAME.to_string(),
            is_root: true,
            created_at: Utc::now(),
        }
    }

    pub fn new(project_id: Uid, name: String) -> Self {
        Self {
            id: generate_uid(),
            project_id,
            name,
            is_root: false,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_branch_gets_the_reserved_name() {
        let branch = Branch::new_root("proj-1".to_string());
        assert!(branch.is_root);
        assert_eq!(branch.name, ROOT_BRANCH_NAME);
    }
}
