use serde::{Deserialize, Serialize};

use crate::model::common::Uid;

/// Request-scoped context threaded explicitly through the call chain.
///
/// Carries the identity of the caller and the revision being operated on.
/// Never stored in shared mutable state, so concurrent requests stay
/// independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub project_id: Uid,
    pub revision_id: Uid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uid>,
}

impl RequestContext {
    pub fn new(project_id: impl Into<Uid>, revision_id: impl Into<Uid>) -> Self {
        Self {
            project_id: project_id.into(),
            revision_id: revision_id.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<Uid>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// The same caller, pointed at a different revision.
    pub fn at_revision(&self, revision_id: impl Into<Uid>) -> Self {
        Self {
            project_id: self.project_id.clone(),
            revision_id: revision_id.into(),
            user_id: self.user_id.clone(),
        }
    }
}
