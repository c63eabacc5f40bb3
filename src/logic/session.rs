use crate::error::{EngineError, EngineResult};
use crate::model::{Changelog, Revision, Uid};
use crate::store::traits::StoreTx;

/// The draft revision and its changelog, loaded once per mutating operation
/// and written back once at the end.
///
/// Mutations are only legal against a draft; loading anything else fails
/// with `PreconditionFailed` before any work happens.
pub struct DraftSession {
    pub revision: Revision,
    pub changelog: Changelog,
}

impl DraftSession {
    pub async fn load(tx: &mut dyn StoreTx, revision_id: &Uid) -> EngineResult<Self> {
        let revision = tx
            .get_revision(revision_id)
            .await?
            .ok_or_else(|| EngineError::not_found("revision", revision_id))?;
        if !revision.is_draft {
            return Err(EngineError::PreconditionFailed(format!(
                "revision {revision_id} is not a draft"
            )));
        }
        let changelog = match tx.get_changelog(revision_id).await? {
            Some(changelog) => changelog,
            None => {
                let changelog = Changelog::new(revision_id.clone());
                tx.insert_changelog(&changelog).await?;
                changelog
            }
        };
        Ok(Self {
            revision,
            changelog,
        })
    }

    /// Persist the changelog and keep the revision's `has_changes` flag in
    /// sync with it.
    pub async fn save(mut self, tx: &mut dyn StoreTx) -> EngineResult<()> {
        tx.update_changelog(&self.changelog).await?;
        if self.revision.has_changes != self.changelog.has_changes {
            self.revision.has_changes = self.changelog.has_changes;
            tx.update_revision(&self.revision).await?;
        }
        Ok(())
    }
}
