use log::info;

use crate::error::{EngineError, EngineResult};
use crate::logic::effects::Effect;
use crate::model::{Changelog, Revision, Uid};
use crate::store::traits::StoreTx;

/// Result of a commit: the sealed head and the fresh draft chained off it.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub head: Revision,
    pub draft: Revision,
}

/// Revision lifecycle within a branch: draft -> head promotion and revert.
pub struct RevisionOps;

impl RevisionOps {
    /// Promote the draft to head, seal its versions readonly and chain a new
    /// draft sharing the same table set.
    ///
    /// Sealing is what arms the copy-on-write resolver: readonly marks "this
    /// version belongs to committed history", so the next mutation clones.
    pub async fn commit(
        tx: &mut dyn StoreTx,
        branch_id: &Uid,
        comment: Option<String>,
    ) -> EngineResult<(CommitOutcome, Vec<Effect>)> {
        let mut draft = tx
            .get_draft_revision(branch_id)
            .await?
            .ok_or_else(|| EngineError::not_found("draft revision", branch_id))?;
        if !draft.has_changes {
            return Err(EngineError::PreconditionFailed(
                "no changes to commit".to_string(),
            ));
        }

        if let Some(mut head) = tx.get_head_revision(branch_id).await? {
            head.is_head = false;
            tx.update_revision(&head).await?;
        }

        draft.is_draft = false;
        draft.is_head = true;
        draft.comment = comment;
        tx.update_revision(&draft).await?;
        tx.seal_revision_versions(&draft.id).await?;

        let next_draft = Revision::new_draft(branch_id.clone(), draft.id.clone());
        tx.insert_revision(&next_draft).await?;
        tx.insert_changelog(&Changelog::new(next_draft.id.clone()))
            .await?;
        tx.copy_table_links(&draft.id, &next_draft.id).await?;

        info!(
            "committed revision {} on branch {branch_id}; new draft {}",
            draft.id, next_draft.id
        );
        let effects = vec![Effect::NotifyUpdated {
            revision_id: draft.id.clone(),
        }];
        Ok((
            CommitOutcome {
                head: draft,
                draft: next_draft,
            },
            effects,
        ))
    }

    /// Discard every draft mutation: the draft's table set becomes the
    /// head's again and the changelog empties.
    ///
    /// Draft-local clones become unreferenced; physical reclamation is a
    /// background concern, not a correctness requirement.
    pub async fn revert(tx: &mut dyn StoreTx, branch_id: &Uid) -> EngineResult<Revision> {
        let mut draft = tx
            .get_draft_revision(branch_id)
            .await?
            .ok_or_else(|| EngineError::not_found("draft revision", branch_id))?;
        if !draft.has_changes {
            return Err(EngineError::PreconditionFailed(
                "no changes to revert".to_string(),
            ));
        }
        let head = tx
            .get_head_revision(branch_id)
            .await?
            .ok_or_else(|| EngineError::not_found("head revision", branch_id))?;

        tx.replace_table_links(&draft.id, &head.id).await?;

        let mut changelog = tx
            .get_changelog(&draft.id)
            .await?
            .unwrap_or_else(|| Changelog::new(draft.id.clone()));
        changelog.reset();
        tx.update_changelog(&changelog).await?;

        draft.has_changes = false;
        tx.update_revision(&draft).await?;

        info!("reverted draft {} on branch {branch_id}", draft.id);
        Ok(draft)
    }

    pub async fn get_changelog(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
    ) -> EngineResult<Changelog> {
        tx.get_changelog(revision_id)
            .await?
            .ok_or_else(|| EngineError::not_found("changelog", revision_id))
    }
}
