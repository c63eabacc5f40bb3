use std::collections::BTreeSet;

use log::info;

use crate::error::{EngineError, EngineResult};
use crate::logic::effects::Effect;
use crate::model::{
    is_valid_ident, Branch, Changelog, Revision, TableVersion, Uid, MIGRATION_TABLE_ID,
    SCHEMA_TABLE_ID, VIEW_TABLE_ID,
};
use crate::store::traits::StoreTx;

/// The records created when a project is bootstrapped or a branch is forked.
#[derive(Debug, Clone)]
pub struct BranchFork {
    pub branch: Branch,
    pub head: Revision,
    pub draft: Revision,
}

/// Branch lifecycle: project bootstrap, forking, deletion.
pub struct BranchOps;

impl BranchOps {
    /// Create the root branch of a project: a start/head revision carrying
    /// the sealed system tables and a fresh draft sharing them.
    pub async fn init_project(tx: &mut dyn StoreTx, project_id: &Uid) -> EngineResult<BranchFork> {
        if tx
            .find_branch_by_name(project_id, crate::model::ROOT_BRANCH_NAME)
            .await?
            .is_some()
        {
            return Err(EngineError::Conflict(format!(
                "project {project_id} is already initialized"
            )));
        }

        let branch = Branch::new_root(project_id.clone());
        let head = Revision::new_start(branch.id.clone(), None);
        let draft = Revision::new_draft(branch.id.clone(), head.id.clone());

        tx.insert_branch(&branch).await?;
        tx.insert_revision(&head).await?;
        tx.insert_revision(&draft).await?;
        tx.insert_changelog(&Changelog::new(head.id.clone())).await?;
        tx.insert_changelog(&Changelog::new(draft.id.clone())).await?;

        for system_table_id in [SCHEMA_TABLE_ID, MIGRATION_TABLE_ID, VIEW_TABLE_ID] {
            let mut table = TableVersion::new(system_table_id.to_string(), true);
            // Part of committed history from the start; first mutation clones.
            table.readonly = true;
            tx.insert_table_version(&table).await?;
            tx.connect_table(&head.id, &table.version_id).await?;
            tx.connect_table(&draft.id, &table.version_id).await?;
        }

        info!("initialized project {project_id} with root branch {}", branch.id);
        Ok(BranchFork {
            branch,
            head,
            draft,
        })
    }

    /// Fork a new branch from a committed revision. The new head and draft
    /// share the source revision's table set; nothing is cloned.
    pub async fn create_branch(
        tx: &mut dyn StoreTx,
        from_revision_id: &Uid,
        name: &str,
    ) -> EngineResult<BranchFork> {
        if !is_valid_ident(name) {
            return Err(EngineError::invalid(format!("illegal branch name `{name}`")));
        }
        let source = tx
            .get_revision(from_revision_id)
            .await?
            .ok_or_else(|| EngineError::not_found("revision", from_revision_id))?;
        if source.is_draft {
            return Err(EngineError::PreconditionFailed(
                "cannot branch from a draft revision".to_string(),
            ));
        }
        let source_branch = tx
            .get_branch(&source.branch_id)
            .await?
            .ok_or_else(|| EngineError::not_found("branch", &source.branch_id))?;
        if tx
            .find_branch_by_name(&source_branch.project_id, name)
            .await?
            .is_some()
        {
            return Err(EngineError::Conflict(format!(
                "branch {name} already exists"
            )));
        }

        let branch = Branch::new(source_branch.project_id.clone(), name.to_string());
        let head = Revision::new_start(branch.id.clone(), Some(source.id.clone()));
        let draft = Revision::new_draft(branch.id.clone(), head.id.clone());

        tx.insert_branch(&branch).await?;
        tx.insert_revision(&head).await?;
        tx.insert_revision(&draft).await?;
        tx.insert_changelog(&Changelog::new(head.id.clone())).await?;
        tx.insert_changelog(&Changelog::new(draft.id.clone())).await?;
        tx.copy_table_links(&source.id, &head.id).await?;
        tx.copy_table_links(&source.id, &draft.id).await?;

        info!(
            "forked branch {name} ({}) from revision {from_revision_id}",
            branch.id
        );
        Ok(BranchFork {
            branch,
            head,
            draft,
        })
    }

    /// Delete a non-root, childless branch: cascades its revisions,
    /// changelogs and every table/row version left unreachable.
    pub async fn delete_branch(
        tx: &mut dyn StoreTx,
        branch_id: &Uid,
    ) -> EngineResult<Vec<Effect>> {
        let branch = tx
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| EngineError::not_found("branch", branch_id))?;
        if branch.is_root {
            return Err(EngineError::PreconditionFailed(
                "the root branch cannot be deleted".to_string(),
            ));
        }
        if tx.branch_has_children(branch_id).await? {
            return Err(EngineError::Conflict(format!(
                "branch {} has child branches",
                branch.name
            )));
        }

        let revisions = tx.list_revisions(branch_id).await?;
        let mut candidate_tables: BTreeSet<Uid> = BTreeSet::new();
        let mut effects = Vec::with_capacity(revisions.len());
        for revision in &revisions {
            for table in tx.list_tables(&revision.id, true).await? {
                candidate_tables.insert(table.version_id);
            }
            tx.delete_changelog(&revision.id).await?;
            tx.delete_revision(&revision.id).await?;
            effects.push(Effect::NotifyDeleted {
                revision_id: revision.id.clone(),
            });
        }

        // Versions kept alive only by the deleted revisions go with them.
        for table_version_id in candidate_tables {
            if tx.count_table_links(&table_version_id).await? > 0 {
                continue;
            }
            let rows = tx.list_row_links(&table_version_id).await?;
            tx.delete_table_version(&table_version_id).await?;
            for row_version_id in rows {
                if tx.count_row_links(&row_version_id).await? == 0 {
                    tx.delete_row_versions(std::slice::from_ref(&row_version_id))
                        .await?;
                }
            }
        }

        tx.delete_branch(branch_id).await?;
        info!(
            "deleted branch {} with {} revision(s)",
            branch.name,
            revisions.len()
        );
        Ok(effects)
    }

    pub async fn get_branch(tx: &mut dyn StoreTx, branch_id: &Uid) -> EngineResult<Branch> {
        tx.get_branch(branch_id)
            .await?
            .ok_or_else(|| EngineError::not_found("branch", branch_id))
    }

    pub async fn list_branches(
        tx: &mut dyn StoreTx,
        project_id: &Uid,
    ) -> EngineResult<Vec<Branch>> {
        tx.list_branches(project_id).await
    }
}
