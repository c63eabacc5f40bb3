use log::debug;

use crate::error::{EngineError, EngineResult};
use crate::logic::session::DraftSession;
use crate::model::{Id, RowVersion, TableVersion};
use crate::store::traits::StoreTx;

/// Copy-on-write resolution of draft table and row versions.
///
/// Versions sealed into committed history are `readonly` and shared across
/// revisions; resolving one for mutation clones it first. Cloning duplicates
/// only the owning record and re-links its association set, so the cost is
/// O(link rows), never O(data volume): a cloned table re-attaches the same
/// row versions, it does not deep-copy them.
pub struct DraftResolver;

impl DraftResolver {
    /// The mutable version of a logical table inside the session's draft.
    pub async fn resolve_table(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        table_id: &Id,
    ) -> EngineResult<TableVersion> {
        let table = tx
            .find_table(&session.revision.id, table_id)
            .await?
            .ok_or_else(|| EngineError::not_found("table", table_id))?;
        if !table.readonly {
            // The draft already owns a mutable version.
            return Ok(table);
        }

        let clone = table.clone_version();
        tx.insert_table_version(&clone).await?;
        tx.copy_row_links(&table.version_id, &clone.version_id).await?;
        tx.disconnect_table(&session.revision.id, &table.version_id)
            .await?;
        tx.connect_table(&session.revision.id, &clone.version_id)
            .await?;
        session.changelog.add_table_update(table_id);
        debug!(
            "cloned table {table_id} ({} -> {}) in revision {}",
            table.version_id, clone.version_id, session.revision.id
        );
        Ok(clone)
    }

    /// The mutable version of a logical row inside a mutable table version.
    pub async fn resolve_row(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        table: &TableVersion,
        row_id: &Id,
    ) -> EngineResult<RowVersion> {
        let mut resolved =
            Self::resolve_rows(tx, session, table, std::slice::from_ref(row_id)).await?;
        Ok(resolved.remove(0))
    }

    /// Batch variant: partitions the requested rows into already-mutable and
    /// readonly, clones only the readonly subset and swaps links in bulk.
    /// Returns versions in request order.
    pub async fn resolve_rows(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        table: &TableVersion,
        row_ids: &[Id],
    ) -> EngineResult<Vec<RowVersion>> {
        debug_assert!(!table.readonly, "rows resolve against a mutable table version");

        let found = tx.find_rows(&table.version_id, row_ids).await?;
        if found.len() != row_ids.len() {
            let missing = row_ids
                .iter()
                .find(|row_id| !found.iter().any(|row| &row.id == *row_id))
                .cloned()
                .unwrap_or_default();
            return Err(EngineError::not_found("row", missing));
        }

        let (mutable, readonly): (Vec<RowVersion>, Vec<RowVersion>) =
            found.into_iter().partition(|row| !row.readonly);

        let mut resolved: Vec<RowVersion> = mutable;
        if !readonly.is_empty() {
            let clones: Vec<RowVersion> = readonly.iter().map(RowVersion::clone_version).collect();
            let old_ids: Vec<_> = readonly.iter().map(|row| row.version_id.clone()).collect();
            let new_ids: Vec<_> = clones.iter().map(|row| row.version_id.clone()).collect();

            tx.insert_row_versions(&clones).await?;
            tx.disconnect_rows(&table.version_id, &old_ids).await?;
            tx.connect_rows(&table.version_id, &new_ids).await?;
            for clone in &clones {
                session.changelog.add_row_update(&table.id, &clone.id);
            }
            debug!(
                "cloned {} readonly rows of table {} in revision {}",
                clones.len(),
                table.id,
                session.revision.id
            );
            resolved.extend(clones);
        }

        // Back to request order.
        let mut by_id: std::collections::HashMap<Id, RowVersion> = resolved
            .into_iter()
            .map(|row| (row.id.clone(), row))
            .collect();
        Ok(row_ids
            .iter()
            .filter_map(|row_id| by_id.remove(row_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Changelog, Revision, RowVersion, TableVersion};
    use crate::store::memory::MemoryStore;
    use crate::store::traits::Store;
    use serde_json::json;

    async fn draft_with_table(
        store: &MemoryStore,
        readonly: bool,
    ) -> (Revision, TableVersion, RowVersion) {
        let revision = Revision::new_draft("b1".into(), "parent".into());
        let mut table = TableVersion::new("t1".into(), false);
        table.readonly = readonly;
        let mut row = RowVersion::new("r1".into(), json!({"name": "x"}), "h".into());
        row.readonly = readonly;

        let mut tx = store.begin().await.unwrap();
        tx.insert_revision(&revision).await.unwrap();
        tx.insert_changelog(&Changelog::new(revision.id.clone()))
            .await
            .unwrap();
        tx.insert_table_version(&table).await.unwrap();
        tx.insert_row_versions(std::slice::from_ref(&row)).await.unwrap();
        tx.connect_table(&revision.id, &table.version_id).await.unwrap();
        tx.connect_rows(&table.version_id, &[row.version_id.clone()])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        (revision, table, row)
    }

    #[tokio::test]
    async fn mutable_table_resolves_unchanged() {
        let store = MemoryStore::new();
        let (revision, table, _row) = draft_with_table(&store, false).await;

        let mut tx = store.begin().await.unwrap();
        let mut session = DraftSession::load(tx.as_mut(), &revision.id).await.unwrap();
        let resolved = DraftResolver::resolve_table(tx.as_mut(), &mut session, &"t1".to_string())
            .await
            .unwrap();
        assert_eq!(resolved.version_id, table.version_id);
        assert!(!session.changelog.has_changes);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn readonly_table_is_cloned_and_relinked() {
        let store = MemoryStore::new();
        let (revision, table, row) = draft_with_table(&store, true).await;

        let mut tx = store.begin().await.unwrap();
        let mut session = DraftSession::load(tx.as_mut(), &revision.id).await.unwrap();
        let resolved = DraftResolver::resolve_table(tx.as_mut(), &mut session, &"t1".to_string())
            .await
            .unwrap();
        assert_ne!(resolved.version_id, table.version_id);
        assert_eq!(resolved.created_id, table.created_id);
        assert!(!resolved.readonly);

        // The clone carries the full row association set.
        let linked = tx.list_row_links(&resolved.version_id).await.unwrap();
        assert_eq!(linked, vec![row.version_id.clone()]);
        // The revision now sees exactly the clone.
        let current = tx
            .find_table(&revision.id, &"t1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.version_id, resolved.version_id);
        assert!(session.changelog.table_updates.contains_key("t1"));
        session.save(tx.as_mut()).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn resolving_twice_reuses_the_first_clone() {
        let store = MemoryStore::new();
        let (revision, _table, _row) = draft_with_table(&store, true).await;

        let mut tx = store.begin().await.unwrap();
        let mut session = DraftSession::load(tx.as_mut(), &revision.id).await.unwrap();
        let first = DraftResolver::resolve_table(tx.as_mut(), &mut session, &"t1".to_string())
            .await
            .unwrap();
        let second = DraftResolver::resolve_table(tx.as_mut(), &mut session, &"t1".to_string())
            .await
            .unwrap();
        assert_eq!(first.version_id, second.version_id);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn missing_table_is_not_found() {
        let store = MemoryStore::new();
        let (revision, _table, _row) = draft_with_table(&store, false).await;

        let mut tx = store.begin().await.unwrap();
        let mut session = DraftSession::load(tx.as_mut(), &revision.id).await.unwrap();
        let result =
            DraftResolver::resolve_table(tx.as_mut(), &mut session, &"ghost".to_string()).await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn batch_resolve_clones_only_readonly_rows() {
        let store = MemoryStore::new();
        let (revision, table, row) = draft_with_table(&store, false).await;

        // Add a second, readonly row next to the mutable one.
        let mut sealed = RowVersion::new("r2".into(), json!({"name": "y"}), "h".into());
        sealed.readonly = true;
        let mut tx = store.begin().await.unwrap();
        tx.insert_row_versions(std::slice::from_ref(&sealed)).await.unwrap();
        tx.connect_rows(&table.version_id, &[sealed.version_id.clone()])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut session = DraftSession::load(tx.as_mut(), &revision.id).await.unwrap();
        let resolved = DraftResolver::resolve_rows(
            tx.as_mut(),
            &mut session,
            &table,
            &["r1".to_string(), "r2".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(resolved.len(), 2);
        // Mutable row untouched, readonly row cloned in place.
        assert_eq!(resolved[0].version_id, row.version_id);
        assert_ne!(resolved[1].version_id, sealed.version_id);
        assert_eq!(resolved[1].created_id, sealed.created_id);
        assert!(session.changelog.row_updates["t1"].contains("r2"));
        assert!(!session
            .changelog
            .row_updates
            .get("t1")
            .map(|rows| rows.contains("r1"))
            .unwrap_or(false));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn batch_resolve_reports_missing_rows() {
        let store = MemoryStore::new();
        let (revision, table, _row) = draft_with_table(&store, false).await;

        let mut tx = store.begin().await.unwrap();
        let mut session = DraftSession::load(tx.as_mut(), &revision.id).await.unwrap();
        let result = DraftResolver::resolve_rows(
            tx.as_mut(),
            &mut session,
            &table,
            &["r1".to_string(), "ghost".to_string()],
        )
        .await;
        match result {
            Err(EngineError::NotFound { id, .. }) => assert_eq!(id, "ghost"),
            other => panic!("unexpected: {other:?}"),
        }
        tx.rollback().await.unwrap();
    }
}
