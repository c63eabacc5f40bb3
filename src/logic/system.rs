use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::logic::resolve::DraftResolver;
use crate::logic::session::DraftSession;
use crate::model::{content_hash, Id, RowVersion, TableVersion, Uid, SCHEMA_TABLE_ID};
use crate::store::traits::StoreTx;

/// Access to the reserved system tables.
///
/// Schema documents, migration records and saved views are ordinary rows of
/// system tables, which is what puts schema changes under the same
/// copy-on-write and changelog machinery as user data.
pub struct SystemTables;

impl SystemTables {
    pub async fn system_table(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        system_table_id: &str,
    ) -> EngineResult<TableVersion> {
        tx.find_table(revision_id, &system_table_id.to_string())
            .await?
            .ok_or_else(|| EngineError::not_found("system table", system_table_id))
    }

    /// The stored JSON Schema document of a table.
    pub async fn load_schema_document(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        table_id: &Id,
    ) -> EngineResult<Value> {
        let schema_table = Self::system_table(tx, revision_id, SCHEMA_TABLE_ID).await?;
        let row = tx
            .find_row(&schema_table.version_id, table_id)
            .await?
            .ok_or_else(|| EngineError::not_found("schema", table_id))?;
        Ok(row.data)
    }

    /// Every `(table_id, schema document)` pair stored in the revision.
    pub async fn load_all_schemas(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
    ) -> EngineResult<Vec<(Id, Value)>> {
        let schema_table = Self::system_table(tx, revision_id, SCHEMA_TABLE_ID).await?;
        let rows = tx
            .list_rows(&schema_table.version_id, 0, i64::MAX)
            .await?;
        Ok(rows.into_iter().map(|row| (row.id, row.data)).collect())
    }

    /// Create or overwrite one system-table row through the copy-on-write
    /// path, recording the change in the session's changelog.
    pub async fn upsert_row(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        system_table_id: &str,
        row_id: &Id,
        data: Value,
    ) -> EngineResult<()> {
        let table = DraftResolver::resolve_table(tx, session, &system_table_id.to_string()).await?;
        match tx.find_row(&table.version_id, row_id).await? {
            Some(_) => {
                let mut row = DraftResolver::resolve_row(tx, session, &table, row_id).await?;
                let schema_hash = content_hash(&data);
                row.set_data(data, schema_hash);
                tx.update_row_version(&row).await?;
                session.changelog.add_row_update(&table.id, row_id);
            }
            None => {
                let schema_hash = content_hash(&data);
                let row = RowVersion::new(row_id.clone(), data, schema_hash);
                tx.insert_row_versions(std::slice::from_ref(&row)).await?;
                tx.connect_rows(&table.version_id, &[row.version_id.clone()])
                    .await?;
                session.changelog.add_row_insert(&table.id, row_id);
            }
        }
        Ok(())
    }

    /// Detach (readonly) or delete (draft-only) one system-table row.
    /// Returns whether a row existed.
    pub async fn remove_row(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        system_table_id: &str,
        row_id: &Id,
    ) -> EngineResult<bool> {
        let table = DraftResolver::resolve_table(tx, session, &system_table_id.to_string()).await?;
        let Some(row) = tx.find_row(&table.version_id, row_id).await? else {
            return Ok(false);
        };
        tx.disconnect_rows(&table.version_id, &[row.version_id.clone()])
            .await?;
        if !row.readonly {
            tx.delete_row_versions(&[row.version_id.clone()]).await?;
        }
        session.changelog.add_row_delete(&table.id, row_id);
        Ok(true)
    }

    /// Change a system-table row's logical id (schema/view rows are keyed by
    /// the table id they describe, so table renames cascade here).
    pub async fn rename_row(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        system_table_id: &str,
        old_id: &Id,
        new_id: &Id,
    ) -> EngineResult<bool> {
        let table = DraftResolver::resolve_table(tx, session, &system_table_id.to_string()).await?;
        if tx.find_row(&table.version_id, old_id).await?.is_none() {
            return Ok(false);
        }
        let mut row = DraftResolver::resolve_row(tx, session, &table, old_id).await?;
        row.id = new_id.clone();
        row.updated_at = chrono::Utc::now();
        tx.update_row_version(&row).await?;
        session.changelog.rename_row(&table.id, old_id, new_id);
        session.changelog.add_row_update(&table.id, new_id);
        Ok(true)
    }
}
