use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::logic::integrity::IntegrityChecker;
use crate::logic::resolve::DraftResolver;
use crate::logic::session::DraftSession;
use crate::logic::system::SystemTables;
use crate::model::{
    is_system_table_id, is_valid_ident, Id, RequestContext, RowVersion, TableVersion, Uid,
};
use crate::plugins::FilePlugin;
use crate::schema::{CompiledSchema, ValidatorCache};
use crate::store::traits::StoreTx;

/// One row in a create/update batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowInput {
    pub id: Id,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Row-level commands and reads. Batches are atomic: either every row in a
/// batch lands, or none do.
pub struct RowOps;

impl RowOps {
    // -- commands -----------------------------------------------------------

    pub async fn create_row(
        tx: &mut dyn StoreTx,
        ctx: &RequestContext,
        table_id: &Id,
        row: RowInput,
        cache: &ValidatorCache,
        files: &dyn FilePlugin,
    ) -> EngineResult<RowVersion> {
        let mut created = Self::create_rows(tx, ctx, table_id, vec![row], cache, files).await?;
        Ok(created.remove(0))
    }

    pub async fn create_rows(
        tx: &mut dyn StoreTx,
        ctx: &RequestContext,
        table_id: &Id,
        rows: Vec<RowInput>,
        cache: &ValidatorCache,
        files: &dyn FilePlugin,
    ) -> EngineResult<Vec<RowVersion>> {
        let mut session = DraftSession::load(tx, &ctx.revision_id).await?;
        Self::check_batch(table_id, rows.iter().map(|row| &row.id))?;
        for row in &rows {
            if !is_valid_ident(&row.id) {
                return Err(EngineError::invalid(format!("illegal row id `{}`", row.id)));
            }
        }

        let table = DraftResolver::resolve_table(tx, &mut session, table_id).await?;
        let ids: Vec<Id> = rows.iter().map(|row| row.id.clone()).collect();
        let existing = tx.find_rows(&table.version_id, &ids).await?;
        if let Some(first) = existing.first() {
            return Err(EngineError::Conflict(format!(
                "row {} already exists in table {table_id}",
                first.id
            )));
        }

        let compiled = Self::compiled_schema(tx, &session, table_id, cache).await?;
        let mut versions = Vec::with_capacity(rows.len());
        for input in rows {
            Self::check_data(&compiled, &input.id, &input.data)?;
            let data = if compiled.has_file_fields() {
                files.after_create_row(input.data).await?
            } else {
                input.data
            };
            let mut version = RowVersion::new(input.id, data, compiled.hash.clone());
            version.meta = input.meta.unwrap_or(Value::Null);
            version.published_at = compiled.derive_published_at(&version.data);
            versions.push(version);
        }

        tx.insert_row_versions(&versions).await?;
        let version_ids: Vec<Uid> = versions.iter().map(|row| row.version_id.clone()).collect();
        tx.connect_rows(&table.version_id, &version_ids).await?;
        for version in &versions {
            session.changelog.add_row_insert(table_id, &version.id);
        }
        session.save(tx).await?;
        info!(
            "created {} row(s) in table {table_id}, revision {}",
            versions.len(),
            ctx.revision_id
        );
        Ok(versions)
    }

    pub async fn update_rows(
        tx: &mut dyn StoreTx,
        ctx: &RequestContext,
        table_id: &Id,
        rows: Vec<RowInput>,
        cache: &ValidatorCache,
        files: &dyn FilePlugin,
    ) -> EngineResult<Vec<RowVersion>> {
        let mut session = DraftSession::load(tx, &ctx.revision_id).await?;
        Self::check_batch(table_id, rows.iter().map(|row| &row.id))?;

        let table = DraftResolver::resolve_table(tx, &mut session, table_id).await?;
        let compiled = Self::compiled_schema(tx, &session, table_id, cache).await?;
        for input in &rows {
            Self::check_data(&compiled, &input.id, &input.data)?;
        }

        let ids: Vec<Id> = rows.iter().map(|row| row.id.clone()).collect();
        let resolved = DraftResolver::resolve_rows(tx, &mut session, &table, &ids).await?;

        let mut updated = Vec::with_capacity(rows.len());
        for (input, mut version) in rows.into_iter().zip(resolved) {
            let data = if compiled.has_file_fields() {
                files.after_update_row(input.data).await?
            } else {
                input.data
            };
            let incoming_hash = crate::model::content_hash(&data);
            if incoming_hash == version.hash && compiled.hash == version.schema_hash {
                // Content unchanged; nothing to write.
                updated.push(version);
                continue;
            }
            version.set_data(data, compiled.hash.clone());
            if let Some(meta) = input.meta {
                version.meta = meta;
            }
            version.published_at = compiled.derive_published_at(&version.data);
            tx.update_row_version(&version).await?;
            session.changelog.add_row_update(table_id, &version.id);
            updated.push(version);
        }

        session.save(tx).await?;
        info!(
            "updated {} row(s) in table {table_id}, revision {}",
            updated.len(),
            ctx.revision_id
        );
        Ok(updated)
    }

    pub async fn remove_rows(
        tx: &mut dyn StoreTx,
        ctx: &RequestContext,
        table_id: &Id,
        row_ids: &[Id],
    ) -> EngineResult<()> {
        let mut session = DraftSession::load(tx, &ctx.revision_id).await?;
        Self::check_batch(table_id, row_ids.iter())?;
        if tx.find_table(&session.revision.id, table_id).await?.is_none() {
            return Err(EngineError::not_found("table", table_id));
        }

        // Nothing is detached while live pointers remain.
        for row_id in row_ids {
            IntegrityChecker::assert_no_row_users(tx, &session.revision.id, table_id, row_id)
                .await?;
        }

        let table = DraftResolver::resolve_table(tx, &mut session, table_id).await?;
        let found = tx.find_rows(&table.version_id, row_ids).await?;
        if found.len() != row_ids.len() {
            let missing = row_ids
                .iter()
                .find(|row_id| !found.iter().any(|row| &row.id == *row_id))
                .cloned()
                .unwrap_or_default();
            return Err(EngineError::not_found("row", missing));
        }

        let version_ids: Vec<Uid> = found.iter().map(|row| row.version_id.clone()).collect();
        tx.disconnect_rows(&table.version_id, &version_ids).await?;
        // Readonly versions stay reachable from committed history; draft-only
        // versions are gone for good.
        let mut orphaned = Vec::new();
        for row in &found {
            if !row.readonly && tx.count_row_links(&row.version_id).await? == 0 {
                orphaned.push(row.version_id.clone());
            }
        }
        if !orphaned.is_empty() {
            tx.delete_row_versions(&orphaned).await?;
        }
        for row in &found {
            session.changelog.add_row_delete(table_id, &row.id);
        }
        session.save(tx).await?;
        info!(
            "removed {} row(s) from table {table_id}, revision {}",
            found.len(),
            ctx.revision_id
        );
        Ok(())
    }

    pub async fn rename_row(
        tx: &mut dyn StoreTx,
        ctx: &RequestContext,
        table_id: &Id,
        row_id: &Id,
        next_row_id: &Id,
    ) -> EngineResult<RowVersion> {
        let mut session = DraftSession::load(tx, &ctx.revision_id).await?;
        if is_system_table_id(table_id) {
            return Err(EngineError::invalid(format!(
                "table {table_id} is a system table"
            )));
        }
        if !is_valid_ident(next_row_id) {
            return Err(EngineError::invalid(format!(
                "illegal row id `{next_row_id}`"
            )));
        }
        if row_id == next_row_id {
            return Err(EngineError::invalid("rename to the same row id"));
        }

        // A rename would dangle any live pointer at the old id.
        IntegrityChecker::assert_no_row_users(tx, &session.revision.id, table_id, row_id).await?;

        let table = DraftResolver::resolve_table(tx, &mut session, table_id).await?;
        if tx.find_row(&table.version_id, row_id).await?.is_none() {
            return Err(EngineError::not_found("row", row_id));
        }
        if tx.find_row(&table.version_id, next_row_id).await?.is_some() {
            return Err(EngineError::Conflict(format!(
                "row {next_row_id} already exists in table {table_id}"
            )));
        }

        let mut row = DraftResolver::resolve_row(tx, &mut session, &table, row_id).await?;
        row.id = next_row_id.clone();
        row.updated_at = chrono::Utc::now();
        tx.update_row_version(&row).await?;
        session.changelog.rename_row(table_id, row_id, next_row_id);
        session.changelog.add_row_update(table_id, next_row_id);
        session.save(tx).await?;
        Ok(row)
    }

    // -- queries ------------------------------------------------------------

    pub async fn get_row(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        table_id: &Id,
        row_id: &Id,
    ) -> EngineResult<RowVersion> {
        let table = Self::user_table(tx, revision_id, table_id).await?;
        tx.find_row(&table.version_id, row_id)
            .await?
            .ok_or_else(|| EngineError::not_found("row", row_id))
    }

    pub async fn list_rows(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        table_id: &Id,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<RowVersion>> {
        let table = Self::user_table(tx, revision_id, table_id).await?;
        tx.list_rows(&table.version_id, offset, limit).await
    }

    pub async fn count_rows(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        table_id: &Id,
    ) -> EngineResult<i64> {
        let table = Self::user_table(tx, revision_id, table_id).await?;
        tx.count_rows(&table.version_id).await
    }

    // -- internals ----------------------------------------------------------

    async fn user_table(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        table_id: &Id,
    ) -> EngineResult<TableVersion> {
        let table = tx
            .find_table(revision_id, table_id)
            .await?
            .ok_or_else(|| EngineError::not_found("table", table_id))?;
        if table.system {
            return Err(EngineError::not_found("table", table_id));
        }
        Ok(table)
    }

    async fn compiled_schema(
        tx: &mut dyn StoreTx,
        session: &DraftSession,
        table_id: &Id,
        cache: &ValidatorCache,
    ) -> EngineResult<std::sync::Arc<CompiledSchema>> {
        let document =
            SystemTables::load_schema_document(tx, &session.revision.id, table_id).await?;
        cache.get_or_compile(&document)
    }

    fn check_batch<'a>(
        table_id: &Id,
        row_ids: impl Iterator<Item = &'a Id> + Clone,
    ) -> EngineResult<()> {
        if is_system_table_id(table_id) {
            return Err(EngineError::invalid(format!(
                "table {table_id} is a system table"
            )));
        }
        if row_ids.clone().count() == 0 {
            return Err(EngineError::invalid("empty batch"));
        }
        if let Some(duplicate) = row_ids.duplicates().next() {
            return Err(EngineError::invalid(format!(
                "duplicate row id `{duplicate}` in batch"
            )));
        }
        Ok(())
    }

    fn check_data(compiled: &CompiledSchema, row_id: &Id, data: &Value) -> EngineResult<()> {
        if let Some(issue) = compiled.check(data).into_iter().next() {
            return Err(EngineError::InvalidInput {
                message: format!("row {row_id}: {}", issue.message),
                pointer: Some(issue.pointer),
            });
        }
        Ok(())
    }
}
