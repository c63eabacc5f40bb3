use log::info;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::logic::integrity::IntegrityChecker;
use crate::logic::migration::{MigrationChange, MigrationLog};
use crate::logic::resolve::DraftResolver;
use crate::logic::session::DraftSession;
use crate::logic::system::SystemTables;
use crate::model::{
    is_system_table_id, is_valid_ident, Id, RequestContext, TableVersion, Uid, SCHEMA_TABLE_ID,
    VIEW_TABLE_ID,
};
use crate::schema::{apply_patches, rewrite_table_pointers, SchemaNode, SchemaPatch, ValidatorCache};
use crate::store::traits::StoreTx;

/// Table-level commands: create, rename, schema update, removal, saved
/// views, and the read paths backing them.
pub struct TableOps;

impl TableOps {
    // -- commands -----------------------------------------------------------

    pub async fn create_table(
        tx: &mut dyn StoreTx,
        ctx: &RequestContext,
        table_id: &Id,
        schema: &Value,
        cache: &ValidatorCache,
    ) -> EngineResult<TableVersion> {
        let mut session = DraftSession::load(tx, &ctx.revision_id).await?;
        let table = Self::create_table_inner(tx, &mut session, table_id, schema, cache).await?;
        MigrationLog::append(
            tx,
            &mut session,
            MigrationChange::Init {
                table_id: table_id.clone(),
                schema: schema.clone(),
            },
        )
        .await?;
        session.save(tx).await?;
        info!("created table {table_id} in revision {}", ctx.revision_id);
        Ok(table)
    }

    pub async fn rename_table(
        tx: &mut dyn StoreTx,
        ctx: &RequestContext,
        table_id: &Id,
        next_table_id: &Id,
    ) -> EngineResult<TableVersion> {
        let mut session = DraftSession::load(tx, &ctx.revision_id).await?;
        let table = Self::rename_table_inner(tx, &mut session, table_id, next_table_id).await?;
        MigrationLog::append(
            tx,
            &mut session,
            MigrationChange::Rename {
                table_id: table_id.clone(),
                next_table_id: next_table_id.clone(),
            },
        )
        .await?;
        session.save(tx).await?;
        info!(
            "renamed table {table_id} -> {next_table_id} in revision {}",
            ctx.revision_id
        );
        Ok(table)
    }

    pub async fn update_table(
        tx: &mut dyn StoreTx,
        ctx: &RequestContext,
        table_id: &Id,
        patches: &[SchemaPatch],
        cache: &ValidatorCache,
    ) -> EngineResult<Value> {
        let mut session = DraftSession::load(tx, &ctx.revision_id).await?;
        let schema = Self::update_table_inner(tx, &mut session, table_id, patches, cache).await?;
        MigrationLog::append(
            tx,
            &mut session,
            MigrationChange::Update {
                table_id: table_id.clone(),
                patches: patches.to_vec(),
            },
        )
        .await?;
        session.save(tx).await?;
        info!(
            "applied {} schema patch(es) to table {table_id} in revision {}",
            patches.len(),
            ctx.revision_id
        );
        Ok(schema)
    }

    pub async fn remove_table(
        tx: &mut dyn StoreTx,
        ctx: &RequestContext,
        table_id: &Id,
    ) -> EngineResult<()> {
        let mut session = DraftSession::load(tx, &ctx.revision_id).await?;
        Self::remove_table_inner(tx, &mut session, table_id).await?;
        MigrationLog::append(
            tx,
            &mut session,
            MigrationChange::Remove {
                table_id: table_id.clone(),
            },
        )
        .await?;
        session.save(tx).await?;
        info!("removed table {table_id} from revision {}", ctx.revision_id);
        Ok(())
    }

    /// Replay one recorded schema change (branch sync path); the caller
    /// stores the record itself.
    pub async fn apply_migration_change(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        change: &MigrationChange,
        cache: &ValidatorCache,
    ) -> EngineResult<()> {
        match change {
            MigrationChange::Init { table_id, schema } => {
                Self::create_table_inner(tx, session, table_id, schema, cache).await?;
            }
            MigrationChange::Update { table_id, patches } => {
                Self::update_table_inner(tx, session, table_id, patches, cache).await?;
            }
            MigrationChange::Rename {
                table_id,
                next_table_id,
            } => {
                Self::rename_table_inner(tx, session, table_id, next_table_id).await?;
            }
            MigrationChange::Remove { table_id } => {
                Self::remove_table_inner(tx, session, table_id).await?;
            }
        }
        Ok(())
    }

    pub async fn set_views(
        tx: &mut dyn StoreTx,
        ctx: &RequestContext,
        table_id: &Id,
        views: Value,
    ) -> EngineResult<()> {
        let mut session = DraftSession::load(tx, &ctx.revision_id).await?;
        Self::require_user_table(tx, &ctx.revision_id, table_id).await?;
        SystemTables::upsert_row(tx, &mut session, VIEW_TABLE_ID, table_id, views).await?;
        session.save(tx).await
    }

    // -- queries ------------------------------------------------------------

    pub async fn get_table(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        table_id: &Id,
    ) -> EngineResult<TableVersion> {
        Self::require_user_table(tx, revision_id, table_id).await
    }

    pub async fn list_tables(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
    ) -> EngineResult<Vec<TableVersion>> {
        tx.list_tables(revision_id, false).await
    }

    pub async fn get_schema(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        table_id: &Id,
    ) -> EngineResult<Value> {
        Self::require_user_table(tx, revision_id, table_id).await?;
        SystemTables::load_schema_document(tx, revision_id, table_id).await
    }

    pub async fn get_views(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        table_id: &Id,
    ) -> EngineResult<Option<Value>> {
        Self::require_user_table(tx, revision_id, table_id).await?;
        let views_table = SystemTables::system_table(tx, revision_id, VIEW_TABLE_ID).await?;
        Ok(tx
            .find_row(&views_table.version_id, table_id)
            .await?
            .map(|row| row.data))
    }

    // -- internals ----------------------------------------------------------

    pub(crate) async fn create_table_inner(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        table_id: &Id,
        schema: &Value,
        cache: &ValidatorCache,
    ) -> EngineResult<TableVersion> {
        Self::validate_table_id(table_id)?;
        if tx.find_table(&session.revision.id, table_id).await?.is_some() {
            return Err(EngineError::Conflict(format!(
                "table {table_id} already exists"
            )));
        }
        // Meta-validate and warm the validator cache before anything lands.
        cache.get_or_compile(schema)?;

        let table = TableVersion::new(table_id.clone(), false);
        tx.insert_table_version(&table).await?;
        tx.connect_table(&session.revision.id, &table.version_id)
            .await?;
        SystemTables::upsert_row(tx, session, SCHEMA_TABLE_ID, table_id, schema.clone()).await?;
        session.changelog.add_table_insert(table_id);
        Ok(table)
    }

    pub(crate) async fn rename_table_inner(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        table_id: &Id,
        next_table_id: &Id,
    ) -> EngineResult<TableVersion> {
        Self::validate_table_id(next_table_id)?;
        if table_id == next_table_id {
            return Err(EngineError::invalid("rename to the same table id"));
        }
        if tx
            .find_table(&session.revision.id, next_table_id)
            .await?
            .is_some()
        {
            return Err(EngineError::Conflict(format!(
                "table {next_table_id} already exists"
            )));
        }
        if is_system_table_id(table_id) {
            return Err(EngineError::invalid(format!(
                "table {table_id} is a system table"
            )));
        }
        if tx.find_table(&session.revision.id, table_id).await?.is_none() {
            return Err(EngineError::not_found("table", table_id));
        }

        let mut table = DraftResolver::resolve_table(tx, session, table_id).await?;
        table.id = next_table_id.clone();
        table.updated_at = chrono::Utc::now();
        tx.update_table_version(&table).await?;
        session.changelog.rename_table(table_id, next_table_id);
        session.changelog.add_table_update(next_table_id);

        // Schema and views rows are keyed by the table id.
        SystemTables::rename_row(tx, session, SCHEMA_TABLE_ID, table_id, next_table_id).await?;
        SystemTables::rename_row(tx, session, VIEW_TABLE_ID, table_id, next_table_id).await?;

        // Stored schemas reference tables by logical id, so the rename
        // cascades into every pointing annotation.
        let schemas = SystemTables::load_all_schemas(tx, &session.revision.id).await?;
        for (schema_table_id, document) in schemas {
            let mut node = SchemaNode::from_value(&document)?;
            if rewrite_table_pointers(&mut node, table_id, next_table_id) {
                SystemTables::upsert_row(
                    tx,
                    session,
                    SCHEMA_TABLE_ID,
                    &schema_table_id,
                    node.to_value(),
                )
                .await?;
            }
        }

        Ok(table)
    }

    pub(crate) async fn update_table_inner(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        table_id: &Id,
        patches: &[SchemaPatch],
        cache: &ValidatorCache,
    ) -> EngineResult<Value> {
        if is_system_table_id(table_id) {
            return Err(EngineError::invalid(format!(
                "table {table_id} is a system table"
            )));
        }
        if patches.is_empty() {
            return Err(EngineError::invalid("empty patch list"));
        }
        if tx.find_table(&session.revision.id, table_id).await?.is_none() {
            return Err(EngineError::not_found("table", table_id));
        }

        let table = DraftResolver::resolve_table(tx, session, table_id).await?;
        let document = SystemTables::load_schema_document(tx, &session.revision.id, table_id).await?;
        let mut node = SchemaNode::from_value(&document)?;
        let migrations = apply_patches(&mut node, patches)?;
        let next_document = node.to_value();
        let compiled = cache.get_or_compile(&next_document)?;

        SystemTables::upsert_row(
            tx,
            session,
            SCHEMA_TABLE_ID,
            table_id,
            next_document.clone(),
        )
        .await?;

        // Migrate every existing row through the patch sequence.
        let row_ids: Vec<Id> = tx
            .list_rows(&table.version_id, 0, i64::MAX)
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();
        if !row_ids.is_empty() {
            let rows = DraftResolver::resolve_rows(tx, session, &table, &row_ids).await?;
            for mut row in rows {
                let mut data = row.data.clone();
                for migration in &migrations {
                    migration.migrate(&mut data);
                }
                compiled.ensure_valid(&data).map_err(|err| match err {
                    EngineError::InvalidInput { message, pointer } => EngineError::InvalidInput {
                        message: format!("row {}: {message}", row.id),
                        pointer,
                    },
                    other => other,
                })?;
                row.set_data(data, compiled.hash.clone());
                row.published_at = compiled.derive_published_at(&row.data);
                tx.update_row_version(&row).await?;
                session.changelog.add_row_update(table_id, &row.id);
            }
        }

        session.changelog.add_table_update(table_id);
        Ok(next_document)
    }

    pub(crate) async fn remove_table_inner(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        table_id: &Id,
    ) -> EngineResult<()> {
        if is_system_table_id(table_id) {
            return Err(EngineError::invalid(format!(
                "table {table_id} is a system table"
            )));
        }
        let table = tx
            .find_table(&session.revision.id, table_id)
            .await?
            .ok_or_else(|| EngineError::not_found("table", table_id))?;

        IntegrityChecker::assert_no_pointer_declarations(tx, &session.revision.id, table_id)
            .await?;

        tx.disconnect_table(&session.revision.id, &table.version_id)
            .await?;
        if !table.readonly {
            // Draft-only version: physically delete it and any rows that
            // just became unreachable. Readonly rows stay; committed table
            // versions still link them.
            let rows = tx.list_rows(&table.version_id, 0, i64::MAX).await?;
            let linked: Vec<Uid> = rows.iter().map(|row| row.version_id.clone()).collect();
            tx.disconnect_rows(&table.version_id, &linked).await?;
            let mut orphaned = Vec::new();
            for row in rows {
                if !row.readonly && tx.count_row_links(&row.version_id).await? == 0 {
                    orphaned.push(row.version_id);
                }
            }
            if !orphaned.is_empty() {
                tx.delete_row_versions(&orphaned).await?;
            }
            tx.delete_table_version(&table.version_id).await?;
        }

        SystemTables::remove_row(tx, session, SCHEMA_TABLE_ID, table_id).await?;
        SystemTables::remove_row(tx, session, VIEW_TABLE_ID, table_id).await?;
        session.changelog.add_table_delete(table_id);
        Ok(())
    }

    async fn require_user_table(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        table_id: &Id,
    ) -> EngineResult<TableVersion> {
        let table = tx
            .find_table(revision_id, table_id)
            .await?
            .ok_or_else(|| EngineError::not_found("table", table_id))?;
        if table.system {
            // System tables are invisible to the public surface.
            return Err(EngineError::not_found("table", table_id));
        }
        Ok(table)
    }

    fn validate_table_id(table_id: &Id) -> EngineResult<()> {
        if !is_valid_ident(table_id) {
            return Err(EngineError::invalid(format!(
                "illegal table id `{table_id}`"
            )));
        }
        if is_system_table_id(table_id) {
            return Err(EngineError::invalid(format!(
                "table id `{table_id}` is reserved"
            )));
        }
        Ok(())
    }
}
