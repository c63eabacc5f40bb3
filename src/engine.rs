use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::AppConfig;
use crate::error::EngineResult;
use crate::logic::{
    BranchFork, BranchOps, CommitOutcome, DraftSession, Effect, IntegrityChecker, MigrationLog,
    MigrationRecord, RevisionOps, RowInput, RowOps, TableOps,
};
use crate::model::{Branch, Changelog, Id, RequestContext, Revision, RowVersion, TableVersion, Uid};
use crate::plugins::{
    AllowAll, EndpointNotifier, FilePlugin, NoopFiles, NoopNotifier, PermissionGate,
};
use crate::schema::{PointerKind, SchemaPatch, ValidatorCache};
use crate::store::traits::Store;
use crate::store::txn::TxnRunner;

/// Outcome of one migration record in an `apply_migrations` call.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    Applied,
    /// A record with the same id is already part of the ledger.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStatus {
    pub id: String,
    pub outcome: MigrationOutcome,
}

/// Run one operation body inside a serializable transaction, replaying it
/// when the coordinator says the conflict is retryable.
macro_rules! in_txn {
    ($self:ident, $tx:ident => $body:expr) => {{
        let mut attempt: u32 = 0;
        loop {
            let mut boxed = $self.store.begin().await?;
            let $tx = boxed.as_mut();
            let result = $body;
            if let Some(outcome) = $self.runner.settle(boxed, result, &mut attempt).await {
                break outcome;
            }
        }
    }};
}

/// The command/query surface handed to the transport collaborator.
///
/// Every mutating command checks the permission gate first, runs inside a
/// serializable transaction replayed on conflict, and executes its
/// post-commit effects (endpoint notification) only after the transaction
/// has closed. No transaction handles or cursors cross this boundary.
pub struct Engine<S: Store> {
    store: Arc<S>,
    runner: TxnRunner,
    cache: Arc<ValidatorCache>,
    permissions: Arc<dyn PermissionGate>,
    files: Arc<dyn FilePlugin>,
    notifier: Arc<dyn EndpointNotifier>,
}

impl<S: Store> Engine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            runner: TxnRunner::default(),
            cache: Arc::new(ValidatorCache::default()),
            permissions: Arc::new(AllowAll),
            files: Arc::new(NoopFiles),
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn with_config(store: S, config: &AppConfig) -> Self {
        let mut engine = Self::new(store);
        engine.runner = TxnRunner::new(config.engine.max_txn_retries);
        engine.cache = Arc::new(ValidatorCache::new(Duration::from_secs(
            config.engine.validator_cache_ttl_secs,
        )));
        engine
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionGate>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_files(mut self, files: Arc<dyn FilePlugin>) -> Self {
        self.files = files;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn EndpointNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    // -- project / branch lifecycle -----------------------------------------

    pub async fn init_project(&self, project_id: &Uid) -> EngineResult<BranchFork> {
        self.permissions
            .assert_allowed("project:init", project_id)
            .await?;
        in_txn!(self, tx => BranchOps::init_project(tx, project_id).await)
    }

    pub async fn create_branch(
        &self,
        from_revision_id: &Uid,
        name: &str,
    ) -> EngineResult<BranchFork> {
        self.permissions.assert_allowed("branch:create", name).await?;
        in_txn!(self, tx => BranchOps::create_branch(tx, from_revision_id, name).await)
    }

    pub async fn delete_branch(&self, branch_id: &Uid) -> EngineResult<()> {
        self.permissions
            .assert_allowed("branch:delete", branch_id)
            .await?;
        let effects = in_txn!(self, tx => BranchOps::delete_branch(tx, branch_id).await)?;
        self.run_effects(effects).await;
        Ok(())
    }

    pub async fn get_branch(&self, branch_id: &Uid) -> EngineResult<Branch> {
        in_txn!(self, tx => BranchOps::get_branch(tx, branch_id).await)
    }

    pub async fn list_branches(&self, project_id: &Uid) -> EngineResult<Vec<Branch>> {
        in_txn!(self, tx => BranchOps::list_branches(tx, project_id).await)
    }

    // -- revision lifecycle -------------------------------------------------

    pub async fn commit(
        &self,
        branch_id: &Uid,
        comment: Option<String>,
    ) -> EngineResult<CommitOutcome> {
        self.permissions
            .assert_allowed("revision:commit", branch_id)
            .await?;
        let (outcome, effects) =
            in_txn!(self, tx => RevisionOps::commit(tx, branch_id, comment.clone()).await)?;
        self.run_effects(effects).await;
        Ok(outcome)
    }

    pub async fn revert(&self, branch_id: &Uid) -> EngineResult<Revision> {
        self.permissions
            .assert_allowed("revision:revert", branch_id)
            .await?;
        in_txn!(self, tx => RevisionOps::revert(tx, branch_id).await)
    }

    pub async fn get_changelog(&self, revision_id: &Uid) -> EngineResult<Changelog> {
        in_txn!(self, tx => RevisionOps::get_changelog(tx, revision_id).await)
    }

    // -- tables -------------------------------------------------------------

    pub async fn create_table(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        schema: &Value,
    ) -> EngineResult<TableVersion> {
        self.permissions
            .assert_allowed("table:create", table_id)
            .await?;
        in_txn!(self, tx => TableOps::create_table(tx, ctx, table_id, schema, &self.cache).await)
    }

    pub async fn update_table(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        patches: &[SchemaPatch],
    ) -> EngineResult<Value> {
        self.permissions
            .assert_allowed("table:update", table_id)
            .await?;
        in_txn!(self, tx => TableOps::update_table(tx, ctx, table_id, patches, &self.cache).await)
    }

    pub async fn rename_table(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        next_table_id: &Id,
    ) -> EngineResult<TableVersion> {
        self.permissions
            .assert_allowed("table:rename", table_id)
            .await?;
        in_txn!(self, tx => TableOps::rename_table(tx, ctx, table_id, next_table_id).await)
    }

    pub async fn remove_table(&self, ctx: &RequestContext, table_id: &Id) -> EngineResult<()> {
        self.permissions
            .assert_allowed("table:remove", table_id)
            .await?;
        in_txn!(self, tx => TableOps::remove_table(tx, ctx, table_id).await)
    }

    pub async fn get_table(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
    ) -> EngineResult<TableVersion> {
        in_txn!(self, tx => TableOps::get_table(tx, &ctx.revision_id, table_id).await)
    }

    pub async fn list_tables(&self, ctx: &RequestContext) -> EngineResult<Vec<TableVersion>> {
        in_txn!(self, tx => TableOps::list_tables(tx, &ctx.revision_id).await)
    }

    pub async fn get_schema(&self, ctx: &RequestContext, table_id: &Id) -> EngineResult<Value> {
        in_txn!(self, tx => TableOps::get_schema(tx, &ctx.revision_id, table_id).await)
    }

    pub async fn set_table_views(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        views: Value,
    ) -> EngineResult<()> {
        self.permissions
            .assert_allowed("table:views", table_id)
            .await?;
        in_txn!(self, tx => TableOps::set_views(tx, ctx, table_id, views.clone()).await)
    }

    pub async fn get_table_views(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
    ) -> EngineResult<Option<Value>> {
        in_txn!(self, tx => TableOps::get_views(tx, &ctx.revision_id, table_id).await)
    }

    // -- rows ---------------------------------------------------------------

    pub async fn create_row(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        row: RowInput,
    ) -> EngineResult<RowVersion> {
        let mut created = self.create_rows(ctx, table_id, vec![row]).await?;
        Ok(created.remove(0))
    }

    pub async fn create_rows(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        rows: Vec<RowInput>,
    ) -> EngineResult<Vec<RowVersion>> {
        self.permissions
            .assert_allowed("row:create", table_id)
            .await?;
        in_txn!(self, tx => {
            RowOps::create_rows(tx, ctx, table_id, rows.clone(), &self.cache, self.files.as_ref())
                .await
        })
    }

    pub async fn update_rows(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        rows: Vec<RowInput>,
    ) -> EngineResult<Vec<RowVersion>> {
        self.permissions
            .assert_allowed("row:update", table_id)
            .await?;
        in_txn!(self, tx => {
            RowOps::update_rows(tx, ctx, table_id, rows.clone(), &self.cache, self.files.as_ref())
                .await
        })
    }

    pub async fn remove_rows(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        row_ids: &[Id],
    ) -> EngineResult<()> {
        self.permissions
            .assert_allowed("row:remove", table_id)
            .await?;
        in_txn!(self, tx => RowOps::remove_rows(tx, ctx, table_id, row_ids).await)
    }

    pub async fn rename_row(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        row_id: &Id,
        next_row_id: &Id,
    ) -> EngineResult<RowVersion> {
        self.permissions
            .assert_allowed("row:rename", table_id)
            .await?;
        in_txn!(self, tx => RowOps::rename_row(tx, ctx, table_id, row_id, next_row_id).await)
    }

    pub async fn get_row(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        row_id: &Id,
    ) -> EngineResult<RowVersion> {
        in_txn!(self, tx => RowOps::get_row(tx, &ctx.revision_id, table_id, row_id).await)
    }

    pub async fn list_rows(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<RowVersion>> {
        in_txn!(self, tx => RowOps::list_rows(tx, &ctx.revision_id, table_id, offset, limit).await)
    }

    pub async fn count_rows(&self, ctx: &RequestContext, table_id: &Id) -> EngineResult<i64> {
        in_txn!(self, tx => RowOps::count_rows(tx, &ctx.revision_id, table_id).await)
    }

    // -- references ---------------------------------------------------------

    pub async fn count_foreign_keys_to(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        row_id: &Id,
    ) -> EngineResult<i64> {
        in_txn!(self, tx => {
            IntegrityChecker::count_pointers_to(
                tx,
                &ctx.revision_id,
                PointerKind::ForeignKey,
                table_id,
                row_id,
            )
            .await
        })
    }

    pub async fn count_references_to(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        row_id: &Id,
    ) -> EngineResult<i64> {
        in_txn!(self, tx => {
            IntegrityChecker::count_pointers_to(
                tx,
                &ctx.revision_id,
                PointerKind::Reference,
                table_id,
                row_id,
            )
            .await
        })
    }

    pub async fn resolve_foreign_keys_to(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        row_id: &Id,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<(Id, RowVersion)>> {
        in_txn!(self, tx => {
            IntegrityChecker::resolve_pointers_to(
                tx,
                &ctx.revision_id,
                PointerKind::ForeignKey,
                table_id,
                row_id,
                offset,
                limit,
            )
            .await
        })
    }

    pub async fn resolve_references_to(
        &self,
        ctx: &RequestContext,
        table_id: &Id,
        row_id: &Id,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<(Id, RowVersion)>> {
        in_txn!(self, tx => {
            IntegrityChecker::resolve_pointers_to(
                tx,
                &ctx.revision_id,
                PointerKind::Reference,
                table_id,
                row_id,
                offset,
                limit,
            )
            .await
        })
    }

    // -- migrations ---------------------------------------------------------

    /// Replay recorded schema changes, e.g. to sync a branch. Stops at the
    /// first failure; records applied before it stay applied (one
    /// transaction per record).
    pub async fn apply_migrations(
        &self,
        ctx: &RequestContext,
        records: Vec<MigrationRecord>,
    ) -> EngineResult<Vec<MigrationStatus>> {
        self.permissions
            .assert_allowed("migration:apply", &ctx.revision_id)
            .await?;
        let mut statuses = Vec::with_capacity(records.len());
        for record in &records {
            match self.apply_one_migration(ctx, record).await {
                Ok(true) => statuses.push(MigrationStatus {
                    id: record.id.clone(),
                    outcome: MigrationOutcome::Applied,
                }),
                Ok(false) => statuses.push(MigrationStatus {
                    id: record.id.clone(),
                    outcome: MigrationOutcome::Skipped,
                }),
                Err(err) => {
                    statuses.push(MigrationStatus {
                        id: record.id.clone(),
                        outcome: MigrationOutcome::Failed(err.to_string()),
                    });
                    break;
                }
            }
        }
        Ok(statuses)
    }

    pub async fn list_migrations(
        &self,
        ctx: &RequestContext,
    ) -> EngineResult<Vec<MigrationRecord>> {
        in_txn!(self, tx => MigrationLog::list(tx, &ctx.revision_id).await)
    }

    async fn apply_one_migration(
        &self,
        ctx: &RequestContext,
        record: &MigrationRecord,
    ) -> EngineResult<bool> {
        in_txn!(self, tx => {
            async {
                if MigrationLog::contains(tx, &ctx.revision_id, &record.id).await? {
                    return Ok(false);
                }
                let mut session = DraftSession::load(tx, &ctx.revision_id).await?;
                TableOps::apply_migration_change(tx, &mut session, &record.change, &self.cache)
                    .await?;
                MigrationLog::record_external(tx, &mut session, record).await?;
                session.save(tx).await?;
                Ok(true)
            }
            .await
        })
    }

    // -- internals ----------------------------------------------------------

    async fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::NotifyUpdated { revision_id } => {
                    self.notifier.notify_updated(&revision_id).await
                }
                Effect::NotifyDeleted { revision_id } => {
                    self.notifier.notify_deleted(&revision_id).await
                }
            }
        }
    }
}
