use crate::error::EngineResult;
use crate::model::{Branch, Changelog, Id, Revision, RowVersion, TableVersion, Uid};
use crate::schema::DataPath;

/// A storage backend able to open serializable transactions.
///
/// The engine never touches storage outside a transaction; every operation
/// body runs against a [`StoreTx`] opened here and is replayed wholesale by
/// the coordinator when the backend reports a serialization conflict.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> EngineResult<Box<dyn StoreTx>>;
}

/// One open transaction against the backing store.
///
/// Tables and rows are conceptually infinite version chains but physically
/// shared rows in junction tables (revision <-> table version, table version
/// <-> row version), which is why the contract deals in bulk link operations
/// rather than deep copies.
#[async_trait::async_trait]
pub trait StoreTx: Send {
    // -- branches -----------------------------------------------------------

    async fn insert_branch(&mut self, branch: &Branch) -> EngineResult<()>;
    async fn get_branch(&mut self, branch_id: &Uid) -> EngineResult<Option<Branch>>;
    /// Case-insensitive lookup by name within a project.
    async fn find_branch_by_name(
        &mut self,
        project_id: &Uid,
        name: &str,
    ) -> EngineResult<Option<Branch>>;
    async fn list_branches(&mut self, project_id: &Uid) -> EngineResult<Vec<Branch>>;
    async fn delete_branch(&mut self, branch_id: &Uid) -> EngineResult<bool>;
    /// Whether any other branch was forked from one of this branch's
    /// revisions (its start revision's parent lives here).
    async fn branch_has_children(&mut self, branch_id: &Uid) -> EngineResult<bool>;

    // -- revisions ----------------------------------------------------------

    async fn insert_revision(&mut self, revision: &Revision) -> EngineResult<()>;
    async fn get_revision(&mut self, revision_id: &Uid) -> EngineResult<Option<Revision>>;
    async fn get_head_revision(&mut self, branch_id: &Uid) -> EngineResult<Option<Revision>>;
    async fn get_draft_revision(&mut self, branch_id: &Uid) -> EngineResult<Option<Revision>>;
    async fn update_revision(&mut self, revision: &Revision) -> EngineResult<()>;
    async fn list_revisions(&mut self, branch_id: &Uid) -> EngineResult<Vec<Revision>>;
    async fn delete_revision(&mut self, revision_id: &Uid) -> EngineResult<()>;

    // -- changelogs ---------------------------------------------------------

    async fn insert_changelog(&mut self, changelog: &Changelog) -> EngineResult<()>;
    async fn get_changelog(&mut self, revision_id: &Uid) -> EngineResult<Option<Changelog>>;
    async fn update_changelog(&mut self, changelog: &Changelog) -> EngineResult<()>;
    async fn delete_changelog(&mut self, revision_id: &Uid) -> EngineResult<()>;

    // -- table versions -----------------------------------------------------

    async fn insert_table_version(&mut self, table: &TableVersion) -> EngineResult<()>;
    async fn update_table_version(&mut self, table: &TableVersion) -> EngineResult<()>;
    async fn delete_table_version(&mut self, version_id: &Uid) -> EngineResult<()>;
    /// Current version of the logical table inside a revision's table set.
    async fn find_table(
        &mut self,
        revision_id: &Uid,
        table_id: &Id,
    ) -> EngineResult<Option<TableVersion>>;
    async fn list_tables(
        &mut self,
        revision_id: &Uid,
        include_system: bool,
    ) -> EngineResult<Vec<TableVersion>>;
    async fn connect_table(&mut self, revision_id: &Uid, version_id: &Uid) -> EngineResult<()>;
    async fn disconnect_table(&mut self, revision_id: &Uid, version_id: &Uid) -> EngineResult<()>;
    /// Share every table version of `from` into `to` (cheap fork / new draft).
    async fn copy_table_links(
        &mut self,
        from_revision_id: &Uid,
        to_revision_id: &Uid,
    ) -> EngineResult<()>;
    /// Replace `revision`'s table set wholesale with `source`'s (revert).
    async fn replace_table_links(
        &mut self,
        revision_id: &Uid,
        source_revision_id: &Uid,
    ) -> EngineResult<()>;
    async fn count_table_links(&mut self, version_id: &Uid) -> EngineResult<i64>;
    /// Mark every table and row version in the revision's set readonly
    /// (commit sealing).
    async fn seal_revision_versions(&mut self, revision_id: &Uid) -> EngineResult<()>;

    // -- row versions -------------------------------------------------------

    async fn insert_row_versions(&mut self, rows: &[RowVersion]) -> EngineResult<()>;
    async fn update_row_version(&mut self, row: &RowVersion) -> EngineResult<()>;
    async fn delete_row_versions(&mut self, version_ids: &[Uid]) -> EngineResult<()>;
    /// Current version of the logical row inside a table version's row set.
    async fn find_row(
        &mut self,
        table_version_id: &Uid,
        row_id: &Id,
    ) -> EngineResult<Option<RowVersion>>;
    async fn find_rows(
        &mut self,
        table_version_id: &Uid,
        row_ids: &[Id],
    ) -> EngineResult<Vec<RowVersion>>;
    async fn list_rows(
        &mut self,
        table_version_id: &Uid,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<RowVersion>>;
    async fn count_rows(&mut self, table_version_id: &Uid) -> EngineResult<i64>;
    async fn connect_rows(
        &mut self,
        table_version_id: &Uid,
        version_ids: &[Uid],
    ) -> EngineResult<()>;
    async fn disconnect_rows(
        &mut self,
        table_version_id: &Uid,
        version_ids: &[Uid],
    ) -> EngineResult<()>;
    /// Re-attach every row of `from` to `to` (table clone; O(link rows)).
    async fn copy_row_links(
        &mut self,
        from_table_version_id: &Uid,
        to_table_version_id: &Uid,
    ) -> EngineResult<()>;
    async fn count_row_links(&mut self, row_version_id: &Uid) -> EngineResult<i64>;
    async fn list_row_links(&mut self, table_version_id: &Uid) -> EngineResult<Vec<Uid>>;

    /// Count rows whose value at any of the given data paths equals `value`.
    /// One storage-side query per call; the engine never iterates row data.
    async fn count_rows_with_value_at_paths(
        &mut self,
        table_version_id: &Uid,
        paths: &[DataPath],
        value: &str,
    ) -> EngineResult<i64>;
    /// The paged companion of the count, for read paths.
    async fn find_rows_with_value_at_paths(
        &mut self,
        table_version_id: &Uid,
        paths: &[DataPath],
        value: &str,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<RowVersion>>;

    // -- lifecycle ----------------------------------------------------------

    async fn commit(self: Box<Self>) -> EngineResult<()>;
    async fn rollback(self: Box<Self>) -> EngineResult<()>;
}
