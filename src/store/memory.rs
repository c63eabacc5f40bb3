use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::model::{Branch, Changelog, Id, Revision, RowVersion, TableVersion, Uid};
use crate::schema::DataPath;
use crate::store::traits::{Store, StoreTx};

/// Embedded storage engine with optimistic serializable transactions.
///
/// Transactions clone the committed state as their snapshot, track read and
/// write sets at entity/junction granularity and validate backwards at
/// commit: if any transaction that committed in between wrote something this
/// one read or wrote, commit fails with `SerializationConflict` and the
/// coordinator replays the operation. Suited to tests and small embedded
/// deployments; the Postgres backend carries the same contract at scale.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> EngineResult<Box<dyn StoreTx>> {
        let inner = self.inner.lock();
        Ok(Box::new(MemoryTx {
            store: Arc::clone(&self.inner),
            snapshot: inner.state.clone(),
            begin_seq: inner.seq,
            reads: HashSet::new(),
            writes: HashSet::new(),
        }))
    }
}

#[derive(Default)]
struct Inner {
    seq: u64,
    /// Sequence number of the oldest entry still in `log`; transactions
    /// older than this cannot be validated and abort conservatively.
    oldest_seq: u64,
    state: State,
    log: VecDeque<(u64, HashSet<Key>)>,
}

const LOG_WINDOW: usize = 4096;

#[derive(Clone, Default)]
struct State {
    branches: HashMap<Uid, Branch>,
    revisions: HashMap<Uid, Revision>,
    /// Keyed by revision id.
    changelogs: HashMap<Uid, Changelog>,
    tables: HashMap<Uid, TableVersion>,
    rows: HashMap<Uid, RowVersion>,
    revision_tables: HashMap<Uid, BTreeSet<Uid>>,
    table_rows: HashMap<Uid, BTreeSet<Uid>>,
}

/// Conflict-detection granule. Entity keys carry record state; `*Index`
/// keys are phantom guards for membership queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Branch(Uid),
    BranchIndex(Uid),
    Revision(Uid),
    RevisionIndex(Uid),
    Changelog(Uid),
    Table(Uid),
    Row(Uid),
    RevisionTables(Uid),
    TableRows(Uid),
}

struct MemoryTx {
    store: Arc<Mutex<Inner>>,
    snapshot: State,
    begin_seq: u64,
    reads: HashSet<Key>,
    writes: HashSet<Key>,
}

impl MemoryTx {
    fn read(&mut self, key: Key) {
        self.reads.insert(key);
    }

    fn write(&mut self, key: Key) {
        self.writes.insert(key);
    }

    fn table_set(&self, revision_id: &Uid) -> BTreeSet<Uid> {
        self.snapshot
            .revision_tables
            .get(revision_id)
            .cloned()
            .unwrap_or_default()
    }

    fn row_set(&self, table_version_id: &Uid) -> BTreeSet<Uid> {
        self.snapshot
            .table_rows
            .get(table_version_id)
            .cloned()
            .unwrap_or_default()
    }

    fn rows_matching(
        &mut self,
        table_version_id: &Uid,
        paths: &[DataPath],
        value: &str,
    ) -> Vec<RowVersion> {
        self.read(Key::TableRows(table_version_id.clone()));
        let mut matched = Vec::new();
        for row_version_id in self.row_set(table_version_id) {
            self.reads.insert(Key::Row(row_version_id.clone()));
            let Some(row) = self.snapshot.rows.get(&row_version_id) else {
                continue;
            };
            let hit = paths.iter().any(|path| {
                let mut values = Vec::new();
                path.collect(&row.data, &mut values);
                values
                    .iter()
                    .any(|candidate| candidate.as_str() == Some(value))
            });
            if hit {
                matched.push(row.clone());
            }
        }
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }
}

#[async_trait::async_trait]
impl StoreTx for MemoryTx {
    // -- branches -----------------------------------------------------------

    async fn insert_branch(&mut self, branch: &Branch) -> EngineResult<()> {
        self.write(Key::Branch(branch.id.clone()));
        self.write(Key::BranchIndex(branch.project_id.clone()));
        self.snapshot
            .branches
            .insert(branch.id.clone(), branch.clone());
        Ok(())
    }

    async fn get_branch(&mut self, branch_id: &Uid) -> EngineResult<Option<Branch>> {
        self.read(Key::Branch(branch_id.clone()));
        Ok(self.snapshot.branches.get(branch_id).cloned())
    }

    async fn find_branch_by_name(
        &mut self,
        project_id: &Uid,
        name: &str,
    ) -> EngineResult<Option<Branch>> {
        self.read(Key::BranchIndex(project_id.clone()));
        let lowered = name.to_lowercase();
        Ok(self
            .snapshot
            .branches
            .values()
            .find(|branch| {
                branch.project_id == *project_id && branch.name.to_lowercase() == lowered
            })
            .cloned())
    }

    async fn list_branches(&mut self, project_id: &Uid) -> EngineResult<Vec<Branch>> {
        self.read(Key::BranchIndex(project_id.clone()));
        let mut branches: Vec<Branch> = self
            .snapshot
            .branches
            .values()
            .filter(|branch| branch.project_id == *project_id)
            .cloned()
            .collect();
        branches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(branches)
    }

    async fn delete_branch(&mut self, branch_id: &Uid) -> EngineResult<bool> {
        let Some(branch) = self.snapshot.branches.remove(branch_id) else {
            return Ok(false);
        };
        self.write(Key::Branch(branch_id.clone()));
        self.write(Key::BranchIndex(branch.project_id.clone()));
        Ok(true)
    }

    async fn branch_has_children(&mut self, branch_id: &Uid) -> EngineResult<bool> {
        let Some(branch) = self.snapshot.branches.get(branch_id).cloned() else {
            return Ok(false);
        };
        self.read(Key::BranchIndex(branch.project_id.clone()));
        let sibling_ids: Vec<Uid> = self
            .snapshot
            .branches
            .values()
            .filter(|other| other.project_id == branch.project_id && other.id != *branch_id)
            .map(|other| other.id.clone())
            .collect();
        for sibling_id in sibling_ids {
            self.read(Key::RevisionIndex(sibling_id.clone()));
            let forked_here = self.snapshot.revisions.values().any(|revision| {
                revision.branch_id == sibling_id
                    && revision.is_start
                    && revision
                        .parent_id
                        .as_ref()
                        .and_then(|parent_id| self.snapshot.revisions.get(parent_id))
                        .map(|parent| parent.branch_id == *branch_id)
                        .unwrap_or(false)
            });
            if forked_here {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // -- revisions ----------------------------------------------------------

    async fn insert_revision(&mut self, revision: &Revision) -> EngineResult<()> {
        self.write(Key::Revision(revision.id.clone()));
        self.write(Key::RevisionIndex(revision.branch_id.clone()));
        self.snapshot
            .revisions
            .insert(revision.id.clone(), revision.clone());
        Ok(())
    }

    async fn get_revision(&mut self, revision_id: &Uid) -> EngineResult<Option<Revision>> {
        self.read(Key::Revision(revision_id.clone()));
        Ok(self.snapshot.revisions.get(revision_id).cloned())
    }

    async fn get_head_revision(&mut self, branch_id: &Uid) -> EngineResult<Option<Revision>> {
        self.read(Key::RevisionIndex(branch_id.clone()));
        let head = self
            .snapshot
            .revisions
            .values()
            .find(|revision| revision.branch_id == *branch_id && revision.is_head)
            .cloned();
        if let Some(revision) = &head {
            self.read(Key::Revision(revision.id.clone()));
        }
        Ok(head)
    }

    async fn get_draft_revision(&mut self, branch_id: &Uid) -> EngineResult<Option<Revision>> {
        self.read(Key::RevisionIndex(branch_id.clone()));
        let draft = self
            .snapshot
            .revisions
            .values()
            .find(|revision| revision.branch_id == *branch_id && revision.is_draft)
            .cloned();
        if let Some(revision) = &draft {
            self.read(Key::Revision(revision.id.clone()));
        }
        Ok(draft)
    }

    async fn update_revision(&mut self, revision: &Revision) -> EngineResult<()> {
        self.write(Key::Revision(revision.id.clone()));
        self.write(Key::RevisionIndex(revision.branch_id.clone()));
        self.snapshot
            .revisions
            .insert(revision.id.clone(), revision.clone());
        Ok(())
    }

    async fn list_revisions(&mut self, branch_id: &Uid) -> EngineResult<Vec<Revision>> {
        self.read(Key::RevisionIndex(branch_id.clone()));
        let mut revisions: Vec<Revision> = self
            .snapshot
            .revisions
            .values()
            .filter(|revision| revision.branch_id == *branch_id)
            .cloned()
            .collect();
        revisions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(revisions)
    }

    async fn delete_revision(&mut self, revision_id: &Uid) -> EngineResult<()> {
        if let Some(revision) = self.snapshot.revisions.remove(revision_id) {
            self.write(Key::Revision(revision_id.clone()));
            self.write(Key::RevisionIndex(revision.branch_id.clone()));
        }
        if self.snapshot.revision_tables.remove(revision_id).is_some() {
            self.write(Key::RevisionTables(revision_id.clone()));
        }
        Ok(())
    }

    // -- changelogs ---------------------------------------------------------

    async fn insert_changelog(&mut self, changelog: &Changelog) -> EngineResult<()> {
        self.write(Key::Changelog(changelog.revision_id.clone()));
        self.snapshot
            .changelogs
            .insert(changelog.revision_id.clone(), changelog.clone());
        Ok(())
    }

    async fn get_changelog(&mut self, revision_id: &Uid) -> EngineResult<Option<Changelog>> {
        self.read(Key::Changelog(revision_id.clone()));
        Ok(self.snapshot.changelogs.get(revision_id).cloned())
    }

    async fn update_changelog(&mut self, changelog: &Changelog) -> EngineResult<()> {
        self.insert_changelog(changelog).await
    }

    async fn delete_changelog(&mut self, revision_id: &Uid) -> EngineResult<()> {
        if self.snapshot.changelogs.remove(revision_id).is_some() {
            self.write(Key::Changelog(revision_id.clone()));
        }
        Ok(())
    }

    // -- table versions -----------------------------------------------------

    async fn insert_table_version(&mut self, table: &TableVersion) -> EngineResult<()> {
        self.write(Key::Table(table.version_id.clone()));
        self.snapshot
            .tables
            .insert(table.version_id.clone(), table.clone());
        Ok(())
    }

    async fn update_table_version(&mut self, table: &TableVersion) -> EngineResult<()> {
        self.insert_table_version(table).await
    }

    async fn delete_table_version(&mut self, version_id: &Uid) -> EngineResult<()> {
        if self.snapshot.tables.remove(version_id).is_some() {
            self.write(Key::Table(version_id.clone()));
        }
        if self.snapshot.table_rows.remove(version_id).is_some() {
            self.write(Key::TableRows(version_id.clone()));
        }
        Ok(())
    }

    async fn find_table(
        &mut self,
        revision_id: &Uid,
        table_id: &Id,
    ) -> EngineResult<Option<TableVersion>> {
        self.read(Key::RevisionTables(revision_id.clone()));
        for version_id in self.table_set(revision_id) {
            self.reads.insert(Key::Table(version_id.clone()));
            if let Some(table) = self.snapshot.tables.get(&version_id) {
                if table.id == *table_id {
                    return Ok(Some(table.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn list_tables(
        &mut self,
        revision_id: &Uid,
        include_system: bool,
    ) -> EngineResult<Vec<TableVersion>> {
        self.read(Key::RevisionTables(revision_id.clone()));
        let mut tables = Vec::new();
        for version_id in self.table_set(revision_id) {
            self.reads.insert(Key::Table(version_id.clone()));
            if let Some(table) = self.snapshot.tables.get(&version_id) {
                if include_system || !table.system {
                    tables.push(table.clone());
                }
            }
        }
        tables.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tables)
    }

    async fn connect_table(&mut self, revision_id: &Uid, version_id: &Uid) -> EngineResult<()> {
        self.write(Key::RevisionTables(revision_id.clone()));
        self.snapshot
            .revision_tables
            .entry(revision_id.clone())
            .or_default()
            .insert(version_id.clone());
        Ok(())
    }

    async fn disconnect_table(&mut self, revision_id: &Uid, version_id: &Uid) -> EngineResult<()> {
        self.write(Key::RevisionTables(revision_id.clone()));
        if let Some(set) = self.snapshot.revision_tables.get_mut(revision_id) {
            set.remove(version_id);
        }
        Ok(())
    }

    async fn copy_table_links(
        &mut self,
        from_revision_id: &Uid,
        to_revision_id: &Uid,
    ) -> EngineResult<()> {
        self.read(Key::RevisionTables(from_revision_id.clone()));
        self.write(Key::RevisionTables(to_revision_id.clone()));
        let links = self.table_set(from_revision_id);
        let target = self
            .snapshot
            .revision_tables
            .entry(to_revision_id.clone())
            .or_default();
        target.extend(links);
        Ok(())
    }

    async fn replace_table_links(
        &mut self,
        revision_id: &Uid,
        source_revision_id: &Uid,
    ) -> EngineResult<()> {
        self.read(Key::RevisionTables(source_revision_id.clone()));
        self.write(Key::RevisionTables(revision_id.clone()));
        let links = self.table_set(source_revision_id);
        self.snapshot
            .revision_tables
            .insert(revision_id.clone(), links);
        Ok(())
    }

    async fn count_table_links(&mut self, version_id: &Uid) -> EngineResult<i64> {
        let mut count = 0;
        for (revision_id, set) in &self.snapshot.revision_tables {
            self.reads.insert(Key::RevisionTables(revision_id.clone()));
            if set.contains(version_id) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn seal_revision_versions(&mut self, revision_id: &Uid) -> EngineResult<()> {
        self.read(Key::RevisionTables(revision_id.clone()));
        for table_version_id in self.table_set(revision_id) {
            self.writes.insert(Key::Table(table_version_id.clone()));
            if let Some(table) = self.snapshot.tables.get_mut(&table_version_id) {
                table.readonly = true;
            }
            self.reads.insert(Key::TableRows(table_version_id.clone()));
            for row_version_id in self.row_set(&table_version_id) {
                self.writes.insert(Key::Row(row_version_id.clone()));
                if let Some(row) = self.snapshot.rows.get_mut(&row_version_id) {
                    row.readonly = true;
                }
            }
        }
        Ok(())
    }

    // -- row versions -------------------------------------------------------

    async fn insert_row_versions(&mut self, rows: &[RowVersion]) -> EngineResult<()> {
        for row in rows {
            self.write(Key::Row(row.version_id.clone()));
            self.snapshot.rows.insert(row.version_id.clone(), row.clone());
        }
        Ok(())
    }

    async fn update_row_version(&mut self, row: &RowVersion) -> EngineResult<()> {
        self.write(Key::Row(row.version_id.clone()));
        self.snapshot.rows.insert(row.version_id.clone(), row.clone());
        Ok(())
    }

    async fn delete_row_versions(&mut self, version_ids: &[Uid]) -> EngineResult<()> {
        for version_id in version_ids {
            if self.snapshot.rows.remove(version_id).is_some() {
                self.write(Key::Row(version_id.clone()));
            }
        }
        Ok(())
    }

    async fn find_row(
        &mut self,
        table_version_id: &Uid,
        row_id: &Id,
    ) -> EngineResult<Option<RowVersion>> {
        self.read(Key::TableRows(table_version_id.clone()));
        for version_id in self.row_set(table_version_id) {
            self.reads.insert(Key::Row(version_id.clone()));
            if let Some(row) = self.snapshot.rows.get(&version_id) {
                if row.id == *row_id {
                    return Ok(Some(row.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn find_rows(
        &mut self,
        table_version_id: &Uid,
        row_ids: &[Id],
    ) -> EngineResult<Vec<RowVersion>> {
        self.read(Key::TableRows(table_version_id.clone()));
        let mut by_id: HashMap<Id, RowVersion> = HashMap::new();
        for version_id in self.row_set(table_version_id) {
            self.reads.insert(Key::Row(version_id.clone()));
            if let Some(row) = self.snapshot.rows.get(&version_id) {
                if row_ids.contains(&row.id) {
                    by_id.insert(row.id.clone(), row.clone());
                }
            }
        }
        Ok(row_ids
            .iter()
            .filter_map(|row_id| by_id.remove(row_id))
            .collect())
    }

    async fn list_rows(
        &mut self,
        table_version_id: &Uid,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<RowVersion>> {
        self.read(Key::TableRows(table_version_id.clone()));
        let mut rows = Vec::new();
        for version_id in self.row_set(table_version_id) {
            self.reads.insert(Key::Row(version_id.clone()));
            if let Some(row) = self.snapshot.rows.get(&version_id) {
                rows.push(row.clone());
            }
        }
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_rows(&mut self, table_version_id: &Uid) -> EngineResult<i64> {
        self.read(Key::TableRows(table_version_id.clone()));
        Ok(self.row_set(table_version_id).len() as i64)
    }

    async fn connect_rows(
        &mut self,
        table_version_id: &Uid,
        version_ids: &[Uid],
    ) -> EngineResult<()> {
        self.write(Key::TableRows(table_version_id.clone()));
        let set = self
            .snapshot
            .table_rows
            .entry(table_version_id.clone())
            .or_default();
        set.extend(version_ids.iter().cloned());
        Ok(())
    }

    async fn disconnect_rows(
        &mut self,
        table_version_id: &Uid,
        version_ids: &[Uid],
    ) -> EngineResult<()> {
        self.write(Key::TableRows(table_version_id.clone()));
        if let Some(set) = self.snapshot.table_rows.get_mut(table_version_id) {
            for version_id in version_ids {
                set.remove(version_id);
            }
        }
        Ok(())
    }

    async fn copy_row_links(
        &mut self,
        from_table_version_id: &Uid,
        to_table_version_id: &Uid,
    ) -> EngineResult<()> {
        self.read(Key::TableRows(from_table_version_id.clone()));
        self.write(Key::TableRows(to_table_version_id.clone()));
        let links = self.row_set(from_table_version_id);
        let target = self
            .snapshot
            .table_rows
            .entry(to_table_version_id.clone())
            .or_default();
        target.extend(links);
        Ok(())
    }

    async fn count_row_links(&mut self, row_version_id: &Uid) -> EngineResult<i64> {
        let mut count = 0;
        for (table_version_id, set) in &self.snapshot.table_rows {
            self.reads.insert(Key::TableRows(table_version_id.clone()));
            if set.contains(row_version_id) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_row_links(&mut self, table_version_id: &Uid) -> EngineResult<Vec<Uid>> {
        self.read(Key::TableRows(table_version_id.clone()));
        Ok(self.row_set(table_version_id).into_iter().collect())
    }

    async fn count_rows_with_value_at_paths(
        &mut self,
        table_version_id: &Uid,
        paths: &[DataPath],
        value: &str,
    ) -> EngineResult<i64> {
        Ok(self.rows_matching(table_version_id, paths, value).len() as i64)
    }

    async fn find_rows_with_value_at_paths(
        &mut self,
        table_version_id: &Uid,
        paths: &[DataPath],
        value: &str,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<RowVersion>> {
        Ok(self
            .rows_matching(table_version_id, paths, value)
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    // -- lifecycle ----------------------------------------------------------

    async fn commit(self: Box<Self>) -> EngineResult<()> {
        let tx = *self;
        // Pure readers saw a consistent snapshot and validate trivially.
        if tx.writes.is_empty() {
            return Ok(());
        }
        let mut inner = tx.store.lock();

        if tx.begin_seq < inner.oldest_seq {
            // Validation history already pruned; abort conservatively.
            return Err(EngineError::SerializationConflict);
        }
        for (seq, write_set) in inner.log.iter().rev() {
            if *seq <= tx.begin_seq {
                break;
            }
            let conflicting = write_set
                .iter()
                .any(|key| tx.reads.contains(key) || tx.writes.contains(key));
            if conflicting {
                return Err(EngineError::SerializationConflict);
            }
        }

        for key in &tx.writes {
            apply_key(&mut inner.state, &tx.snapshot, key);
        }
        inner.seq += 1;
        let seq = inner.seq;
        inner.log.push_back((seq, tx.writes));
        while inner.log.len() > LOG_WINDOW {
            if let Some((pruned_seq, _)) = inner.log.pop_front() {
                inner.oldest_seq = pruned_seq;
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        Ok(())
    }
}

/// Copy the transaction's final value (or absence) for `key` into the
/// committed state. Index keys are phantom guards and carry no state.
fn apply_key(state: &mut State, snapshot: &State, key: &Key) {
    match key {
        Key::Branch(id) => match snapshot.branches.get(id) {
            Some(branch) => {
                state.branches.insert(id.clone(), branch.clone());
            }
            None => {
                state.branches.remove(id);
            }
        },
        Key::Revision(id) => match snapshot.revisions.get(id) {
            Some(revision) => {
                state.revisions.insert(id.clone(), revision.clone());
            }
            None => {
                state.revisions.remove(id);
            }
        },
        Key::Changelog(id) => match snapshot.changelogs.get(id) {
            Some(changelog) => {
                state.changelogs.insert(id.clone(), changelog.clone());
            }
            None => {
                state.changelogs.remove(id);
            }
        },
        Key::Table(id) => match snapshot.tables.get(id) {
            Some(table) => {
                state.tables.insert(id.clone(), table.clone());
            }
            None => {
                state.tables.remove(id);
            }
        },
        Key::Row(id) => match snapshot.rows.get(id) {
            Some(row) => {
                state.rows.insert(id.clone(), row.clone());
            }
            None => {
                state.rows.remove(id);
            }
        },
        Key::RevisionTables(id) => match snapshot.revision_tables.get(id) {
            Some(set) => {
                state.revision_tables.insert(id.clone(), set.clone());
            }
            None => {
                state.revision_tables.remove(id);
            }
        },
        Key::TableRows(id) => match snapshot.table_rows.get(id) {
            Some(set) => {
                state.table_rows.insert(id.clone(), set.clone());
            }
            None => {
                state.table_rows.remove(id);
            }
        },
        Key::BranchIndex(_) | Key::RevisionIndex(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Branch, TableVersion};

    async fn begin(store: &MemoryStore) -> Box<dyn StoreTx> {
        store.begin().await.unwrap()
    }

    #[tokio::test]
    async fn committed_writes_become_visible() {
        let store = MemoryStore::new();
        let branch = Branch::new_root("p1".to_string());

        let mut tx = begin(&store).await;
        tx.insert_branch(&branch).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = begin(&store).await;
        let loaded = tx.get_branch(&branch.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, branch.name);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn rolled_back_writes_vanish() {
        let store = MemoryStore::new();
        let branch = Branch::new_root("p1".to_string());

        let mut tx = begin(&store).await;
        tx.insert_branch(&branch).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = begin(&store).await;
        assert!(tx.get_branch(&branch.id).await.unwrap().is_none());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn write_write_conflict_aborts_second_committer() {
        let store = MemoryStore::new();
        let branch = Branch::new_root("p1".to_string());
        let mut tx = begin(&store).await;
        tx.insert_branch(&branch).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx1 = begin(&store).await;
        let mut tx2 = begin(&store).await;
        tx1.delete_branch(&branch.id).await.unwrap();
        tx2.delete_branch(&branch.id).await.unwrap();

        tx1.commit().await.unwrap();
        let result = tx2.commit().await;
        assert!(matches!(result, Err(EngineError::SerializationConflict)));
    }

    #[tokio::test]
    async fn read_write_conflict_aborts_reader() {
        let store = MemoryStore::new();
        let revision_id = "rev-1".to_string();
        let table = TableVersion::new("t1".into(), false);
        let mut tx = begin(&store).await;
        tx.insert_table_version(&table).await.unwrap();
        tx.connect_table(&revision_id, &table.version_id).await.unwrap();
        tx.commit().await.unwrap();

        // tx1 reads the revision's table set, tx2 rewires it.
        let mut tx1 = begin(&store).await;
        let found = tx1.find_table(&revision_id, &"t1".to_string()).await.unwrap();
        assert!(found.is_some());
        // tx1 acts on what it read.
        tx1.insert_table_version(&TableVersion::new("t2".into(), false))
            .await
            .unwrap();

        let mut tx2 = begin(&store).await;
        tx2.disconnect_table(&revision_id, &table.version_id)
            .await
            .unwrap();
        tx2.commit().await.unwrap();

        assert!(matches!(
            tx1.commit().await,
            Err(EngineError::SerializationConflict)
        ));
    }

    #[tokio::test]
    async fn disjoint_transactions_both_commit() {
        let store = MemoryStore::new();
        let mut tx1 = begin(&store).await;
        let mut tx2 = begin(&store).await;
        tx1.insert_branch(&Branch::new_root("p1".to_string()))
            .await
            .unwrap();
        tx2.insert_branch(&Branch::new_root("p2".to_string()))
            .await
            .unwrap();
        tx1.commit().await.unwrap();
        tx2.commit().await.unwrap();
    }

    #[tokio::test]
    async fn read_only_transactions_never_conflict() {
        let store = MemoryStore::new();
        let branch = Branch::new_root("p1".to_string());
        let mut tx = begin(&store).await;
        tx.insert_branch(&branch).await.unwrap();
        tx.commit().await.unwrap();

        let mut reader = begin(&store).await;
        reader.get_branch(&branch.id).await.unwrap();

        let mut writer = begin(&store).await;
        writer.delete_branch(&branch.id).await.unwrap();
        writer.commit().await.unwrap();

        // Pure readers validate trivially.
        reader.commit().await.unwrap();
    }

    #[tokio::test]
    async fn seal_marks_tables_and_rows_readonly() {
        let store = MemoryStore::new();
        let revision_id = "rev-1".to_string();
        let table = TableVersion::new("t1".into(), false);
        let row = crate::model::RowVersion::new(
            "r1".into(),
            serde_json::json!({"name": "x"}),
            "hash".into(),
        );

        let mut tx = begin(&store).await;
        tx.insert_table_version(&table).await.unwrap();
        tx.insert_row_versions(std::slice::from_ref(&row)).await.unwrap();
        tx.connect_table(&revision_id, &table.version_id).await.unwrap();
        tx.connect_rows(&table.version_id, &[row.version_id.clone()])
            .await
            .unwrap();
        tx.seal_revision_versions(&revision_id).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = begin(&store).await;
        let table = tx
            .find_table(&revision_id, &"t1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(table.readonly);
        let row = tx
            .find_row(&table.version_id, &"r1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(row.readonly);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn path_matching_counts_rows() {
        let store = MemoryStore::new();
        let table = TableVersion::new("posts".into(), false);
        let author = crate::model::RowVersion::new(
            "post-1".into(),
            serde_json::json!({"author": "user-1", "tags": [{"by": "user-2"}]}),
            "hash".into(),
        );
        let other = crate::model::RowVersion::new(
            "post-2".into(),
            serde_json::json!({"author": "user-3", "tags": []}),
            "hash".into(),
        );

        let mut tx = begin(&store).await;
        tx.insert_table_version(&table).await.unwrap();
        tx.insert_row_versions(&[author.clone(), other.clone()])
            .await
            .unwrap();
        tx.connect_rows(
            &table.version_id,
            &[author.version_id.clone(), other.version_id.clone()],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let author_path = crate::schema::SchemaPath::parse("/properties/author")
            .unwrap()
            .data_path();
        let tag_path = crate::schema::SchemaPath::parse("/properties/tags/items/properties/by")
            .unwrap()
            .data_path();
        let paths = vec![author_path, tag_path];

        let mut tx = begin(&store).await;
        assert_eq!(
            tx.count_rows_with_value_at_paths(&table.version_id, &paths, "user-1")
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            tx.count_rows_with_value_at_paths(&table.version_id, &paths, "user-2")
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            tx.count_rows_with_value_at_paths(&table.version_id, &paths, "user-9")
                .await
                .unwrap(),
            0
        );
        tx.rollback().await.unwrap();
    }
}
