use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::common::{generate_uid, Id, Uid};

/// Table id -> affected row ids. Table-level entries use an empty set.
pub type ChangeMap = BTreeMap<Id, BTreeSet<Id>>;

/// Per-revision ledger of what changed since the revision's parent.
///
/// Entries are net-of-parent: deleting an entity that was inserted in the
/// same draft cancels the insert instead of recording a delete, and updating
/// an inserted entity stays an insert. Frozen once the revision becomes
/// head; reset to empty on revert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changelog {
    pub id: Uid,
    pub revision_id: Uid,
    pub table_inserts: ChangeMap,
    pub table_updates: ChangeMap,
    pub table_deletes: ChangeMap,
    pub row_inserts: ChangeMap,
    pub row_updates: ChangeMap,
    pub row_deletes: ChangeMap,
    pub table_inserts_count: i64,
    pub table_updates_count: i64,
    pub table_deletes_count: i64,
    pub row_inserts_count: i64,
    pub row_updates_count: i64,
    pub row_deletes_count: i64,
    pub has_changes: bool,
}

impl Changelog {
    pub fn new(revision_id: Uid) -> Self {
        Self {
            id: generate_uid(),
            revision_id,
            table_inserts: ChangeMap::new(),
            table_updates: ChangeMap::new(),
            table_deletes: ChangeMap::new(),
            row_inserts: ChangeMap::new(),
            row_updates: ChangeMap::new(),
            row_deletes: ChangeMap::new(),
            table_inserts_count: 0,
            table_updates_count: 0,
            table_deletes_count: 0,
            row_inserts_count: 0,
            row_updates_count: 0,
            row_deletes_count: 0,
            has_changes: false,
        }
    }

    pub fn add_table_insert(&mut self, table_id: &str) {
        self.table_deletes.remove(table_id);
        self.table_inserts.insert(table_id.to_string(), BTreeSet::new());
        self.refresh();
    }

    pub fn add_table_update(&mut self, table_id: &str) {
        if !self.table_inserts.contains_key(table_id) {
            self.table_updates.insert(table_id.to_string(), BTreeSet::new());
        }
        self.refresh();
    }

    pub fn add_table_delete(&mut self, table_id: &str) {
        let was_inserted = self.table_inserts.remove(table_id).is_some();
        self.table_updates.remove(table_id);
        self.row_inserts.remove(table_id);
        self.row_updates.remove(table_id);
        self.row_deletes.remove(table_id);
        if !was_inserted {
            self.table_deletes.insert(table_id.to_string(), BTreeSet::new());
        }
        self.refresh();
    }

    /// Rekey every map entry when a table changes its logical id.
    pub fn rename_table(&mut self, old_id: &str, new_id: &str) {
        for map in [
            &mut self.table_inserts,
            &mut self.table_updates,
            &mut self.table_deletes,
            &mut self.row_inserts,
            &mut self.row_updates,
            &mut self.row_deletes,
        ] {
            if let Some(rows) = map.remove(old_id) {
                map.insert(new_id.to_string(), rows);
            }
        }
        self.refresh();
    }

    pub fn add_row_insert(&mut self, table_id: &str, row_id: &str) {
        if let Some(deleted) = self.row_deletes.get_mut(table_id) {
            deleted.remove(row_id);
            if deleted.is_empty() {
                self.row_deletes.remove(table_id);
            }
        }
        self.row_inserts
            .entry(table_id.to_string())
            .or_default()
            .insert(row_id.to_string());
        self.refresh();
    }

    pub fn add_row_update(&mut self, table_id: &str, row_id: &str) {
        let inserted = self
            .row_inserts
            .get(table_id)
            .map(|rows| rows.contains(row_id))
            .unwrap_or(false);
        if !inserted {
            self.row_updates
                .entry(table_id.to_string())
                .or_default()
                .insert(row_id.to_string());
        }
        self.refresh();
    }

    pub fn add_row_delete(&mut self, table_id: &str, row_id: &str) {
        let mut was_inserted = false;
        if let Some(inserted) = self.row_inserts.get_mut(table_id) {
            was_inserted = inserted.remove(row_id);
            if inserted.is_empty() {
                self.row_inserts.remove(table_id);
            }
        }
        if let Some(updated) = self.row_updates.get_mut(table_id) {
            updated.remove(row_id);
            if updated.is_empty() {
                self.row_updates.remove(table_id);
            }
        }
        if !was_inserted {
            self.row_deletes
                .entry(table_id.to_string())
                .or_default()
                .insert(row_id.to_string());
        }
        self.refresh();
    }

    pub fn rename_row(&mut self, table_id: &str, old_id: &str, new_id: &str) {
        for map in [&mut self.row_inserts, &mut self.row_updates] {
            if let Some(rows) = map.get_mut(table_id) {
                if rows.remove(old_id) {
                    rows.insert(new_id.to_string());
                }
            }
        }
        self.refresh();
    }

    /// Discard every entry, e.g. when the draft is reverted to head.
    pub fn reset(&mut self) {
        self.table_inserts.clear();
        self.table_updates.clear();
        self.table_deletes.clear();
        self.row_inserts.clear();
        self.row_updates.clear();
        self.row_deletes.clear();
        self.refresh();
    }

    fn refresh(&mut self) {
        self.table_inserts_count = self.table_inserts.len() as i64;
        self.table_updates_count = self.table_updates.len() as i64;
        self.table_deletes_count = self.table_deletes.len() as i64;
        self.row_inserts_count = Self::row_count(&self.row_inserts);
        self.row_updates_count = Self::row_count(&self.row_updates);
        self.row_deletes_count = Self::row_count(&self.row_deletes);
        self.has_changes = self.table_inserts_count
            + self.table_updates_count
            + self.table_deletes_count
            + self.row_inserts_count
            + self.row_updates_count
            + self.row_deletes_count
            > 0;
    }

    fn row_count(map: &ChangeMap) -> i64 {
        map.values().map(|rows| rows.len() as i64).sum()
    }
}
