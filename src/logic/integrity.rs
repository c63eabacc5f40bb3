use log::debug;

use crate::error::{EngineError, EngineResult};
use crate::logic::system::SystemTables;
use crate::model::{Id, RowVersion, Uid};
use crate::schema::{collect_pointer_paths, DataPath, PointerKind, SchemaNode};
use crate::store::traits::StoreTx;

/// Referential integrity over schema-declared foreign-key/reference fields.
///
/// Schemas are scanned for string leaves pointing at a table; counting the
/// rows that actually hold a given id is pushed down to the storage layer as
/// one OR-of-path-equality query per referencing table. The engine never
/// iterates dataset contents.
pub struct IntegrityChecker;

/// A table whose schema points at the target, with the paths that do.
struct ReferencingTable {
    table_id: Id,
    paths: Vec<DataPath>,
}

impl IntegrityChecker {
    /// Fails while any other table's schema declares a foreign-key or
    /// reference field at `table_id`, regardless of row content.
    pub async fn assert_no_pointer_declarations(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        table_id: &Id,
    ) -> EngineResult<()> {
        for kind in [PointerKind::ForeignKey, PointerKind::Reference] {
            let referencing = Self::referencing_tables(tx, revision_id, kind, table_id).await?;
            // A table pointing at itself does not block its own removal.
            if let Some(blocker) = referencing
                .iter()
                .find(|entry| entry.table_id != *table_id)
            {
                return Err(EngineError::ReferentialIntegrity(format!(
                    "table {table_id} is referenced by the schema of table {}",
                    blocker.table_id
                )));
            }
        }
        Ok(())
    }

    /// Fails when any row of any referencing table holds `row_id` at a
    /// declared pointer path. The error names only the blocking condition,
    /// never which row, keeping the check O(paths).
    pub async fn assert_no_row_users(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        table_id: &Id,
        row_id: &Id,
    ) -> EngineResult<()> {
        for kind in [PointerKind::ForeignKey, PointerKind::Reference] {
            let count = Self::count_pointers_to(tx, revision_id, kind, table_id, row_id).await?;
            if count > 0 {
                return Err(EngineError::ReferentialIntegrity(
                    "related rows exist".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// How many rows across the revision point at `row_id` of `table_id`.
    pub async fn count_pointers_to(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        kind: PointerKind,
        table_id: &Id,
        row_id: &Id,
    ) -> EngineResult<i64> {
        let referencing = Self::referencing_tables(tx, revision_id, kind, table_id).await?;
        let mut total = 0;
        for entry in &referencing {
            let Some(table) = tx.find_table(revision_id, &entry.table_id).await? else {
                continue;
            };
            total += tx
                .count_rows_with_value_at_paths(&table.version_id, &entry.paths, row_id)
                .await?;
        }
        debug!("{total} pointer(s) at {table_id}/{row_id} in revision {revision_id}");
        Ok(total)
    }

    /// The rows pointing at `row_id`, paged, tagged with their table id.
    pub async fn resolve_pointers_to(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        kind: PointerKind,
        table_id: &Id,
        row_id: &Id,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<(Id, RowVersion)>> {
        let referencing = Self::referencing_tables(tx, revision_id, kind, table_id).await?;
        let mut out: Vec<(Id, RowVersion)> = Vec::new();
        let mut remaining_offset = offset.max(0);
        let mut remaining_limit = limit.max(0);
        for entry in &referencing {
            if remaining_limit == 0 {
                break;
            }
            let Some(table) = tx.find_table(revision_id, &entry.table_id).await? else {
                continue;
            };
            let rows = tx
                .find_rows_with_value_at_paths(
                    &table.version_id,
                    &entry.paths,
                    row_id,
                    remaining_offset,
                    remaining_limit,
                )
                .await?;
            if rows.is_empty() {
                // The whole table may still be consumed by the offset.
                let count = tx
                    .count_rows_with_value_at_paths(&table.version_id, &entry.paths, row_id)
                    .await?;
                remaining_offset = (remaining_offset - count).max(0);
                continue;
            }
            remaining_offset = 0;
            remaining_limit -= rows.len() as i64;
            out.extend(rows.into_iter().map(|row| (entry.table_id.clone(), row)));
        }
        Ok(out)
    }

    async fn referencing_tables(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        kind: PointerKind,
        table_id: &Id,
    ) -> EngineResult<Vec<ReferencingTable>> {
        let schemas = SystemTables::load_all_schemas(tx, revision_id).await?;
        let mut referencing = Vec::new();
        for (schema_table_id, document) in schemas {
            let node = SchemaNode::from_value(&document)?;
            let paths = collect_pointer_paths(&node, kind, table_id);
            if !paths.is_empty() {
                referencing.push(ReferencingTable {
                    table_id: schema_table_id,
                    paths,
                });
            }
        }
        Ok(referencing)
    }
}
