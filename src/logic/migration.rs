use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::{EngineError, EngineResult};
use crate::logic::session::DraftSession;
use crate::logic::system::SystemTables;
use crate::model::{Id, Uid, MIGRATION_TABLE_ID};
use crate::schema::SchemaPatch;
use crate::store::traits::StoreTx;

/// One recorded schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "changeType", rename_all = "lowercase")]
pub enum MigrationChange {
    #[serde(rename_all = "camelCase")]
    Init { table_id: Id, schema: Value },
    #[serde(rename_all = "camelCase")]
    Update {
        table_id: Id,
        patches: Vec<SchemaPatch>,
    },
    #[serde(rename_all = "camelCase")]
    Rename { table_id: Id, next_table_id: Id },
    #[serde(rename_all = "camelCase")]
    Remove { table_id: Id },
}

/// A migration row of the reserved `Migration` system table.
///
/// Record ids are ULIDs, so lexical order is application order; a new record
/// must sort after the last applied one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub id: String,
    #[serde(flatten)]
    pub change: MigrationChange,
    pub applied_at: DateTime<Utc>,
}

/// The ordered migration ledger of a revision.
pub struct MigrationLog;

impl MigrationLog {
    /// Id of the last applied migration, if any.
    pub async fn last_id(tx: &mut dyn StoreTx, revision_id: &Uid) -> EngineResult<Option<String>> {
        let table = SystemTables::system_table(tx, revision_id, MIGRATION_TABLE_ID).await?;
        let rows = tx.list_rows(&table.version_id, 0, i64::MAX).await?;
        Ok(rows.into_iter().map(|row| row.id).max())
    }

    /// All records in application order.
    pub async fn list(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
    ) -> EngineResult<Vec<MigrationRecord>> {
        let table = SystemTables::system_table(tx, revision_id, MIGRATION_TABLE_ID).await?;
        let rows = tx.list_rows(&table.version_id, 0, i64::MAX).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record: MigrationRecord = serde_json::from_value(row.data)
                .map_err(|err| EngineError::invalid(format!("corrupt migration record: {err}")))?;
            records.push(record);
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    /// Append a freshly generated record for an in-process schema change.
    pub async fn append(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        change: MigrationChange,
    ) -> EngineResult<MigrationRecord> {
        let last = Self::last_id(tx, &session.revision.id).await?;
        let record = MigrationRecord {
            id: next_migration_id(last.as_deref()),
            change,
            applied_at: Utc::now(),
        };
        Self::store(tx, session, &record).await?;
        Ok(record)
    }

    /// Record an externally supplied migration (branch sync). Its id must
    /// sort lexically after the last applied one.
    pub async fn record_external(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        record: &MigrationRecord,
    ) -> EngineResult<()> {
        if let Some(last) = Self::last_id(tx, &session.revision.id).await? {
            if record.id.as_str() <= last.as_str() {
                return Err(EngineError::PreconditionFailed(format!(
                    "migration {} does not sort after the last applied migration {last}",
                    record.id
                )));
            }
        }
        Self::store(tx, session, record).await
    }

    /// Whether a record with this id is already part of the ledger.
    pub async fn contains(
        tx: &mut dyn StoreTx,
        revision_id: &Uid,
        migration_id: &str,
    ) -> EngineResult<bool> {
        let table = SystemTables::system_table(tx, revision_id, MIGRATION_TABLE_ID).await?;
        Ok(tx
            .find_row(&table.version_id, &migration_id.to_string())
            .await?
            .is_some())
    }

    async fn store(
        tx: &mut dyn StoreTx,
        session: &mut DraftSession,
        record: &MigrationRecord,
    ) -> EngineResult<()> {
        let data = serde_json::to_value(record)
            .map_err(|err| EngineError::invalid(format!("unserializable migration: {err}")))?;
        SystemTables::upsert_row(tx, session, MIGRATION_TABLE_ID, &record.id, data).await
    }
}

/// A ULID strictly greater than `last`. ULIDs generated within the same
/// millisecond are not ordered by construction, so regenerate on collision;
/// a backwards clock falls back to extending the previous id.
fn next_migration_id(last: Option<&str>) -> String {
    for _ in 0..4 {
        let candidate = Ulid::new().to_string();
        if last.map(|l| candidate.as_str() > l).unwrap_or(true) {
            return candidate;
        }
    }
    format!("{}0", last.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_ids_always_advance() {
        let mut last: Option<String> = None;
        for _ in 0..100 {
            let next = next_migration_id(last.as_deref());
            if let Some(previous) = &last {
                assert!(next.as_str() > previous.as_str());
            }
            last = Some(next);
        }
    }

    #[test]
    fn record_serialization_is_flat() {
        let record = MigrationRecord {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            change: MigrationChange::Rename {
                table_id: "posts".into(),
                next_table_id: "articles".into(),
            },
            applied_at: Utc::now(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["changeType"], json!("rename"));
        assert_eq!(value["tableId"], json!("posts"));
        assert_eq!(value["nextTableId"], json!("articles"));
        let parsed: MigrationRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn init_record_round_trips_schema() {
        let record = MigrationRecord {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            change: MigrationChange::Init {
                table_id: "posts".into(),
                schema: json!({"type": "object", "properties": {}, "required": [], "additionalProperties": false}),
            },
            applied_at: Utc::now(),
        };
        let value = serde_json::to_value(&record).unwrap();
        let parsed: MigrationRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }
}
