use anyhow::Context;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::config::AppConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{Branch, Changelog, Id, Revision, RowVersion, TableVersion, Uid};
use crate::schema::{DataPath, DataStep};
use crate::store::traits::{Store, StoreTx};

/// PostgreSQL storage backend.
///
/// Transactions run at SERIALIZABLE isolation; SQLSTATE 40001/40P01 becomes
/// `SerializationConflict` so the coordinator replays the operation. All
/// queries bind parameters at runtime; identifiers that end up inside
/// jsonpath expressions come from identifier-validated schema paths.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> EngineResult<Self> {
        Self::with_max_connections(database_url, 20).await
    }

    pub async fn with_max_connections(
        database_url: &str,
        max_connections: u32,
    ) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to create PostgreSQL connection pool")
            .map_err(EngineError::Storage)?;
        Ok(Self { pool })
    }

    pub async fn connect(config: &AppConfig) -> EngineResult<Self> {
        let url = config.database_url().map_err(EngineError::Storage)?;
        Self::with_max_connections(&url, config.database.max_connections.unwrap_or(20)).await
    }

    /// Run the schema migrations embedded from `./migrations`.
    pub async fn migrate(&self) -> EngineResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run database migrations")
            .map_err(EngineError::Storage)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> EngineResult<Box<dyn StoreTx>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        Ok(Box::new(PostgresTx { tx }))
    }
}

struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

fn map_sqlx(err: sqlx::Error) -> EngineError {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(code) = db_err.code() {
            if code == "40001" || code == "40P01" {
                return EngineError::SerializationConflict;
            }
        }
    }
    EngineError::storage(err)
}

fn branch_from_row(row: &PgRow) -> Branch {
    Branch {
        id: row.get("id"),
        project_id: row.get("project_id"),
        name: row.get("name"),
        is_root: row.get("is_root"),
        created_at: row.get("created_at"),
    }
}

fn revision_from_row(row: &PgRow) -> Revision {
    Revision {
        id: row.get("id"),
        branch_id: row.get("branch_id"),
        parent_id: row.get("parent_id"),
        is_head: row.get("is_head"),
        is_draft: row.get("is_draft"),
        is_start: row.get("is_start"),
        has_changes: row.get("has_changes"),
        comment: row.get("comment"),
        created_at: row.get("created_at"),
    }
}

fn table_from_row(row: &PgRow) -> TableVersion {
    TableVersion {
        version_id: row.get("version_id"),
        id: row.get("id"),
        created_id: row.get("created_id"),
        readonly: row.get("readonly"),
        system: row.get("is_system"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_from_row(row: &PgRow) -> RowVersion {
    RowVersion {
        version_id: row.get("version_id"),
        id: row.get("id"),
        created_id: row.get("created_id"),
        readonly: row.get("readonly"),
        data: row.get("data"),
        meta: row.get("meta"),
        hash: row.get("hash"),
        schema_hash: row.get("schema_hash"),
        published_at: row.get("published_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn changelog_from_row(row: &PgRow) -> EngineResult<Changelog> {
    let parse = |column: &str| -> EngineResult<crate::model::ChangeMap> {
        serde_json::from_value(row.get::<serde_json::Value, _>(column))
            .map_err(EngineError::storage)
    };
    Ok(Changelog {
        id: row.get("id"),
        revision_id: row.get("revision_id"),
        table_inserts: parse("table_inserts")?,
        table_updates: parse("table_updates")?,
        table_deletes: parse("table_deletes")?,
        row_inserts: parse("row_inserts")?,
        row_updates: parse("row_updates")?,
        row_deletes: parse("row_deletes")?,
        table_inserts_count: row.get("table_inserts_count"),
        table_updates_count: row.get("table_updates_count"),
        table_deletes_count: row.get("table_deletes_count"),
        row_inserts_count: row.get("row_inserts_count"),
        row_updates_count: row.get("row_updates_count"),
        row_deletes_count: row.get("row_deletes_count"),
        has_changes: row.get("has_changes"),
    })
}

const ROW_COLUMNS: &str = "r.version_id, r.id, r.created_id, r.readonly, r.data, r.meta, \
                           r.hash, r.schema_hash, r.published_at, r.created_at, r.updated_at";

enum PathParam {
    Segments(Vec<String>),
    JsonPath(String),
}

/// Build the OR-of-path-equality predicate for reference counting. Plain
/// field paths compare with `#>>`; paths crossing arrays use
/// `jsonb_path_exists`. Every segment is re-checked against the identifier
/// allow-list before it reaches a jsonpath literal.
fn path_predicates(
    paths: &[DataPath],
    first_param: usize,
) -> EngineResult<(String, Vec<PathParam>)> {
    let mut clauses = Vec::with_capacity(paths.len());
    let mut params = Vec::with_capacity(paths.len());
    let mut param = first_param;
    for path in paths {
        for step in &path.steps {
            if let DataStep::Field(name) = step {
                if !crate::model::is_valid_ident(name) {
                    return Err(EngineError::invalid(format!(
                        "illegal path segment `{name}`"
                    )));
                }
            }
        }
        if path.contains_arrays() {
            let mut jsonpath = String::from("$");
            for step in &path.steps {
                match step {
                    DataStep::Field(name) => {
                        jsonpath.push('.');
                        jsonpath.push_str(name);
                    }
                    DataStep::AnyItem => jsonpath.push_str("[*]"),
                }
            }
            jsonpath.push_str(" ? (@ == $v)");
            clauses.push(format!(
                "jsonb_path_exists(r.data, ${param}::jsonpath, jsonb_build_object('v', $2::text))"
            ));
            params.push(PathParam::JsonPath(jsonpath));
        } else {
            clauses.push(format!("r.data #>> ${param}::text[] = $2"));
            let segments = path
                .steps
                .iter()
                .map(|step| match step {
                    DataStep::Field(name) => name.clone(),
                    DataStep::AnyItem => unreachable!("array-free path"),
                })
                .collect();
            params.push(PathParam::Segments(segments));
        }
        param += 1;
    }
    Ok((clauses.join(" OR "), params))
}

#[async_trait::async_trait]
impl StoreTx for PostgresTx {
    // -- branches -----------------------------------------------------------

    async fn insert_branch(&mut self, branch: &Branch) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO branches (id, project_id, name, is_root, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&branch.id)
        .bind(&branch.project_id)
        .bind(&branch.name)
        .bind(branch.is_root)
        .bind(branch.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_branch(&mut self, branch_id: &Uid) -> EngineResult<Option<Branch>> {
        let row = sqlx::query(
            "SELECT id, project_id, name, is_root, created_at FROM branches WHERE id = $1",
        )
        .bind(branch_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(row.as_ref().map(branch_from_row))
    }

    async fn find_branch_by_name(
        &mut self,
        project_id: &Uid,
        name: &str,
    ) -> EngineResult<Option<Branch>> {
        let row = sqlx::query(
            "SELECT id, project_id, name, is_root, created_at FROM branches \
             WHERE project_id = $1 AND lower(name) = lower($2)",
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(row.as_ref().map(branch_from_row))
    }

    async fn list_branches(&mut self, project_id: &Uid) -> EngineResult<Vec<Branch>> {
        let rows = sqlx::query(
            "SELECT id, project_id, name, is_root, created_at FROM branches \
             WHERE project_id = $1 ORDER BY created_at",
        )
        .bind(project_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.iter().map(branch_from_row).collect())
    }

    async fn delete_branch(&mut self, branch_id: &Uid) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM branches WHERE id = $1")
            .bind(branch_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn branch_has_children(&mut self, branch_id: &Uid) -> EngineResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS ( \
                 SELECT 1 FROM revisions child_start \
                 JOIN revisions parent ON parent.id = child_start.parent_id \
                 WHERE child_start.is_start \
                   AND child_start.branch_id <> $1 \
                   AND parent.branch_id = $1 \
             ) AS has_children",
        )
        .bind(branch_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(row.get("has_children"))
    }

    // -- revisions ----------------------------------------------------------

    async fn insert_revision(&mut self, revision: &Revision) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO revisions \
             (id, branch_id, parent_id, is_head, is_draft, is_start, has_changes, comment, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&revision.id)
        .bind(&revision.branch_id)
        .bind(&revision.parent_id)
        .bind(revision.is_head)
        .bind(revision.is_draft)
        .bind(revision.is_start)
        .bind(revision.has_changes)
        .bind(&revision.comment)
        .bind(revision.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_revision(&mut self, revision_id: &Uid) -> EngineResult<Option<Revision>> {
        let row = sqlx::query("SELECT * FROM revisions WHERE id = $1")
            .bind(revision_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.as_ref().map(revision_from_row))
    }

    async fn get_head_revision(&mut self, branch_id: &Uid) -> EngineResult<Option<Revision>> {
        let row = sqlx::query("SELECT * FROM revisions WHERE branch_id = $1 AND is_head LIMIT 1")
            .bind(branch_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.as_ref().map(revision_from_row))
    }

    async fn get_draft_revision(&mut self, branch_id: &Uid) -> EngineResult<Option<Revision>> {
        let row = sqlx::query("SELECT * FROM revisions WHERE branch_id = $1 AND is_draft LIMIT 1")
            .bind(branch_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.as_ref().map(revision_from_row))
    }

    async fn update_revision(&mut self, revision: &Revision) -> EngineResult<()> {
        sqlx::query(
            "UPDATE revisions SET is_head = $2, is_draft = $3, is_start = $4, \
             has_changes = $5, comment = $6, parent_id = $7 WHERE id = $1",
        )
        .bind(&revision.id)
        .bind(revision.is_head)
        .bind(revision.is_draft)
        .bind(revision.is_start)
        .bind(revision.has_changes)
        .bind(&revision.comment)
        .bind(&revision.parent_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_revisions(&mut self, branch_id: &Uid) -> EngineResult<Vec<Revision>> {
        let rows =
            sqlx::query("SELECT * FROM revisions WHERE branch_id = $1 ORDER BY created_at, id")
                .bind(branch_id)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
        Ok(rows.iter().map(revision_from_row).collect())
    }

    async fn delete_revision(&mut self, revision_id: &Uid) -> EngineResult<()> {
        sqlx::query("DELETE FROM revision_tables WHERE revision_id = $1")
            .bind(revision_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        sqlx::query("DELETE FROM revisions WHERE id = $1")
            .bind(revision_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    // -- changelogs ---------------------------------------------------------

    async fn insert_changelog(&mut self, changelog: &Changelog) -> EngineResult<()> {
        self.update_changelog(changelog).await
    }

    async fn get_changelog(&mut self, revision_id: &Uid) -> EngineResult<Option<Changelog>> {
        let row = sqlx::query("SELECT * FROM changelogs WHERE revision_id = $1")
            .bind(revision_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(changelog_from_row).transpose()
    }

    async fn update_changelog(&mut self, changelog: &Changelog) -> EngineResult<()> {
        let to_json = |map: &crate::model::ChangeMap| -> EngineResult<serde_json::Value> {
            serde_json::to_value(map).map_err(EngineError::storage)
        };
        sqlx::query(
            "INSERT INTO changelogs \
             (revision_id, id, table_inserts, table_updates, table_deletes, \
              row_inserts, row_updates, row_deletes, \
              table_inserts_count, table_updates_count, table_deletes_count, \
              row_inserts_count, row_updates_count, row_deletes_count, has_changes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (revision_id) DO UPDATE SET \
                 table_inserts = EXCLUDED.table_inserts, \
                 table_updates = EXCLUDED.table_updates, \
                 table_deletes = EXCLUDED.table_deletes, \
                 row_inserts = EXCLUDED.row_inserts, \
                 row_updates = EXCLUDED.row_updates, \
                 row_deletes = EXCLUDED.row_deletes, \
                 table_inserts_count = EXCLUDED.table_inserts_count, \
                 table_updates_count = EXCLUDED.table_updates_count, \
                 table_deletes_count = EXCLUDED.table_deletes_count, \
                 row_inserts_count = EXCLUDED.row_inserts_count, \
                 row_updates_count = EXCLUDED.row_updates_count, \
                 row_deletes_count = EXCLUDED.row_deletes_count, \
                 has_changes = EXCLUDED.has_changes",
        )
        .bind(&changelog.revision_id)
        .bind(&changelog.id)
        .bind(to_json(&changelog.table_inserts)?)
        .bind(to_json(&changelog.table_updates)?)
        .bind(to_json(&changelog.table_deletes)?)
        .bind(to_json(&changelog.row_inserts)?)
        .bind(to_json(&changelog.row_updates)?)
        .bind(to_json(&changelog.row_deletes)?)
        .bind(changelog.table_inserts_count)
        .bind(changelog.table_updates_count)
        .bind(changelog.table_deletes_count)
        .bind(changelog.row_inserts_count)
        .bind(changelog.row_updates_count)
        .bind(changelog.row_deletes_count)
        .bind(changelog.has_changes)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_changelog(&mut self, revision_id: &Uid) -> EngineResult<()> {
        sqlx::query("DELETE FROM changelogs WHERE revision_id = $1")
            .bind(revision_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    // -- table versions -----------------------------------------------------

    async fn insert_table_version(&mut self, table: &TableVersion) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO table_versions \
             (version_id, id, created_id, readonly, is_system, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&table.version_id)
        .bind(&table.id)
        .bind(&table.created_id)
        .bind(table.readonly)
        .bind(table.system)
        .bind(table.created_at)
        .bind(table.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_table_version(&mut self, table: &TableVersion) -> EngineResult<()> {
        sqlx::query(
            "UPDATE table_versions SET id = $2, readonly = $3, updated_at = $4 \
             WHERE version_id = $1",
        )
        .bind(&table.version_id)
        .bind(&table.id)
        .bind(table.readonly)
        .bind(table.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_table_version(&mut self, version_id: &Uid) -> EngineResult<()> {
        sqlx::query("DELETE FROM table_rows WHERE table_version_id = $1")
            .bind(version_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        sqlx::query("DELETE FROM table_versions WHERE version_id = $1")
            .bind(version_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn find_table(
        &mut self,
        revision_id: &Uid,
        table_id: &Id,
    ) -> EngineResult<Option<TableVersion>> {
        let row = sqlx::query(
            "SELECT t.* FROM table_versions t \
             JOIN revision_tables rt ON rt.table_version_id = t.version_id \
             WHERE rt.revision_id = $1 AND t.id = $2",
        )
        .bind(revision_id)
        .bind(table_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(row.as_ref().map(table_from_row))
    }

    async fn list_tables(
        &mut self,
        revision_id: &Uid,
        include_system: bool,
    ) -> EngineResult<Vec<TableVersion>> {
        let rows = sqlx::query(
            "SELECT t.* FROM table_versions t \
             JOIN revision_tables rt ON rt.table_version_id = t.version_id \
             WHERE rt.revision_id = $1 AND ($2 OR NOT t.is_system) \
             ORDER BY t.id",
        )
        .bind(revision_id)
        .bind(include_system)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.iter().map(table_from_row).collect())
    }

    async fn connect_table(&mut self, revision_id: &Uid, version_id: &Uid) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO revision_tables (revision_id, table_version_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(revision_id)
        .bind(version_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn disconnect_table(&mut self, revision_id: &Uid, version_id: &Uid) -> EngineResult<()> {
        sqlx::query("DELETE FROM revision_tables WHERE revision_id = $1 AND table_version_id = $2")
            .bind(revision_id)
            .bind(version_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn copy_table_links(
        &mut self,
        from_revision_id: &Uid,
        to_revision_id: &Uid,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO revision_tables (revision_id, table_version_id) \
             SELECT $2, table_version_id FROM revision_tables WHERE revision_id = $1 \
             ON CONFLICT DO NOTHING",
        )
        .bind(from_revision_id)
        .bind(to_revision_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn replace_table_links(
        &mut self,
        revision_id: &Uid,
        source_revision_id: &Uid,
    ) -> EngineResult<()> {
        sqlx::query("DELETE FROM revision_tables WHERE revision_id = $1")
            .bind(revision_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        self.copy_table_links(source_revision_id, revision_id).await
    }

    async fn count_table_links(&mut self, version_id: &Uid) -> EngineResult<i64> {
        let row =
            sqlx::query("SELECT count(*) AS links FROM revision_tables WHERE table_version_id = $1")
                .bind(version_id)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
        Ok(row.get("links"))
    }

    async fn seal_revision_versions(&mut self, revision_id: &Uid) -> EngineResult<()> {
        sqlx::query(
            "UPDATE table_versions SET readonly = TRUE WHERE version_id IN \
             (SELECT table_version_id FROM revision_tables WHERE revision_id = $1)",
        )
        .bind(revision_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        sqlx::query(
            "UPDATE row_versions SET readonly = TRUE WHERE version_id IN \
             (SELECT tr.row_version_id FROM table_rows tr \
              JOIN revision_tables rt ON rt.table_version_id = tr.table_version_id \
              WHERE rt.revision_id = $1)",
        )
        .bind(revision_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    // -- row versions -------------------------------------------------------

    async fn insert_row_versions(&mut self, rows: &[RowVersion]) -> EngineResult<()> {
        for row in rows {
            sqlx::query(
                "INSERT INTO row_versions \
                 (version_id, id, created_id, readonly, data, meta, hash, schema_hash, \
                  published_at, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(&row.version_id)
            .bind(&row.id)
            .bind(&row.created_id)
            .bind(row.readonly)
            .bind(&row.data)
            .bind(&row.meta)
            .bind(&row.hash)
            .bind(&row.schema_hash)
            .bind(row.published_at)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn update_row_version(&mut self, row: &RowVersion) -> EngineResult<()> {
        sqlx::query(
            "UPDATE row_versions SET id = $2, readonly = $3, data = $4, meta = $5, \
             hash = $6, schema_hash = $7, published_at = $8, updated_at = $9 \
             WHERE version_id = $1",
        )
        .bind(&row.version_id)
        .bind(&row.id)
        .bind(row.readonly)
        .bind(&row.data)
        .bind(&row.meta)
        .bind(&row.hash)
        .bind(&row.schema_hash)
        .bind(row.published_at)
        .bind(row.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_row_versions(&mut self, version_ids: &[Uid]) -> EngineResult<()> {
        sqlx::query("DELETE FROM table_rows WHERE row_version_id = ANY($1)")
            .bind(version_ids)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        sqlx::query("DELETE FROM row_versions WHERE version_id = ANY($1)")
            .bind(version_ids)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn find_row(
        &mut self,
        table_version_id: &Uid,
        row_id: &Id,
    ) -> EngineResult<Option<RowVersion>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM row_versions r \
             JOIN table_rows tr ON tr.row_version_id = r.version_id \
             WHERE tr.table_version_id = $1 AND r.id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(table_version_id)
            .bind(row_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.as_ref().map(row_from_row))
    }

    async fn find_rows(
        &mut self,
        table_version_id: &Uid,
        row_ids: &[Id],
    ) -> EngineResult<Vec<RowVersion>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM row_versions r \
             JOIN table_rows tr ON tr.row_version_id = r.version_id \
             WHERE tr.table_version_id = $1 AND r.id = ANY($2)"
        );
        let rows = sqlx::query(&sql)
            .bind(table_version_id)
            .bind(row_ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(rows.iter().map(row_from_row).collect())
    }

    async fn list_rows(
        &mut self,
        table_version_id: &Uid,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<RowVersion>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM row_versions r \
             JOIN table_rows tr ON tr.row_version_id = r.version_id \
             WHERE tr.table_version_id = $1 ORDER BY r.id OFFSET $2 LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(table_version_id)
            .bind(offset.max(0))
            .bind(limit.max(0))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(rows.iter().map(row_from_row).collect())
    }

    async fn count_rows(&mut self, table_version_id: &Uid) -> EngineResult<i64> {
        let row =
            sqlx::query("SELECT count(*) AS total FROM table_rows WHERE table_version_id = $1")
                .bind(table_version_id)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
        Ok(row.get("total"))
    }

    async fn connect_rows(
        &mut self,
        table_version_id: &Uid,
        version_ids: &[Uid],
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO table_rows (table_version_id, row_version_id) \
             SELECT $1, unnest($2::text[]) ON CONFLICT DO NOTHING",
        )
        .bind(table_version_id)
        .bind(version_ids)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn disconnect_rows(
        &mut self,
        table_version_id: &Uid,
        version_ids: &[Uid],
    ) -> EngineResult<()> {
        sqlx::query(
            "DELETE FROM table_rows WHERE table_version_id = $1 AND row_version_id = ANY($2)",
        )
        .bind(table_version_id)
        .bind(version_ids)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn copy_row_links(
        &mut self,
        from_table_version_id: &Uid,
        to_table_version_id: &Uid,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO table_rows (table_version_id, row_version_id) \
             SELECT $2, row_version_id FROM table_rows WHERE table_version_id = $1 \
             ON CONFLICT DO NOTHING",
        )
        .bind(from_table_version_id)
        .bind(to_table_version_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn count_row_links(&mut self, row_version_id: &Uid) -> EngineResult<i64> {
        let row = sqlx::query("SELECT count(*) AS links FROM table_rows WHERE row_version_id = $1")
            .bind(row_version_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.get("links"))
    }

    async fn list_row_links(&mut self, table_version_id: &Uid) -> EngineResult<Vec<Uid>> {
        let rows = sqlx::query(
            "SELECT row_version_id FROM table_rows WHERE table_version_id = $1 \
             ORDER BY row_version_id",
        )
        .bind(table_version_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("row_version_id"))
            .collect())
    }

    async fn count_rows_with_value_at_paths(
        &mut self,
        table_version_id: &Uid,
        paths: &[DataPath],
        value: &str,
    ) -> EngineResult<i64> {
        if paths.is_empty() {
            return Ok(0);
        }
        let (predicate, params) = path_predicates(paths, 3)?;
        let sql = format!(
            "SELECT count(*) AS hits FROM row_versions r \
             JOIN table_rows tr ON tr.row_version_id = r.version_id \
             WHERE tr.table_version_id = $1 AND ({predicate})"
        );
        let mut query = sqlx::query(&sql).bind(table_version_id).bind(value);
        for param in &params {
            query = match param {
                PathParam::Segments(segments) => query.bind(segments),
                PathParam::JsonPath(jsonpath) => query.bind(jsonpath),
            };
        }
        let row = query.fetch_one(&mut *self.tx).await.map_err(map_sqlx)?;
        Ok(row.get("hits"))
    }

    async fn find_rows_with_value_at_paths(
        &mut self,
        table_version_id: &Uid,
        paths: &[DataPath],
        value: &str,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<RowVersion>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let (predicate, params) = path_predicates(paths, 3)?;
        let offset_param = 3 + params.len();
        let limit_param = offset_param + 1;
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM row_versions r \
             JOIN table_rows tr ON tr.row_version_id = r.version_id \
             WHERE tr.table_version_id = $1 AND ({predicate}) \
             ORDER BY r.id OFFSET ${offset_param} LIMIT ${limit_param}"
        );
        let mut query = sqlx::query(&sql).bind(table_version_id).bind(value);
        for param in &params {
            query = match param {
                PathParam::Segments(segments) => query.bind(segments),
                PathParam::JsonPath(jsonpath) => query.bind(jsonpath),
            };
        }
        let rows = query
            .bind(offset.max(0))
            .bind(limit.max(0))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(rows.iter().map(row_from_row).collect())
    }

    // -- lifecycle ----------------------------------------------------------

    async fn commit(self: Box<Self>) -> EngineResult<()> {
        self.tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        self.tx.rollback().await.map_err(map_sqlx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaPath;

    #[test]
    fn plain_paths_become_text_array_lookups() {
        let paths = vec![SchemaPath::parse("/properties/author/properties/id")
            .unwrap()
            .data_path()];
        let (predicate, params) = path_predicates(&paths, 3).unwrap();
        assert_eq!(predicate, "r.data #>> $3::text[] = $2");
        match &params[0] {
            PathParam::Segments(segments) => {
                assert_eq!(segments, &vec!["author".to_string(), "id".to_string()])
            }
            PathParam::JsonPath(_) => panic!("expected segments"),
        }
    }

    #[test]
    fn array_paths_become_jsonpath_lookups() {
        let paths = vec![SchemaPath::parse("/properties/editors/items")
            .unwrap()
            .data_path()];
        let (predicate, params) = path_predicates(&paths, 3).unwrap();
        assert!(predicate.contains("jsonb_path_exists"));
        match &params[0] {
            PathParam::JsonPath(jsonpath) => {
                assert_eq!(jsonpath, "$.editors[*] ? (@ == $v)")
            }
            PathParam::Segments(_) => panic!("expected jsonpath"),
        }
    }

    #[test]
    fn mixed_paths_or_together() {
        let paths = vec![
            SchemaPath::parse("/properties/author").unwrap().data_path(),
            SchemaPath::parse("/properties/editors/items")
                .unwrap()
                .data_path(),
        ];
        let (predicate, params) = path_predicates(&paths, 3).unwrap();
        assert_eq!(params.len(), 2);
        assert!(predicate.contains(" OR "));
        assert!(predicate.contains("$3"));
        assert!(predicate.contains("$4"));
    }
}
