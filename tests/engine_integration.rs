use std::sync::Arc;

use serde_json::json;

use vellum_db::{
    Engine, EngineError, MemoryStore, MigrationOutcome, MigrationRecord, RequestContext, RowInput,
    SchemaPatch,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn setup() -> (Engine<MemoryStore>, RequestContext) {
    init_logging();
    let engine = Engine::new(MemoryStore::new());
    let fork = engine.init_project(&"proj-1".to_string()).await.unwrap();
    let ctx = RequestContext::new("proj-1", fork.draft.id.clone());
    (engine, ctx)
}

fn name_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "name": {"type": "string", "default": ""}
        },
        "required": ["name"],
        "additionalProperties": false
    })
}

fn row(id: &str, data: serde_json::Value) -> RowInput {
    RowInput {
        id: id.to_string(),
        data,
        meta: None,
    }
}

#[tokio::test]
async fn scenario_a_commit_seals_versions_and_chains_a_fresh_draft() {
    let (engine, ctx) = setup().await;

    let created_table = engine
        .create_table(&ctx, &"t1".to_string(), &name_schema())
        .await
        .unwrap();
    let created_row = engine
        .create_row(&ctx, &"t1".to_string(), row("r1", json!({"name": "x"})))
        .await
        .unwrap();
    assert!(!created_table.readonly);
    assert!(!created_row.readonly);

    let branch_id = created_table_branch(&engine, &ctx).await;
    let outcome = engine
        .commit(&branch_id, Some("first commit".into()))
        .await
        .unwrap();

    // The promoted head carries the sealed versions.
    let head_ctx = ctx.at_revision(outcome.head.id.clone());
    let head_table = engine.get_table(&head_ctx, &"t1".to_string()).await.unwrap();
    let head_row = engine
        .get_row(&head_ctx, &"t1".to_string(), &"r1".to_string())
        .await
        .unwrap();
    assert!(head_table.readonly);
    assert!(head_row.readonly);
    assert_eq!(head_table.version_id, created_table.version_id);
    assert_eq!(head_row.version_id, created_row.version_id);

    // The fresh draft shares the same table set and starts empty.
    let draft_ctx = ctx.at_revision(outcome.draft.id.clone());
    let draft_table = engine.get_table(&draft_ctx, &"t1".to_string()).await.unwrap();
    assert_eq!(draft_table.version_id, head_table.version_id);
    let changelog = engine.get_changelog(&outcome.draft.id).await.unwrap();
    assert!(!changelog.has_changes);
}

#[tokio::test]
async fn commit_without_changes_fails_precondition() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"t1".to_string(), &name_schema())
        .await
        .unwrap();
    let branch_id = created_table_branch(&engine, &ctx).await;

    engine.commit(&branch_id, None).await.unwrap();
    let replay = engine.commit(&branch_id, None).await;
    assert!(matches!(replay, Err(EngineError::PreconditionFailed(_))));
}

#[tokio::test]
async fn revert_restores_the_head_table_set_pointer_identically() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"t1".to_string(), &name_schema())
        .await
        .unwrap();
    engine
        .create_row(&ctx, &"t1".to_string(), row("r1", json!({"name": "x"})))
        .await
        .unwrap();
    let branch_id = created_table_branch(&engine, &ctx).await;
    let outcome = engine.commit(&branch_id, None).await.unwrap();
    let draft_ctx = ctx.at_revision(outcome.draft.id.clone());

    let head_table = engine
        .get_table(&ctx.at_revision(outcome.head.id.clone()), &"t1".to_string())
        .await
        .unwrap();

    // Mutate the draft: the table clones away from the head version.
    engine
        .update_rows(
            &draft_ctx,
            &"t1".to_string(),
            vec![row("r1", json!({"name": "y"}))],
        )
        .await
        .unwrap();
    let mutated = engine.get_table(&draft_ctx, &"t1".to_string()).await.unwrap();
    assert_ne!(mutated.version_id, head_table.version_id);

    let reverted = engine.revert(&branch_id).await.unwrap();
    assert!(!reverted.has_changes);

    let restored = engine.get_table(&draft_ctx, &"t1".to_string()).await.unwrap();
    assert_eq!(restored.version_id, head_table.version_id);
    let restored_row = engine
        .get_row(&draft_ctx, &"t1".to_string(), &"r1".to_string())
        .await
        .unwrap();
    assert_eq!(restored_row.data, json!({"name": "x"}));
    let changelog = engine.get_changelog(&outcome.draft.id).await.unwrap();
    assert!(!changelog.has_changes);

    // Nothing left to revert.
    let again = engine.revert(&branch_id).await;
    assert!(matches!(again, Err(EngineError::PreconditionFailed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_b_concurrent_updates_converge_to_one_table_version() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"t1".to_string(), &name_schema())
        .await
        .unwrap();
    let rows: Vec<RowInput> = (0..5)
        .map(|i| row(&format!("r{i}"), json!({"name": format!("v{i}")})))
        .collect();
    engine
        .create_rows(&ctx, &"t1".to_string(), rows)
        .await
        .unwrap();
    let branch_id = created_table_branch(&engine, &ctx).await;
    let outcome = engine.commit(&branch_id, None).await.unwrap();
    let draft_ctx = ctx.at_revision(outcome.draft.id.clone());

    let sealed_table = engine.get_table(&draft_ctx, &"t1".to_string()).await.unwrap();
    assert!(sealed_table.readonly);

    // Five concurrent single-row updates against the same readonly table.
    let engine = Arc::new(engine);
    let mut handles = Vec::new();
    for i in 0..5 {
        let engine = Arc::clone(&engine);
        let draft_ctx = draft_ctx.clone();
        handles.push(tokio::spawn(async move {
            engine
                .update_rows(
                    &draft_ctx,
                    &"t1".to_string(),
                    vec![row(&format!("r{i}"), json!({"name": format!("updated-{i}")}))],
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Exactly one clone survives attached to the draft.
    let tables = engine.list_tables(&draft_ctx).await.unwrap();
    let t1_versions: Vec<_> = tables.iter().filter(|table| table.id == "t1").collect();
    assert_eq!(t1_versions.len(), 1);
    assert_ne!(t1_versions[0].version_id, sealed_table.version_id);
    assert!(!t1_versions[0].readonly);

    // All five updates are reflected in its row set.
    for i in 0..5 {
        let updated = engine
            .get_row(&draft_ctx, &"t1".to_string(), &format!("r{i}"))
            .await
            .unwrap();
        assert_eq!(updated.data, json!({"name": format!("updated-{i}")}));
    }
}

#[tokio::test]
async fn scenario_c_foreign_key_blocks_table_removal_until_schema_drops_it() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"a".to_string(), &name_schema())
        .await
        .unwrap();
    let b_schema = json!({
        "type": "object",
        "properties": {
            "a_ref": {"type": "string", "foreignKey": "a"}
        },
        "required": ["a_ref"],
        "additionalProperties": false
    });
    engine
        .create_table(&ctx, &"b".to_string(), &b_schema)
        .await
        .unwrap();

    let blocked = engine.remove_table(&ctx, &"a".to_string()).await;
    match blocked {
        Err(EngineError::ReferentialIntegrity(message)) => {
            assert!(
                message.contains("table b"),
                "names the blocking table: {message}"
            );
        }
        other => panic!("unexpected: {other:?}"),
    }

    engine
        .update_table(
            &ctx,
            &"b".to_string(),
            &[SchemaPatch::Remove {
                path: "/properties/a_ref".into(),
            }],
        )
        .await
        .unwrap();

    engine.remove_table(&ctx, &"a".to_string()).await.unwrap();
    let gone = engine.get_table(&ctx, &"a".to_string()).await;
    assert!(matches!(gone, Err(EngineError::NotFound { .. })));
}

#[tokio::test]
async fn row_removal_is_blocked_by_live_pointers() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"a".to_string(), &name_schema())
        .await
        .unwrap();
    engine
        .create_row(&ctx, &"a".to_string(), row("a1", json!({"name": "target"})))
        .await
        .unwrap();
    let b_schema = json!({
        "type": "object",
        "properties": {
            "a_ref": {"type": "string", "foreignKey": "a"}
        },
        "required": ["a_ref"],
        "additionalProperties": false
    });
    engine
        .create_table(&ctx, &"b".to_string(), &b_schema)
        .await
        .unwrap();
    engine
        .create_row(&ctx, &"b".to_string(), row("b1", json!({"a_ref": "a1"})))
        .await
        .unwrap();

    let blocked = engine
        .remove_rows(&ctx, &"a".to_string(), &["a1".to_string()])
        .await;
    assert!(matches!(blocked, Err(EngineError::ReferentialIntegrity(_))));
    assert_eq!(
        engine
            .count_foreign_keys_to(&ctx, &"a".to_string(), &"a1".to_string())
            .await
            .unwrap(),
        1
    );
    let users = engine
        .resolve_foreign_keys_to(&ctx, &"a".to_string(), &"a1".to_string(), 0, 10)
        .await
        .unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].0, "b");
    assert_eq!(users[0].1.id, "b1");

    engine
        .remove_rows(&ctx, &"b".to_string(), &["b1".to_string()])
        .await
        .unwrap();
    engine
        .remove_rows(&ctx, &"a".to_string(), &["a1".to_string()])
        .await
        .unwrap();
}

#[tokio::test]
async fn schema_patch_round_trip_and_replace_coercion() {
    let (engine, ctx) = setup().await;
    let schema = json!({
        "type": "object",
        "properties": {
            "name": {"type": "string", "default": ""},
            "price": {"type": "string", "default": ""}
        },
        "required": ["name", "price"],
        "additionalProperties": false
    });
    engine
        .create_table(&ctx, &"t1".to_string(), &schema)
        .await
        .unwrap();
    engine
        .create_rows(
            &ctx,
            &"t1".to_string(),
            vec![
                row("empty", json!({"name": "a", "price": ""})),
                row("numeric", json!({"name": "b", "price": "3"})),
                row("junk", json!({"name": "c", "price": "abc"})),
            ],
        )
        .await
        .unwrap();

    // Add a field, then read back the exact patched tree.
    let patched = engine
        .update_table(
            &ctx,
            &"t1".to_string(),
            &[SchemaPatch::Add {
                path: "/properties/stock".into(),
                value: json!({"type": "number", "default": 0}),
            }],
        )
        .await
        .unwrap();
    let stored = engine.get_schema(&ctx, &"t1".to_string()).await.unwrap();
    assert_eq!(stored, patched);
    assert_eq!(stored["properties"]["stock"]["type"], json!("number"));

    // Replace string price with a number: "" -> 0, "3" -> 3, "abc" -> 0.
    engine
        .update_table(
            &ctx,
            &"t1".to_string(),
            &[SchemaPatch::Replace {
                path: "/properties/price".into(),
                value: json!({"type": "number", "default": 0}),
            }],
        )
        .await
        .unwrap();
    for (id, expected) in [("empty", json!(0)), ("numeric", json!(3)), ("junk", json!(0))] {
        let migrated = engine
            .get_row(&ctx, &"t1".to_string(), &id.to_string())
            .await
            .unwrap();
        assert_eq!(migrated.data["price"], expected, "row {id}");
    }
}

#[tokio::test]
async fn rename_table_cascades_into_pointing_schemas() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"users".to_string(), &name_schema())
        .await
        .unwrap();
    let posts_schema = json!({
        "type": "object",
        "properties": {
            "author": {"type": "string", "foreignKey": "users"}
        },
        "required": ["author"],
        "additionalProperties": false
    });
    engine
        .create_table(&ctx, &"posts".to_string(), &posts_schema)
        .await
        .unwrap();

    let renamed = engine
        .rename_table(&ctx, &"users".to_string(), &"people".to_string())
        .await
        .unwrap();
    assert_eq!(renamed.id, "people");

    let schema = engine.get_schema(&ctx, &"people".to_string()).await.unwrap();
    assert_eq!(schema, name_schema());
    let posts = engine.get_schema(&ctx, &"posts".to_string()).await.unwrap();
    assert_eq!(
        posts["properties"]["author"]["foreignKey"],
        json!("people")
    );
    assert!(matches!(
        engine.get_table(&ctx, &"users".to_string()).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn branches_fork_cheaply_and_reject_bad_sources() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"t1".to_string(), &name_schema())
        .await
        .unwrap();
    let branch_id = created_table_branch(&engine, &ctx).await;
    let outcome = engine.commit(&branch_id, None).await.unwrap();

    // Forking from the draft is rejected.
    let from_draft = engine
        .create_branch(&outcome.draft.id, "feature")
        .await;
    assert!(matches!(from_draft, Err(EngineError::PreconditionFailed(_))));

    let fork = engine
        .create_branch(&outcome.head.id, "feature")
        .await
        .unwrap();
    // The fork shares table versions with its source revision.
    let fork_ctx = ctx.at_revision(fork.draft.id.clone());
    let forked_table = engine.get_table(&fork_ctx, &"t1".to_string()).await.unwrap();
    let source_table = engine
        .get_table(&ctx.at_revision(outcome.head.id.clone()), &"t1".to_string())
        .await
        .unwrap();
    assert_eq!(forked_table.version_id, source_table.version_id);

    // Branch names are unique per project, case-insensitively.
    let duplicate = engine.create_branch(&outcome.head.id, "FEATURE").await;
    assert!(matches!(duplicate, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn branch_deletion_guards_root_and_parents() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"t1".to_string(), &name_schema())
        .await
        .unwrap();
    let root_id = created_table_branch(&engine, &ctx).await;
    let outcome = engine.commit(&root_id, None).await.unwrap();

    let root_delete = engine.delete_branch(&root_id).await;
    assert!(matches!(root_delete, Err(EngineError::PreconditionFailed(_))));

    let feature = engine
        .create_branch(&outcome.head.id, "feature")
        .await
        .unwrap();
    // Commit something on the feature branch, then fork a grandchild off it.
    let feature_ctx = ctx.at_revision(feature.draft.id.clone());
    engine
        .create_table(&feature_ctx, &"t2".to_string(), &name_schema())
        .await
        .unwrap();
    let feature_outcome = engine.commit(&feature.branch.id, None).await.unwrap();
    let grandchild = engine
        .create_branch(&feature_outcome.head.id, "grandchild")
        .await
        .unwrap();

    let blocked = engine.delete_branch(&feature.branch.id).await;
    assert!(matches!(blocked, Err(EngineError::Conflict(_))));

    engine.delete_branch(&grandchild.branch.id).await.unwrap();
    engine.delete_branch(&feature.branch.id).await.unwrap();
    assert!(matches!(
        engine.get_branch(&feature.branch.id).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn migrations_replay_across_branches() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"t1".to_string(), &name_schema())
        .await
        .unwrap();
    let root_id = created_table_branch(&engine, &ctx).await;
    let first = engine.commit(&root_id, None).await.unwrap();

    let feature = engine
        .create_branch(&first.head.id, "feature")
        .await
        .unwrap();

    // Root moves ahead with a second table.
    let root_draft_ctx = ctx.at_revision(first.draft.id.clone());
    engine
        .create_table(&root_draft_ctx, &"t2".to_string(), &name_schema())
        .await
        .unwrap();
    let second = engine.commit(&root_id, None).await.unwrap();

    // Replay root's ledger onto the feature draft.
    let records: Vec<MigrationRecord> = engine
        .list_migrations(&ctx.at_revision(second.head.id.clone()))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);

    let feature_ctx = ctx.at_revision(feature.draft.id.clone());
    let statuses = engine
        .apply_migrations(&feature_ctx, records)
        .await
        .unwrap();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].outcome, MigrationOutcome::Skipped);
    assert_eq!(statuses[1].outcome, MigrationOutcome::Applied);

    let replayed = engine
        .get_table(&feature_ctx, &"t2".to_string())
        .await
        .unwrap();
    assert_eq!(replayed.id, "t2");
}

#[tokio::test]
async fn out_of_order_migrations_fail_and_stop_the_batch() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"t1".to_string(), &name_schema())
        .await
        .unwrap();

    let stale = MigrationRecord {
        id: "0".to_string(),
        change: vellum_db::MigrationChange::Init {
            table_id: "t9".to_string(),
            schema: name_schema(),
        },
        applied_at: chrono::Utc::now(),
    };
    let statuses = engine.apply_migrations(&ctx, vec![stale]).await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert!(matches!(statuses[0].outcome, MigrationOutcome::Failed(_)));
    assert!(matches!(
        engine.get_table(&ctx, &"t9".to_string()).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn published_at_derives_from_schema_declared_fields() {
    let (engine, ctx) = setup().await;
    let schema = json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "publishedAt": {"type": "string", "publishedAt": true}
        },
        "required": ["publishedAt", "title"],
        "additionalProperties": false
    });
    engine
        .create_table(&ctx, &"articles".to_string(), &schema)
        .await
        .unwrap();

    let unpublished = engine
        .create_row(
            &ctx,
            &"articles".to_string(),
            row("draft-post", json!({"title": "t", "publishedAt": ""})),
        )
        .await
        .unwrap();
    assert!(unpublished.published_at.is_none());

    let published = engine
        .create_row(
            &ctx,
            &"articles".to_string(),
            row(
                "live-post",
                json!({"title": "t", "publishedAt": "2024-05-01T10:00:00Z"}),
            ),
        )
        .await
        .unwrap();
    assert_eq!(
        published.published_at.unwrap().to_rfc3339(),
        "2024-05-01T10:00:00+00:00"
    );
}

#[tokio::test]
async fn batch_validation_reports_row_and_pointer() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"t1".to_string(), &name_schema())
        .await
        .unwrap();

    let empty = engine.create_rows(&ctx, &"t1".to_string(), vec![]).await;
    assert!(matches!(empty, Err(EngineError::InvalidInput { .. })));

    let duplicate = engine
        .create_rows(
            &ctx,
            &"t1".to_string(),
            vec![
                row("r1", json!({"name": "a"})),
                row("r1", json!({"name": "b"})),
            ],
        )
        .await;
    assert!(matches!(duplicate, Err(EngineError::InvalidInput { .. })));

    let invalid = engine
        .create_rows(
            &ctx,
            &"t1".to_string(),
            vec![row("r1", json!({"name": 5}))],
        )
        .await;
    match invalid {
        Err(EngineError::InvalidInput { message, pointer }) => {
            assert!(message.contains("r1"), "{message}");
            assert_eq!(pointer.as_deref(), Some("/name"));
        }
        other => panic!("unexpected: {other:?}"),
    }

    // The failed batch left nothing behind.
    assert_eq!(engine.count_rows(&ctx, &"t1".to_string()).await.unwrap(), 0);
}

#[tokio::test]
async fn changelog_tracks_and_resets() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"t1".to_string(), &name_schema())
        .await
        .unwrap();
    engine
        .create_row(&ctx, &"t1".to_string(), row("r1", json!({"name": "x"})))
        .await
        .unwrap();

    let changelog = engine.get_changelog(&ctx.revision_id).await.unwrap();
    assert!(changelog.has_changes);
    assert!(changelog.table_inserts.contains_key("t1"));
    assert!(changelog.row_inserts["t1"].contains("r1"));

    // Deleting the just-created row cancels the insert.
    engine
        .remove_rows(&ctx, &"t1".to_string(), &["r1".to_string()])
        .await
        .unwrap();
    let changelog = engine.get_changelog(&ctx.revision_id).await.unwrap();
    assert!(!changelog.row_inserts.contains_key("t1"));
    assert!(!changelog.row_deletes.contains_key("t1"));
}

#[tokio::test]
async fn saved_views_follow_their_table() {
    let (engine, ctx) = setup().await;
    engine
        .create_table(&ctx, &"t1".to_string(), &name_schema())
        .await
        .unwrap();
    assert!(engine
        .get_table_views(&ctx, &"t1".to_string())
        .await
        .unwrap()
        .is_none());

    engine
        .set_table_views(&ctx, &"t1".to_string(), json!({"columns": ["name"]}))
        .await
        .unwrap();
    assert_eq!(
        engine.get_table_views(&ctx, &"t1".to_string()).await.unwrap(),
        Some(json!({"columns": ["name"]}))
    );

    engine.remove_table(&ctx, &"t1".to_string()).await.unwrap();
    let views = engine.get_table_views(&ctx, &"t1".to_string()).await;
    assert!(matches!(views, Err(EngineError::NotFound { .. })));
}

/// The branch that owns the context's draft revision.
async fn created_table_branch(engine: &Engine<MemoryStore>, ctx: &RequestContext) -> String {
    let branches = engine.list_branches(&ctx.project_id).await.unwrap();
    branches
        .into_iter()
        .find(|branch| branch.is_root)
        .map(|branch| branch.id)
        .expect("root branch exists")
}
