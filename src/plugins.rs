use serde_json::Value;

use crate::error::EngineResult;
use crate::model::Uid;

/// Authorization gate consulted before every mutating command.
///
/// The engine carries no authorization logic of its own; policy evaluation
/// lives with the transport collaborator.
#[async_trait::async_trait]
pub trait PermissionGate: Send + Sync {
    async fn assert_allowed(&self, action: &str, subject: &str) -> EngineResult<()>;
}

/// File-reference hook applied while row data is being built, for
/// schema-declared file fields. The engine treats the returned tree as
/// opaque JSON; bytes are stored by a collaborator after commit.
#[async_trait::async_trait]
pub trait FilePlugin: Send + Sync {
    async fn after_create_row(&self, data: Value) -> EngineResult<Value>;
    async fn after_update_row(&self, data: Value) -> EngineResult<Value>;
}

/// Fire-and-forget notification about served revisions, invoked strictly
/// after the transaction commits.
#[async_trait::async_trait]
pub trait EndpointNotifier: Send + Sync {
    async fn notify_updated(&self, revision_id: &Uid);
    async fn notify_deleted(&self, revision_id: &Uid);
}

/// Default gate: everything is allowed.
pub struct AllowAll;

#[async_trait::async_trait]
impl PermissionGate for AllowAll {
    async fn assert_allowed(&self, _action: &str, _subject: &str) -> EngineResult<()> {
        Ok(())
    }
}

/// Default file plugin: passes row data through untouched.
pub struct NoopFiles;

#[async_trait::async_trait]
impl FilePlugin for NoopFiles {
    async fn after_create_row(&self, data: Value) -> EngineResult<Value> {
        Ok(data)
    }

    async fn after_update_row(&self, data: Value) -> EngineResult<Value> {
        Ok(data)
    }
}

/// Default notifier: drops notifications.
pub struct NoopNotifier;

#[async_trait::async_trait]
impl EndpointNotifier for NoopNotifier {
    async fn notify_updated(&self, _revision_id: &Uid) {}

    async fn notify_deleted(&self, _revision_id: &Uid) {}
}
