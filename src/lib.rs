pub mod config;
pub mod engine;
pub mod error;
pub mod logic;
pub mod model;
pub mod plugins;
pub mod schema;
pub mod store;

pub use config::AppConfig;
pub use engine::{Engine, MigrationOutcome, MigrationStatus};
pub use error::{EngineError, EngineResult};

// Export operation and record types
pub use logic::{BranchFork, CommitOutcome, Effect, MigrationChange, MigrationRecord, RowInput};
pub use model::{Branch, Changelog, Id, RequestContext, Revision, RowVersion, TableVersion, Uid};
pub use plugins::{AllowAll, EndpointNotifier, FilePlugin, NoopFiles, NoopNotifier, PermissionGate};
pub use schema::{SchemaNode, SchemaPatch};

// Export store types
pub use store::{MemoryStore, PostgresStore, Store};
