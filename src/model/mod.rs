pub mod branch;
pub mod changelog;
pub mod common;
pub mod context;
pub mod revision;
pub mod row;
pub mod table;

pub use branch::Branch;
pub use changelog::{ChangeMap, Changelog};
pub use common::{
    content_hash, generate_uid, is_system_table_id, is_valid_ident, Id, Uid, MIGRATION_TABLE_ID,
    ROOT_BRANCH_NAME, SCHEMA_TABLE_ID, VIEW_TABLE_ID,
};
pub use context::RequestContext;
pub use revision::Revision;
pub use row::RowVersion;
pub use table::TableVersion;
