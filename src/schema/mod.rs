pub mod coerce;
pub mod node;
pub mod patch;
pub mod path;
pub mod refs;
pub mod validate;

pub use coerce::coerce_value;
pub use node::{BooleanNode, NumberNode, SchemaNode, StringNode, ValidationIssue};
pub use patch::{apply_patches, DataMigration, SchemaPatch};
pub use path::{DataPath, DataStep, SchemaPath, SchemaStep};
pub use refs::{
    collect_file_paths, collect_pointer_paths, collect_publish_paths, declares_pointer_to,
    rewrite_table_pointers, PointerKind,
};
pub use validate::{CompiledSchema, ValidatorCache};
