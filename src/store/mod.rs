pub mod memory;
pub mod postgres;
pub mod traits;
pub mod txn;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use traits::{Store, StoreTx};
pub use txn::TxnRunner;
