mod api;
mod codec;
mod error;
mod index_key;
mod memory;
mod paths;
mod redb_store;
mod transitions;

pub use api::*;
pub use error::*;
pub use memory::MemoryTransferStore;
pub use redb_store::RedbTransferStore;
