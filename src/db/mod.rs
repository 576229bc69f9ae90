pub mod kv_store;
pub mod local_state;

pub use kv_store::{KeyValueStore, MemoryStore, SqliteStore};
pub use local_state::LocalState;
