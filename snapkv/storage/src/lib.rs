pub mod error;
pub mod kvs;
pub mod memory;

pub use error::{StorageError, StorageResult};
pub use kvs::{KeyValueService, RangePage};
pub use memory::InMemoryKeyValueService;
