pub mod memory;
pub mod sqlite;

pub use memory::InMemoryIndex;
pub use sqlite::SqliteIndex;
