pub mod drive;
pub mod memory;

pub use drive::{DriveConfig, DriveStore};
pub use memory::InMemoryObjectStore;
