//! Task queue backends.

pub mod file;
pub mod memory;

pub use file::FileTaskQueue;
pub use memory::InMemoryTaskQueue;
