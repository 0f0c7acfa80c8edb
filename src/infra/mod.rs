//! Infrastructure adapters for row storage and task queues.

pub mod queue;
pub mod store;

pub use queue::{FileTaskQueue, InMemoryTaskQueue};
pub use store::{InMemoryStore, JsonFileStore};
