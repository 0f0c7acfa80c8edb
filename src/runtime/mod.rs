//! Worker hosting and the API surface.

use std::future::Future;

pub mod api;
pub mod host;
pub mod tokio_spawner;

pub use api::{health, lease_status, list_blueprints, submit_lease, BlueprintSummary, Health, LeaseStatusResponse};
pub use host::{HostStats, TaskReport, WorkerHost, WorkerHostSettings};
pub use tokio_spawner::TokioSpawner;

/// Spawner abstraction to decouple worker loops from a specific runtime.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
