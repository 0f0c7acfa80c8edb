//! Configuration models for backends, workers, and timeouts.

pub mod drydock;

pub use drydock::{DrydockConfig, QueueBackendConfig, StoreBackendConfig};
