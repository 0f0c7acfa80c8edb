//! Builders to construct the engine and its workers from configuration.

pub mod drydock_builder;

pub use drydock_builder::{DrydockBuilder, DrydockRuntime};
