//! # Drydock
//!
//! A resource leasing engine. Callers ask for a lease on "some resource of
//! type T"; the engine finds or creates a resource that satisfies the
//! request, binds the lease to it, and tears everything down when the lease
//! or resource is released.
//!
//! ## Core Ideas
//!
//! - **Blueprints** are configured strategies that know how to allocate one
//!   resource type. The engine talks to them only through
//!   [`core::BlueprintStrategy`].
//! - **Resources** and **leases** move through strict state machines. Every
//!   transition re-reads the stored row and fails with a state mismatch
//!   rather than overwrite a concurrent change.
//! - **Slot locks** are named exclusive claims that make "at most one X per
//!   Y" hold across workers. They are taken all-or-nothing in the same
//!   transaction as the state change they guard.
//! - **Commands** are asynchronous instructions (for now, RELEASE) posted by
//!   anyone and applied exactly once by whichever worker next updates the
//!   target.
//! - **Tasks** drive everything: allocate, update, and expire tasks run on a
//!   durable delayed queue with at-least-once delivery. Handlers never sleep;
//!   they yield and are rescheduled.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use drydock::builders::DrydockBuilder;
//! use drydock::config::DrydockConfig;
//! use drydock::core::{Actor, HostBinding, HostPoolFields, HostPoolStrategy, LeaseRequest, HOST_TYPE};
//! use drydock::runtime::TokioSpawner;
//!
//! let runtime = DrydockBuilder::new(DrydockConfig::default()).build()?;
//! runtime.spawn_workers(&TokioSpawner::current());
//!
//! let fields = HostPoolFields {
//!     bindings: vec![HostBinding { id: "b1".into(), device: "web01".into(), address: "10.0.0.1".into(), port: 22 }],
//!     credential: None,
//! };
//! runtime.drydock.create_blueprint(HostPoolStrategy::blueprint("web hosts", fields))?;
//!
//! let actor = Actor::user("alice");
//! runtime
//!     .drydock
//!     .with_lease(&actor, LeaseRequest::new(HOST_TYPE), Duration::from_secs(30), |lease| async move {
//!         // use the host
//!         Ok(())
//!     })
//!     .await?;
//! ```
//!
//! For complete scenarios, see the integration tests under `tests/`.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Leasing engine: lifecycle state machines, locks, commands, and allocation.
pub mod core;
/// Configuration models for backends, workers, and timeouts.
pub mod config;
/// Builders to construct the engine from configuration.
pub mod builders;
/// Infrastructure adapters for row storage and task queues.
pub mod infra;
/// Worker hosting and the API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
