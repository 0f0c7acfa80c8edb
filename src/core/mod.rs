//! Leasing engine: lifecycle state machines, locks, commands, and allocation.

pub mod allocator;
pub mod audit;
pub mod blueprint;
pub mod command;
pub mod context;
pub mod engine;
pub mod error;
pub mod host_pool;
pub mod lease;
pub mod model;
pub mod policy;
pub mod resource;
pub mod slot_lock;
pub mod store;
pub mod task;
pub mod worker;

pub use allocator::{AllocationOutcome, Allocator};
pub use audit::{build_audit_event, AuditEvent, AuditKind, AuditSink, AuditSubject, InMemoryAuditSink};
pub use blueprint::{BlueprintRegistry, BlueprintStrategy};
pub use command::CommandChannel;
pub use context::{DrydockContext, LeaseWaiter, SharedAuditSink};
pub use engine::{Drydock, LeaseGuard, LeaseRequest, LeaseSnapshot, ResourceSnapshot};
pub use error::{AppResult, DrydockError, Result};
pub use host_pool::{HostBinding, HostPoolFields, HostPoolStrategy, HOST_TYPE};
pub use lease::LeaseAcquisition;
pub use model::{
    AttributeMap, Blueprint, Command, CommandKind, Lease, LeaseStatus, Resource, ResourceStatus, SlotLock,
};
pub use policy::{Actor, Capability, Policy};
pub use resource::ResourceTemplate;
pub use slot_lock::SlotLockManager;
pub use store::{Store, StoreExt, Tables};
pub use task::{QueuedTask, TaskKind, TaskQueue, TaskScheduler, TaskSpec};
pub use worker::{DrydockWorker, TaskOutcome, WorkerSettings};
