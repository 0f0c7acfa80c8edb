//! Audit trail for lifecycle transitions.
//!
//! Every status change of a resource or lease, and every slot-lock failure
//! during allocation, produces an [`AuditEvent`]. Sinks are optional; the
//! engine only records when one is configured.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::util::{BlueprintRef, LeaseRef, ObjectRef, ResourceRef};

/// The object an audit event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AuditSubject {
    /// A blueprint.
    Blueprint(BlueprintRef),
    /// A resource.
    Resource(ResourceRef),
    /// A lease.
    Lease(LeaseRef),
}

impl From<BlueprintRef> for AuditSubject {
    fn from(value: BlueprintRef) -> Self {
        Self::Blueprint(value)
    }
}

impl From<ResourceRef> for AuditSubject {
    fn from(value: ResourceRef) -> Self {
        Self::Resource(value)
    }
}

impl From<LeaseRef> for AuditSubject {
    fn from(value: LeaseRef) -> Self {
        Self::Lease(value)
    }
}

impl From<ObjectRef> for AuditSubject {
    fn from(value: ObjectRef) -> Self {
        match value {
            ObjectRef::Resource(r) => Self::Resource(r),
            ObjectRef::Lease(l) => Self::Lease(l),
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A resource row was created.
    ResourceAllocated,
    /// A resource became usable.
    ResourceActivated,
    /// A resource stopped accepting new leases.
    ResourceClosed,
    /// A resource was released.
    ResourceReleased,
    /// A resource failed permanently.
    ResourceBroken,
    /// A resource was destroyed.
    ResourceDestroyed,
    /// A blueprint could not take the slot locks for a new resource.
    SlotLockFailure,
    /// A lease was queued for allocation.
    LeaseQueued,
    /// A lease was bound to a resource.
    LeaseAcquired,
    /// A lease became usable.
    LeaseActivated,
    /// A lease was released.
    LeaseReleased,
    /// A lease failed permanently.
    LeaseBroken,
    /// A lease was destroyed.
    LeaseDestroyed,
    /// No candidate could satisfy a lease.
    AllocationFailed,
    /// A command was posted.
    CommandPosted,
}

impl AuditKind {
    /// Stable name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResourceAllocated => "resource.allocated",
            Self::ResourceActivated => "resource.activated",
            Self::ResourceClosed => "resource.closed",
            Self::ResourceReleased => "resource.released",
            Self::ResourceBroken => "resource.broken",
            Self::ResourceDestroyed => "resource.destroyed",
            Self::SlotLockFailure => "blueprint.slot-lock-failure",
            Self::LeaseQueued => "lease.queued",
            Self::LeaseAcquired => "lease.acquired",
            Self::LeaseActivated => "lease.activated",
            Self::LeaseReleased => "lease.released",
            Self::LeaseBroken => "lease.broken",
            Self::LeaseDestroyed => "lease.destroyed",
            Self::AllocationFailed => "lease.allocation-failed",
            Self::CommandPosted => "command.posted",
        }
    }
}

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// The object the event is about.
    pub subject: AuditSubject,
    /// What happened.
    pub kind: AuditKind,
    /// Timestamp milliseconds.
    pub created_at_ms: u64,
    /// Additional context.
    pub payload: Option<Value>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
#[derive(Debug)]
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events.min(1024)),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }

    /// Events about one object, oldest first.
    #[must_use]
    pub fn events_for(&self, subject: impl Into<AuditSubject>) -> Vec<AuditEvent> {
        let subject = subject.into();
        self.events
            .iter()
            .filter(|e| e.subject == subject)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Helper to build an audit event with a fresh identifier.
#[must_use]
pub fn build_audit_event(
    subject: impl Into<AuditSubject>,
    kind: AuditKind,
    created_at_ms: u64,
    payload: Option<Value>,
) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4().to_string(),
        subject: subject.into(),
        kind,
        created_at_ms,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_buffer_drops_oldest() {
        let mut sink = InMemoryAuditSink::new(2);
        let lease = LeaseRef::generate();
        for kind in [AuditKind::LeaseQueued, AuditKind::LeaseAcquired, AuditKind::LeaseActivated] {
            sink.record(build_audit_event(lease, kind, 1, None));
        }
        let kinds: Vec<_> = sink.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditKind::LeaseAcquired, AuditKind::LeaseActivated]);
    }
}
