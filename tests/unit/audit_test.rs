//! Tests for audit sink

use drydock::core::{build_audit_event, AuditKind, AuditSink, AuditSubject, InMemoryAuditSink};
use drydock::util::{LeaseRef, ResourceRef};

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);
    let lease = LeaseRef::generate();

    let event = build_audit_event(lease, AuditKind::LeaseQueued, 42, Some(serde_json::json!({"owner": "alice"})));
    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].event_id, event.event_id);
    assert_eq!(events[0].subject, AuditSubject::Lease(lease));
    assert_eq!(events[0].kind, AuditKind::LeaseQueued);
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);
    let resource = ResourceRef::generate();

    sink.record(build_audit_event(resource, AuditKind::ResourceAllocated, 1, None));
    sink.record(build_audit_event(resource, AuditKind::ResourceActivated, 2, None));
    sink.record(build_audit_event(resource, AuditKind::ResourceReleased, 3, None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, AuditKind::ResourceActivated); // First one popped
    assert_eq!(events[1].kind, AuditKind::ResourceReleased);
}

#[test]
fn test_events_for_filters_by_subject() {
    let mut sink = InMemoryAuditSink::new(10);
    let mine = LeaseRef::generate();
    let other = LeaseRef::generate();

    sink.record(build_audit_event(mine, AuditKind::LeaseQueued, 1, None));
    sink.record(build_audit_event(other, AuditKind::LeaseQueued, 2, None));
    sink.record(build_audit_event(mine, AuditKind::LeaseActivated, 3, None));

    let kinds: Vec<_> = sink.events_for(mine).into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![AuditKind::LeaseQueued, AuditKind::LeaseActivated]);
}

#[test]
fn test_build_audit_event() {
    let lease = LeaseRef::generate();
    let event = build_audit_event(lease, AuditKind::LeaseBroken, 7, Some(serde_json::json!("no capacity")));

    assert_eq!(event.subject, AuditSubject::Lease(lease));
    assert_eq!(event.kind.as_str(), "lease.broken");
    assert_eq!(event.created_at_ms, 7);
    assert_eq!(event.payload, Some(serde_json::json!("no capacity")));
    assert!(!event.event_id.is_empty());
}
