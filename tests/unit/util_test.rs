//! Tests for utility functions

use std::time::Duration;

use drydock::util::{remaining, Clock, LeaseRef, ManualClock, ObjectRef, ResourceRef, TaskId};

#[test]
fn test_manual_clock() {
    let clock = ManualClock::new(1_000);
    assert_eq!(clock.now_ms(), 1_000);
    clock.advance(Duration::from_millis(500));
    assert_eq!(clock.now_ms(), 1_500);
    clock.set(10_000);
    assert_eq!(clock.now_ms(), 10_000);
}

#[test]
fn test_remaining_saturates() {
    assert_eq!(remaining(5_000, 2_000), Duration::from_secs(3));
    assert_eq!(remaining(2_000, 5_000), Duration::ZERO);
}

#[test]
fn test_object_refs_display_kind() {
    let lease = LeaseRef::generate();
    let resource = ResourceRef::generate();
    assert_eq!(ObjectRef::from(lease).to_string(), lease.to_string());
    assert!(ObjectRef::from(resource).to_string().starts_with("resource-"));
    assert_ne!(LeaseRef::generate(), lease);
}

#[test]
fn test_object_ref_serde() {
    let lease = LeaseRef::generate();
    let json = serde_json::to_value(ObjectRef::Lease(lease)).unwrap();
    assert_eq!(json["kind"], "lease");
    let back: ObjectRef = serde_json::from_value(json).unwrap();
    assert_eq!(back, ObjectRef::Lease(lease));
}

#[test]
fn test_task_id() {
    let id: TaskId = 12345;
    assert_eq!(id, 12345);
}
