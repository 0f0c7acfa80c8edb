//! Tests for error types

use drydock::core::DrydockError;
use drydock::util::LeaseRef;

#[test]
fn test_precondition_error() {
    let err = DrydockError::Precondition("lease is pending".to_string());
    assert_eq!(format!("{}", err), "precondition failed: lease is pending");
    assert!(err.is_permanent());
}

#[test]
fn test_state_mismatch_error() {
    let err = DrydockError::state_mismatch("lease", "pending", "active");
    assert_eq!(format!("{}", err), "lease status mismatch: expected pending, actually active");
    assert!(err.is_contention());
}

#[test]
fn test_allocation_failed_counts_candidates() {
    let lease = LeaseRef::generate();
    let err = DrydockError::AllocationFailed {
        lease,
        errors: vec![DrydockError::Strategy("pool drained".into()), DrydockError::Timeout],
    };
    assert_eq!(format!("{}", err), format!("unable to allocate {lease}: 2 candidate error(s)"));
    assert!(err.is_permanent());
    assert!(!err.is_contention());
}

#[test]
fn test_backend_error() {
    let err = DrydockError::Backend("connection failed".to_string());
    assert_eq!(format!("{}", err), "backend error: connection failed");
    assert!(!err.is_permanent());
}

#[test]
fn test_io_error_converts_to_backend() {
    let err: DrydockError = std::io::Error::other("disk gone").into();
    assert!(matches!(err, DrydockError::Backend(msg) if msg.contains("disk gone")));
}
