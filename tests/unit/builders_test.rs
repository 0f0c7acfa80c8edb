//! Tests for builder modules

use drydock::builders::DrydockBuilder;
use drydock::config::DrydockConfig;
use drydock::core::HOST_TYPE;

#[test]
fn test_builder_registers_host_pool() {
    let config = DrydockConfig {
        worker_count: 2,
        ..DrydockConfig::default()
    };

    let builder = DrydockBuilder::new(config);
    assert_eq!(builder.config().worker_count, 2);

    let runtime = builder.build().unwrap();
    assert!(runtime.drydock.registry().get(HOST_TYPE).is_some());
    assert!(runtime.audit_log.is_some());
    assert_eq!(runtime.config().worker_count, 2);
}

#[test]
fn test_builder_rejects_invalid_config() {
    let config = DrydockConfig {
        allocation_rounds: 0,
        ..DrydockConfig::default()
    };
    let err = DrydockBuilder::new(config).build().unwrap_err();
    assert!(err.to_string().contains("config invalid"), "{err}");
}

#[test]
fn test_builder_without_audit() {
    let config = DrydockConfig {
        audit_capacity: 0,
        ..DrydockConfig::default()
    };
    let runtime = DrydockBuilder::new(config).build().unwrap();
    assert!(runtime.audit_log.is_none());
}
