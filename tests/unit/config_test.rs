//! Tests for configuration validation

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use drydock::config::{DrydockConfig, QueueBackendConfig, StoreBackendConfig};

#[test]
fn test_default_config_is_valid() {
    let config = DrydockConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.store, StoreBackendConfig::InMemory);
    assert_eq!(config.wait_poll_interval(), Duration::from_secs(1));
}

#[test]
fn test_config_invalid_worker_count() {
    let invalid = DrydockConfig {
        worker_count: 0,
        ..DrydockConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_invalid_queue_depth() {
    let invalid = DrydockConfig {
        max_queue_depth: 0,
        ..DrydockConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_wait_poll_capped_at_one_second() {
    let invalid = DrydockConfig {
        wait_poll_interval_ms: 1_001,
        ..DrydockConfig::default()
    };
    assert!(invalid.validate().unwrap_err().contains("wait_poll_interval_ms"));
}

#[test]
fn test_config_rejects_zero_delays() {
    for invalid in [
        DrydockConfig {
            release_recheck_ms: 0,
            ..DrydockConfig::default()
        },
        DrydockConfig {
            retry_backoff_ms: 0,
            ..DrydockConfig::default()
        },
    ] {
        assert!(invalid.validate().is_err());
    }
    let err = DrydockConfig::from_json_str(r#"{"release_recheck_ms":0,"retry_backoff_ms":0,"max_backoff_ms":0}"#)
        .unwrap_err();
    assert!(err.contains("must be greater than 0"), "{err}");
}

#[test]
fn test_config_backoff_ordering() {
    let invalid = DrydockConfig {
        retry_backoff_ms: 10_000,
        max_backoff_ms: 1_000,
        ..DrydockConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_from_json() {
    let json = r#"{
        "store": { "kind": "file", "path": "/var/lib/drydock/state.json" },
        "worker_count": 4,
        "release_recheck_ms": 5000
    }"#;

    let config = DrydockConfig::from_json_str(json).unwrap();
    assert_eq!(
        config.store,
        StoreBackendConfig::File {
            path: PathBuf::from("/var/lib/drydock/state.json")
        }
    );
    assert_eq!(config.queue, QueueBackendConfig::InMemory);
    assert_eq!(config.worker_count, 4);
    assert_eq!(config.worker_settings().release_recheck, Duration::from_secs(5));
    assert_eq!(config.allocation_rounds, 3);
}

#[test]
fn test_config_from_json_rejects_invalid() {
    assert!(DrydockConfig::from_json_str(r#"{ "max_task_attempts": 0 }"#).is_err());
    assert!(DrydockConfig::from_json_str("not json").is_err());
}

#[test]
fn test_config_from_vars() {
    let vars: HashMap<&str, &str> = [
        ("DRYDOCK_QUEUE_PATH", "/tmp/drydock/tasks.jsonl"),
        ("DRYDOCK_WORKER_COUNT", "3"),
        ("DRYDOCK_MAX_TASK_ATTEMPTS", " 5 "),
        ("DRYDOCK_RETRY_BACKOFF_MS", "250"),
    ]
    .into_iter()
    .collect();

    let config = DrydockConfig::from_vars(|key| vars.get(key).map(ToString::to_string)).unwrap();
    assert_eq!(
        config.queue,
        QueueBackendConfig::File {
            path: PathBuf::from("/tmp/drydock/tasks.jsonl")
        }
    );
    assert_eq!(config.worker_count, 3);
    let host = config.host_settings();
    assert_eq!(host.max_attempts, 5);
    assert_eq!(host.retry_backoff, Duration::from_millis(250));
}

#[test]
fn test_config_from_vars_rejects_garbage() {
    let err = DrydockConfig::from_vars(|key| (key == "DRYDOCK_WORKER_COUNT").then(|| "many".to_string())).unwrap_err();
    assert!(err.contains("DRYDOCK_WORKER_COUNT"), "{err}");
}
