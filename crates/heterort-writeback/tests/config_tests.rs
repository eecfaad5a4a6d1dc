//! Configuration loading: TOML files, partial documents and
//! `HETERORT_WRITEBACK_*` environment overrides.

use std::env;
use std::io::Write;

use heterort_writeback::{
    AccessMode, BufferGeometry, BufferId, ConfigError, ExecutionContext, RecordingScheduler,
    WriteBackConfig, WriteBackEngine,
};
use serial_test::serial;
use tempfile::NamedTempFile;

const ENV_KEYS: [&str; 3] = [
    "HETERORT_WRITEBACK_BLOCKING",
    "HETERORT_WRITEBACK_HISTORY_CAPACITY",
    "HETERORT_WRITEBACK_LOG_DECISIONS",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn set_env(key: &str, value: &str) {
    unsafe {
        env::set_var(key, value);
    }
}

#[test]
#[serial]
fn load_from_file() {
    clear_env();
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "blocking_teardown = false").unwrap();
    writeln!(file, "history_capacity = 32").unwrap();
    writeln!(file, "log_decisions = false").unwrap();

    let cfg = WriteBackConfig::load(file.path()).unwrap();
    assert!(!cfg.blocking_teardown);
    assert_eq!(cfg.history_capacity, 32);
    assert!(!cfg.log_decisions);
}

#[test]
#[serial]
fn missing_fields_fall_back_to_defaults() {
    clear_env();
    let cfg = WriteBackConfig::from_toml("history_capacity = 2").unwrap();
    assert_eq!(cfg.history_capacity, 2);
    assert!(cfg.blocking_teardown);
    assert!(cfg.log_decisions);
}

#[test]
#[serial]
fn missing_file_is_io_error() {
    clear_env();
    let err = WriteBackConfig::load(std::path::Path::new("/nonexistent/heterort.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
#[serial]
fn malformed_toml_is_parse_error() {
    clear_env();
    let err = WriteBackConfig::from_toml("history_capacity = \"lots\"").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
#[serial]
fn invalid_capacity_in_file_is_validation_error() {
    clear_env();
    let err = WriteBackConfig::from_toml("history_capacity = 0").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
#[serial]
fn env_overrides_apply_on_top_of_toml() {
    clear_env();
    set_env("HETERORT_WRITEBACK_BLOCKING", "0");
    set_env("HETERORT_WRITEBACK_HISTORY_CAPACITY", "128");

    let cfg = WriteBackConfig::from_toml("blocking_teardown = true\nhistory_capacity = 4").unwrap();
    assert!(!cfg.blocking_teardown);
    assert_eq!(cfg.history_capacity, 128);
    clear_env();
}

#[test]
#[serial]
fn from_env_starts_from_defaults() {
    clear_env();
    set_env("HETERORT_WRITEBACK_LOG_DECISIONS", "no");
    let cfg = WriteBackConfig::from_env().unwrap();
    assert!(!cfg.log_decisions);
    assert_eq!(cfg.history_capacity, WriteBackConfig::default().history_capacity);
    clear_env();
}

#[test]
#[serial]
fn bad_env_values_are_reported_with_key() {
    clear_env();
    set_env("HETERORT_WRITEBACK_HISTORY_CAPACITY", "many");
    match WriteBackConfig::from_env() {
        Err(ConfigError::EnvOverride { key, value, .. }) => {
            assert_eq!(key, "HETERORT_WRITEBACK_HISTORY_CAPACITY");
            assert_eq!(value, "many");
        }
        other => panic!("expected EnvOverride, got {other:?}"),
    }

    clear_env();
    set_env("HETERORT_WRITEBACK_BLOCKING", "sometimes");
    assert!(matches!(WriteBackConfig::from_env(), Err(ConfigError::EnvOverride { .. })));
    clear_env();
}

#[test]
#[serial]
fn capacity_hint_never_limits_history() {
    clear_env();
    let cfg = WriteBackConfig::from_toml("history_capacity = 1").unwrap();
    let engine = WriteBackEngine::with_config(RecordingScheduler::new(), cfg);
    let id = BufferId::new(0x42);
    engine.register_buffer(id, BufferGeometry::buffer(4));
    let first_writer = ExecutionContext::new();
    engine.record_device_access(id, AccessMode::Write, first_writer);
    for _ in 0..20 {
        engine.record_device_access(id, AccessMode::Read, ExecutionContext::new());
    }
    assert_eq!(engine.history(id).len(), 21);
    assert_eq!(engine.context_for_write_back(id), Some(first_writer));
}
