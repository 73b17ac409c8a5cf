//! Tests for engine configuration loading
//!
//! Environment variable tests mutate process state, so they run under
//! `#[serial]`.

use std::fs;

use querydeck_core::config::CONFIG_FILE_NAME;
use querydeck_core::{EngineConfig, QueryEngine};
use serial_test::serial;
use tempfile::TempDir;

const ENV_VARS: &[&str] = &[
    "QUERYDECK_CONFIG_DIR",
    "QUERYDECK_CACHE_ENABLED",
    "QUERYDECK_CACHE_MAX_SIZE_BYTES",
    "QUERYDECK_SCHEDULER_POLL_INTERVAL_MS",
    "QUERYDECK_SCHEDULER_THREAD_STACK_SIZE_BYTES",
    "QUERYDECK_FILTER_FORCE_SCALAR",
    "QUERYDECK_FILTER_PARALLEL_THRESHOLD_ROWS",
    "QUERYDECK_TRANSACTION_BEGIN_COMMAND",
    "QUERYDECK_TRANSACTION_AUTO_COMMIT",
    "QUERYDECK_HISTORY_MAX_ITEMS",
];

fn clear_env() {
    for name in ENV_VARS {
        unsafe {
            std::env::remove_var(name);
        }
    }
}

fn write_config(dir: &TempDir, content: &str) {
    fs::write(dir.path().join(CONFIG_FILE_NAME), content).unwrap();
}

#[test]
fn test_from_file_partial_sections() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
[cache]
max_size_bytes = 4096

[transaction]
begin_command = "START TRANSACTION"
commit_command = "COMMIT"
rollback_command = "ROLLBACK"
"#,
    );

    let config = EngineConfig::from_file(dir.path().join(CONFIG_FILE_NAME)).unwrap();
    assert!(config.cache.enabled);
    assert_eq!(config.cache.max_size_bytes, 4096);
    assert_eq!(config.transaction.begin_command, "START TRANSACTION");
    assert!(config.transaction.auto_commit);
    // Untouched sections keep defaults
    assert_eq!(config.scheduler.poll_interval_ms, 5);
    assert_eq!(config.history.max_items, 1000);
}

#[test]
fn test_from_file_errors() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        EngineConfig::from_file(dir.path().join("absent.toml")),
        Err(querydeck_core::Error::Io(_))
    ));

    write_config(&dir, "[cache]\nmax_size_bytes = \"lots\"\n");
    let err = EngineConfig::from_file(dir.path().join(CONFIG_FILE_NAME)).unwrap_err();
    assert!(matches!(err, querydeck_core::Error::Config(_)));
}

#[test]
fn test_from_config_dir() {
    let dir = TempDir::new().unwrap();
    assert!(EngineConfig::from_config_dir(dir.path()).is_none());

    write_config(&dir, "not = [valid");
    assert!(EngineConfig::from_config_dir(dir.path()).is_none());

    write_config(&dir, "[history]\nenabled = false\n");
    let config = EngineConfig::from_config_dir(dir.path()).unwrap();
    assert!(!config.history.enabled);
}

#[test]
#[serial]
fn test_from_env_reads_config_dir() {
    clear_env();
    let dir = TempDir::new().unwrap();
    write_config(&dir, "[filter]\nforce_scalar = true\nparallel_threshold_rows = 10\n");

    unsafe {
        std::env::set_var("QUERYDECK_CONFIG_DIR", dir.path());
    }
    let config = EngineConfig::from_env();
    assert!(config.filter.force_scalar);
    assert_eq!(config.filter.parallel_threshold_rows, 10);

    clear_env();
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let dir = TempDir::new().unwrap();
    write_config(&dir, "[cache]\nmax_size_bytes = 4096\n\n[history]\nmax_items = 5\n");

    unsafe {
        std::env::set_var("QUERYDECK_CONFIG_DIR", dir.path());
        std::env::set_var("QUERYDECK_CACHE_MAX_SIZE_BYTES", "8192");
        std::env::set_var("QUERYDECK_CACHE_ENABLED", "false");
        std::env::set_var("QUERYDECK_SCHEDULER_THREAD_STACK_SIZE_BYTES", "1048576");
        std::env::set_var("QUERYDECK_TRANSACTION_BEGIN_COMMAND", "BEGIN");
        std::env::set_var("QUERYDECK_TRANSACTION_AUTO_COMMIT", "false");
    }
    let config = EngineConfig::from_env();
    assert_eq!(config.cache.max_size_bytes, 8192);
    assert!(!config.cache.enabled);
    assert_eq!(config.scheduler.thread_stack_size_bytes, Some(1_048_576));
    assert_eq!(config.transaction.begin_command, "BEGIN");
    assert!(!config.transaction.auto_commit);
    // From file
    assert_eq!(config.history.max_items, 5);

    clear_env();
}

#[test]
#[serial]
fn test_invalid_env_values_are_ignored() {
    clear_env();
    unsafe {
        std::env::set_var("QUERYDECK_CONFIG_DIR", "/nonexistent/querydeck");
        std::env::set_var("QUERYDECK_CACHE_MAX_SIZE_BYTES", "big");
        std::env::set_var("QUERYDECK_SCHEDULER_POLL_INTERVAL_MS", "-3");
        std::env::set_var("QUERYDECK_SCHEDULER_THREAD_STACK_SIZE_BYTES", "huge");
        std::env::set_var("QUERYDECK_FILTER_FORCE_SCALAR", "maybe");
        std::env::set_var("QUERYDECK_HISTORY_MAX_ITEMS", " 25 ");
    }
    let config = EngineConfig::from_env();
    let defaults = EngineConfig::default();
    assert_eq!(config.cache.max_size_bytes, defaults.cache.max_size_bytes);
    assert_eq!(config.scheduler.poll_interval_ms, defaults.scheduler.poll_interval_ms);
    assert_eq!(config.scheduler.thread_stack_size_bytes, None);
    assert!(!config.filter.force_scalar);
    assert_eq!(config.history.max_items, 25);

    clear_env();
}

#[test]
#[serial]
fn test_engine_from_env_config() {
    clear_env();
    unsafe {
        std::env::set_var("QUERYDECK_CONFIG_DIR", "/nonexistent/querydeck");
        std::env::set_var("QUERYDECK_FILTER_FORCE_SCALAR", "true");
        std::env::set_var("QUERYDECK_CACHE_MAX_SIZE_BYTES", "2048");
    }
    let engine = QueryEngine::new(EngineConfig::from_env());
    assert!(!engine.filter().is_accelerated());
    assert_eq!(engine.cache().max_size_bytes(), 2048);

    clear_env();
}
