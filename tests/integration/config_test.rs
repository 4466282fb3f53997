//! Configuration file tests

use tick_ingest::config::{Config, StorageBackend, WriteMode};
use tick_ingest::decoder::SubscriptionMode;

#[test]
fn test_config_example_parses() {
    let config: Config = toml::from_str(include_str!("../../config.toml.example")).unwrap();
    config.validate().unwrap();

    assert_eq!(config.feed.mode, SubscriptionMode::Quote);
    assert_eq!(config.feed.tokens(), vec!["2885", "1594", "11536", "3045", "3787"]);
    assert_eq!(config.pipeline.write_mode, WriteMode::Single);
    assert_eq!(config.storage.backend, StorageBackend::Parquet);
    assert_eq!(config.supervisor.backoff_config().max_elapsed_time.unwrap().as_secs(), 300);
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        [storage]
        backend = "memory"

        [pipeline]
        write_mode = "batch"
        "#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.pipeline.write_mode, WriteMode::Batch);
    assert_eq!(config.feed.tokens().len(), 5);
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Parquet);
}

#[test]
fn test_invalid_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[pipeline]\nnum_workers = 0\n").unwrap();

    assert!(Config::load_or_default(&path).is_err());
}
