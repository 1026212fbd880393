//! Configuration loading tests

use ipcookie_node::config::{CookieConfig, UnmarkedPolicy};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_toml(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_shipped_default_config_loads() {
    let config = CookieConfig::from_file("../config/default").expect("shipped config loads");
    assert!(config.validate().is_ok());
    assert_eq!(config.protocol.fallback_lt2, 8);
    assert_eq!(config.cache.capacity, 4096);
    assert_eq!(config.rotation.interval_seconds, 64);
}

#[test]
fn test_partial_file_keeps_defaults() {
    let file = write_toml(
        r#"
[protocol]
t_recover_seconds = 5

[policy]
disabled_prefixes = ["fe80::/10"]
unmarked_traffic = "drop"
"#,
    );

    let config = CookieConfig::from_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.protocol.t_recover_seconds, 5);
    assert_eq!(config.protocol.try_lt2, 3);
    assert_eq!(config.cache.capacity, 4096);
    assert_eq!(config.policy.unmarked_traffic, UnmarkedPolicy::Drop);
    assert_eq!(config.policy.parsed_disabled_prefixes().len(), 1);
    assert!(config.validate().is_ok());
}

#[test]
fn test_invalid_values_fail_validation() {
    let file = write_toml(
        r#"
[cache]
capacity = 0
"#,
    );

    let config = CookieConfig::from_file(file.path().to_str().unwrap()).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_missing_file_is_an_error() {
    assert!(CookieConfig::from_file("/nonexistent/ipcookies").is_err());
}

#[test]
fn test_save_and_reload() {
    let mut config = CookieConfig::default();
    config.cache.capacity = 128;
    config.rotation.interval_seconds = 32;
    config.policy.disabled_prefixes = vec!["2001:db8::/48".to_string()];
    config.metrics.enabled = true;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("saved.toml");
    config.save_to_file(path.to_str().unwrap()).unwrap();

    let reloaded = CookieConfig::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(reloaded.cache.capacity, 128);
    assert_eq!(reloaded.rotation.interval_seconds, 32);
    assert_eq!(reloaded.policy.disabled_prefixes, config.policy.disabled_prefixes);
    assert!(reloaded.metrics.enabled);
    assert!(reloaded.validate().is_ok());
}

#[test]
fn test_environment_overrides_file() {
    let file = write_toml(
        r#"
[daemon]
recv_timeout_ms = 250
"#,
    );

    std::env::set_var("IPCOOKIES_DAEMON__RECV_TIMEOUT_MS", "750");
    let config = CookieConfig::from_file(file.path().to_str().unwrap());
    std::env::remove_var("IPCOOKIES_DAEMON__RECV_TIMEOUT_MS");

    assert_eq!(config.unwrap().daemon.recv_timeout_ms, 750);
}
