//! Config file loading and validation tests.

mod common;

use std::time::Duration;

use common::temp_config;
use swapgate::config::{Config, ConfigError, PolicyKind};

fn valid_config() -> Config {
    let mut config = Config::default();
    config.backend.command = "npm".to_string();
    config
}

#[test]
fn test_config_default_values() {
    let config = Config::default();

    assert_eq!(config.defaults.timeout_seconds, 30);
    assert_eq!(config.defaults.connect_timeout_seconds, 5);
    assert_eq!(config.proxy.bind_addr, "127.0.0.1:3000");
    assert_eq!(config.proxy.tunnel_addr(), Some("127.0.0.1:3001"));
    assert!(config.proxy.admin_prefix.is_none());
    assert_eq!(config.backend.port_env, "PORT");
    assert_eq!(config.backend.artifact_path, "/");
    assert_eq!(config.swap.policies, vec![PolicyKind::ColdStart]);
    assert_eq!(config.swap.hold_timeout(), Some(Duration::from_secs(30)));
    assert_eq!(config.swap.drain_timeout(), Duration::from_secs(10));
    assert!(!config.swap.fallback_on_failure);
}

#[test]
fn test_config_path_ends_with_expected() {
    let path = Config::config_path();
    assert!(path.ends_with("swapgate/config.toml"));
}

#[test]
fn test_missing_file_returns_defaults() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.proxy.bind_addr, "127.0.0.1:3000");
}

#[test]
fn test_load_full_file() {
    let (_dir, path) = temp_config(
        r#"
[defaults]
timeout_seconds = 10

[proxy]
bind_addr = "127.0.0.1:4000"
tunnel_bind_addr = ""
admin_prefix = "/_admin"

[backend]
command = "node"
args = ["server.js"]
sideband_port_env = "HMR_PORT"
artifact_path = "/__build"

[backend.env]
NODE_ENV = "development"

[swap]
policies = ["cold_start", "nth_request", "stale_source"]
nth_request = 20
hold_timeout_ms = 0
fallback_on_failure = true
watch_paths = ["src"]
"#,
    );

    let config = Config::load_from(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.defaults.request_timeout(), Duration::from_secs(10));
    assert_eq!(config.defaults.connect_timeout_seconds, 5);
    assert_eq!(config.proxy.bind_addr, "127.0.0.1:4000");
    assert_eq!(config.proxy.tunnel_addr(), None);
    assert_eq!(config.proxy.admin_prefix.as_deref(), Some("/_admin"));
    assert_eq!(config.backend.command, "node");
    assert_eq!(config.backend.args, vec!["server.js"]);
    assert_eq!(config.backend.sideband_port_env.as_deref(), Some("HMR_PORT"));
    assert_eq!(config.backend.env.get("NODE_ENV").map(String::as_str), Some("development"));
    assert_eq!(
        config.swap.policies,
        vec![PolicyKind::ColdStart, PolicyKind::NthRequest, PolicyKind::StaleSource]
    );
    assert_eq!(config.swap.nth_request, Some(20));
    assert_eq!(config.swap.hold_timeout(), None);
    assert!(config.swap.fallback_on_failure);
}

#[test]
fn test_invalid_toml_is_parse_error() {
    let (_dir, path) = temp_config("[proxy\nbind_addr = ");
    let err = Config::load_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::ParseError { .. }));
}

#[test]
fn test_unknown_policy_is_parse_error() {
    let (_dir, path) = temp_config("[swap]\npolicies = [\"sometimes\"]\n");
    let err = Config::load_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::ParseError { .. }));
}

#[test]
fn test_validation_requires_command() {
    let err = Config::default().validate().unwrap_err();
    assert!(err.to_string().contains("backend.command"));
}

#[test]
fn test_validation_passes_for_minimal_config() {
    assert!(valid_config().validate().is_ok());
}

#[test]
fn test_validation_rejects_bad_bind_addr() {
    let mut config = valid_config();
    config.proxy.bind_addr = "localhost".to_string();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("proxy.bind_addr"));
}

#[test]
fn test_validation_rejects_bad_admin_prefix() {
    for prefix in ["admin", "/", "/admin/"] {
        let mut config = valid_config();
        config.proxy.admin_prefix = Some(prefix.to_string());
        assert!(config.validate().is_err(), "prefix {:?}", prefix);
    }
}

#[test]
fn test_validation_checks_policy_settings() {
    let mut config = valid_config();
    config.swap.policies = vec![PolicyKind::NthRequest];
    assert!(config.validate().is_err());
    config.swap.nth_request = Some(0);
    assert!(config.validate().is_err());
    config.swap.nth_request = Some(5);
    assert!(config.validate().is_ok());

    config.swap.policies = vec![PolicyKind::Path];
    assert!(config.validate().is_err());
    config.swap.path_contains = Some("/__reload".to_string());
    assert!(config.validate().is_ok());

    config.swap.policies = vec![PolicyKind::StaleSource];
    assert!(config.validate().is_err());

    config.swap.policies = Vec::new();
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_eager_requires_watch_paths() {
    let mut config = valid_config();
    config.swap.eager_on_change = true;
    assert!(config.validate().is_err());
    config.swap.watch_paths = vec!["src".into()];
    assert!(config.validate().is_ok());
}
