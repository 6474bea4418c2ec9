//! Configuration resolution tests
//!
//! Covers TOML parsing with partial files, compiled defaults, environment
//! overrides and config path priority.
//!
//! Note: Uses serial_test to prevent ENV variable race conditions between
//! tests that set or clear `SOLA_*` variables.

use serial_test::serial;
use sola_common::config::{load_config, resolve_config_path, TomlConfig, CONFIG_ENV_VAR};
use sola_common::ShardTarget;
use std::env;
use std::io::Write;
use std::path::PathBuf;

fn clear_sola_env() {
    for name in [
        CONFIG_ENV_VAR,
        "SOLA_DATABASE_PATH",
        "SOLA_REDIS_URL",
        "SOLA_SHARDS",
        "SOLA_SOLR_LIST",
        "SOLA_MEDIA_URL",
        "SOLA_MEDIA_SALT",
        "SOLA_ACCURACY",
        "SOLA_ALGO",
    ] {
        env::remove_var(name);
    }
}

#[test]
fn test_empty_toml_uses_compiled_defaults() {
    let config = TomlConfig::from_toml_str("").unwrap();

    assert!(config.redis_url.is_none());
    assert_eq!(config.search.initial_candidates, 1_000_000);
    assert_eq!(config.search.merge_window_secs, 5.0);
    assert_eq!(config.search.top_k, 10);
    assert_eq!(config.search.queue_cap, 5);
    assert_eq!(config.search.counter_ttl_secs, 60);
    assert_eq!(config.search.query_handler, "lireq");
    assert_eq!(config.scheduler.algorithm, "cl");
    assert_eq!(config.scheduler.admin_status_path, "admin/cores?wt=json");
}

#[test]
fn test_partial_toml_keeps_other_defaults() {
    let config = TomlConfig::from_toml_str(
        r#"
        redis_url = "redis://cache:6379"

        [search]
        shards = ["http://solr-a:8983/solr/cl_0/", "http://solr-b:8983/solr/cl_1"]
        merge_window_secs = 2.0
        media_salt = "pepper"

        [scheduler]
        algorithm = "cl_ha"
        "#,
    )
    .unwrap();

    assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
    assert_eq!(
        config.search.shards,
        vec![
            ShardTarget::new("http://solr-a:8983/solr/cl_0"),
            ShardTarget::new("http://solr-b:8983/solr/cl_1"),
        ]
    );
    assert_eq!(config.search.merge_window_secs, 2.0);
    assert_eq!(config.search.media_salt, "pepper");
    assert_eq!(config.search.rows, 30);
    assert_eq!(config.scheduler.algorithm, "cl_ha");
    assert_eq!(config.scheduler.pass_interval_ms, 10_000);
}

#[test]
fn test_malformed_toml_is_config_error() {
    let result = TomlConfig::from_toml_str("[search\nshards = 3");
    assert!(matches!(result, Err(sola_common::Error::Config(_))));
}

#[test]
#[serial]
fn test_env_overrides_file_values() {
    clear_sola_env();
    let mut config = TomlConfig::from_toml_str(
        r#"
        [search]
        media_url = "http://file-value"
        "#,
    )
    .unwrap();

    env::set_var("SOLA_MEDIA_URL", "http://env-value");
    env::set_var("SOLA_SHARDS", "http://a/solr/cl_0,http://b/solr/cl_1");
    env::set_var("SOLA_ACCURACY", "not-a-number");
    config.apply_env_overrides();
    clear_sola_env();

    assert_eq!(config.search.media_url, "http://env-value");
    assert_eq!(config.search.shards.len(), 2);
    assert_eq!(config.scheduler.shards, config.search.shards);
    // Unparseable values are ignored rather than fatal
    assert_eq!(config.search.accuracy, 100);
}

#[test]
#[serial]
fn test_cli_path_beats_env_path() {
    clear_sola_env();
    env::set_var(CONFIG_ENV_VAR, "/tmp/sola-env-config.toml");

    let cli = PathBuf::from("/tmp/sola-cli-config.toml");
    assert_eq!(resolve_config_path(Some(&cli)), Some(cli.clone()));
    assert_eq!(
        resolve_config_path(None),
        Some(PathBuf::from("/tmp/sola-env-config.toml"))
    );

    clear_sola_env();
}

#[test]
#[serial]
fn test_load_config_reads_file_then_env() {
    clear_sola_env();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[scheduler]\nalgorithm = \"eh\"\nsolr_servers = [\"http://x/solr/\"]").unwrap();

    env::set_var("SOLA_ALGO", "jc");
    let config = load_config(Some(file.path())).unwrap();
    clear_sola_env();

    assert_eq!(config.scheduler.algorithm, "jc");
    assert_eq!(config.scheduler.solr_servers, vec!["http://x/solr/".to_string()]);
}

#[test]
#[serial]
fn test_explicit_missing_file_is_error() {
    clear_sola_env();
    let missing = PathBuf::from("/nonexistent/sola/config.toml");
    assert!(load_config(Some(&missing)).is_err());
}

#[test]
fn test_logging_level_drives_fallback_filter() {
    let config = TomlConfig::default();
    assert_eq!(
        config.logging.filter_directive("sola_search"),
        "sola_search=info,tower_http=info"
    );

    let config = TomlConfig::from_toml_str("[logging]\nlevel = \"debug\"\n").unwrap();
    assert_eq!(
        config.logging.filter_directive("sola_scheduler"),
        "sola_scheduler=debug,tower_http=debug"
    );

    let config =
        TomlConfig::from_toml_str("[logging]\nlevel = \"sola_search=trace,sqlx=warn\"\n").unwrap();
    assert_eq!(
        config.logging.filter_directive("sola_search"),
        "sola_search=trace,sqlx=warn"
    );
}
