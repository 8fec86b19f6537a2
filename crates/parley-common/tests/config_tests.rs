//! ---
//! parley_section: "01-shared-runtime"
//! parley_subsection: "tests"
//! parley_type: "source"
//! parley_scope: "test"
//! parley_description: "Configuration loading and tracing bootstrap checks."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
use std::time::Duration;

use parley_common::{init_tracing, log_file_name, BusConfig, HostFlavor, LogFormat, LoggingConfig};

#[test]
fn load_picks_first_existing_candidate() {
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("missing.toml");
    let present = dir.path().join("parley.toml");
    std::fs::write(
        &present,
        r#"
[host]
flavor = "strict"

[locate]
retry_interval_ms = 5
max_attempts = 3

[logging]
format = "pretty"
file_prefix = "ext"
"#,
    )
    .expect("write config");

    let loaded = BusConfig::load_with_source(&[missing, present.clone()]).expect("config loads");
    assert_eq!(loaded.source, present);
    assert_eq!(loaded.config.host.flavor, HostFlavor::Strict);
    assert_eq!(loaded.config.locate.retry_interval, Duration::from_millis(5));
    assert_eq!(loaded.config.locate.max_attempts, 3);
    assert_eq!(loaded.config.logging.format, LogFormat::Pretty);
    assert_eq!(loaded.config.logging.file_prefix.as_deref(), Some("ext"));
}

#[test]
fn load_reports_inspected_paths_when_nothing_exists() {
    let dir = tempfile::tempdir().expect("temp dir");
    let candidate = dir.path().join("absent.toml");
    let err = BusConfig::load(&[candidate]).expect_err("no config present");
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn init_tracing_is_repeatable() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = LoggingConfig {
        directory: dir.path().to_path_buf(),
        format: LogFormat::Pretty,
        file_prefix: None,
    };
    init_tracing("config-tests", &config).expect("first init");
    init_tracing("config-tests", &config).expect("second init is a no-op");

    let stem = log_file_name("config-tests", &config);
    assert_eq!(stem, "parley-config-tests.log");
    let rolled = std::fs::read_dir(dir.path())
        .expect("log dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(&stem))
        .count();
    assert_eq!(rolled, 1);
}
