use conveyor_config::{load_layered_yaml_from_strings, report_unused_keys, UnusedKeyPolicy};

/// Validates:
/// 1) Unused keys are detected in WARN mode but do not error.
/// 2) Unused keys cause failure in FAIL mode.
/// 3) Keys the typed config reads are not flagged.
/// 4) A misspelled key inside a known section is flagged.

#[test]
fn warn_mode_reports_unused_keys_without_error() {
    let yaml = r#"
daemon:
  batch_size: 10

legacy_poller:
  sleep: 5
  threads: 4
"#;
    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("config load must succeed");

    let report = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)
        .expect("warn mode must not error");

    assert_eq!(
        report.unused_leaf_pointers,
        vec![
            "/legacy_poller/sleep".to_string(),
            "/legacy_poller/threads".to_string()
        ]
    );
}

#[test]
fn fail_mode_errors_on_unused_keys() {
    let yaml = r#"
reconcile:
  max_retries: 2
typo_section:
  foo: 1
"#;
    let loaded = load_layered_yaml_from_strings(&[yaml]).unwrap();
    let err = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Fail)
        .unwrap_err()
        .to_string();
    assert!(err.contains("CONFIG_UNUSED_KEYS"));
    assert!(err.contains("/typo_section/foo"));
}

#[test]
fn consumed_sections_are_clean() {
    let yaml = r#"
reconcile:
  activity: "default"
transfer_tool:
  endpoint: "https://fts3.example:8446"
daemon:
  max_in_flight: 4
database:
  max_connections: 5
"#;
    let loaded = load_layered_yaml_from_strings(&[yaml]).unwrap();
    let report = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Fail).unwrap();
    assert!(report.is_clean());
}

#[test]
fn typo_inside_consumed_section_is_reported() {
    let yaml = r#"
transfer_tool:
  endpoint: "https://fts3.example:8446"
daemon:
  max_inflight: 1
"#;
    let loaded = load_layered_yaml_from_strings(&[yaml]).unwrap();

    let report = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn).unwrap();
    assert_eq!(report.unused_leaf_pointers, vec!["/daemon/max_inflight".to_string()]);

    let err = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Fail)
        .unwrap_err()
        .to_string();
    assert!(err.contains("/daemon/max_inflight"));
}
