//! Scenario: Config Hash Stable
//!
//! GREEN when:
//! - Loading the same documents twice yields the same config_hash.
//! - Reordering keys within a document does not change the hash.
//! - Different values produce different hashes.

use conveyor_config::load_layered_yaml_from_strings;

const BASE_YAML: &str = r#"
reconcile:
  activity: "default"
  tool_id: "conveyor"
  max_retries: 3
transfer_tool:
  endpoint: "https://fts3.example:8446"
database:
  url_env: "CONVEYOR_DATABASE_URL"
"#;

const BASE_YAML_REORDERED: &str = r#"
database:
  url_env: "CONVEYOR_DATABASE_URL"
transfer_tool:
  endpoint: "https://fts3.example:8446"
reconcile:
  max_retries: 3
  tool_id: "conveyor"
  activity: "default"
"#;

const OVERLAY_YAML: &str = r#"
reconcile:
  max_retries: 5
"#;

#[test]
fn same_input_same_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.config_hash.len(), 64, "sha256 hex digest");
}

#[test]
fn key_order_does_not_change_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.canonical_json, b.canonical_json);
}

#[test]
fn overlay_changes_hash_and_value() {
    let base = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let layered = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    assert_ne!(base.config_hash, layered.config_hash);
    assert_eq!(layered.config_json["reconcile"]["max_retries"], 5);
    assert_eq!(layered.config_json["reconcile"]["tool_id"], "conveyor");
}

#[test]
fn empty_overlay_is_a_no_op() {
    let base = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let layered = load_layered_yaml_from_strings(&[BASE_YAML, ""]).unwrap();
    assert_eq!(base.config_hash, layered.config_hash);
}
