use std::io::Write;

use procflow_core::{ProcflowConfig, ProcflowError};
use procflow_engine::HealthScorer;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
default_task_timeout_ms = 2500
span_buffer = 64
max_instance_concurrency = 4

[scoring]
expected_task_kinds = ["charge", "ship"]
span_attributes = ["branch"]

[scoring.weights]
structural = 0.4
coverage = 0.2
performance = 0.2
semantic = 0.2

[scoring.duration_thresholds_ms]
charge = 500

[scoring.required_attributes]
charge = ["boundary.outcome"]

[scoring.thresholds]
healthy = 0.9
degraded = 0.6

[log]
log_dir = "/tmp/procflow-test-logs"
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(toml_content.as_bytes()).unwrap();

    let config = ProcflowConfig::load(tmp.path()).unwrap();

    assert_eq!(config.engine.default_task_timeout_ms, Some(2500));
    assert_eq!(config.engine.span_buffer, 64);
    assert_eq!(config.engine.max_instance_concurrency, 4);

    assert_eq!(config.scoring.expected_task_kinds, vec!["charge", "ship"]);
    assert_eq!(config.scoring.weights.structural, 0.4);
    assert_eq!(config.scoring.duration_thresholds_ms.get("charge"), Some(&500));
    assert_eq!(
        config.scoring.required_attributes.get("charge"),
        Some(&vec!["boundary.outcome".to_string()])
    );
    assert_eq!(config.scoring.thresholds.healthy, 0.9);

    let log = config.log.as_ref().unwrap();
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(
        config.log_dir().unwrap().to_str(),
        Some("/tmp/procflow-test-logs")
    );

    assert!(HealthScorer::new(config.scoring).is_ok());
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"").unwrap();

    let config = ProcflowConfig::load(tmp.path()).unwrap();

    assert_eq!(config.engine.default_task_timeout_ms, None);
    assert_eq!(config.engine.span_buffer, 256);
    assert_eq!(config.scoring.weights.semantic, 0.25);
    assert_eq!(config.scoring.thresholds.degraded, 0.5);
    assert!(config.log.is_none());
    assert!(config.log_dir().is_none());
}

#[test]
fn test_weights_not_summing_to_one_fail_at_scorer_construction() {
    let toml_content = r#"
[scoring.weights]
structural = 0.7
coverage = 0.7
"#;
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(toml_content.as_bytes()).unwrap();

    // The file itself parses; the rule set is rejected when used.
    let config = ProcflowConfig::load(tmp.path()).unwrap();
    assert!(matches!(
        HealthScorer::new(config.scoring),
        Err(ProcflowError::Config(_))
    ));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("PROCFLOW_TEST_LOG_DIR", "/tmp/procflow-env-logs");
    let toml_content = r#"
[log]
log_dir = "${PROCFLOW_TEST_LOG_DIR}"
"#;
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(toml_content.as_bytes()).unwrap();

    let config = ProcflowConfig::load(tmp.path()).unwrap();
    assert_eq!(
        config.log.unwrap().log_dir,
        "/tmp/procflow-env-logs"
    );
}

#[test]
fn test_invalid_toml_is_a_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"[engine\nspan_buffer = ").unwrap();

    assert!(matches!(
        ProcflowConfig::load(tmp.path()),
        Err(ProcflowError::Config(_))
    ));
}
