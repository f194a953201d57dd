use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProcflowError, Result};

/// Top-level procflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcflowConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scoring: ScoringRules,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to task nodes that do not declare their own.
    #[serde(default)]
    pub default_task_timeout_ms: Option<u64>,
    /// Capacity of the span broadcast channel.
    #[serde(default = "default_span_buffer")]
    pub span_buffer: usize,
    /// Cap on concurrently running multi-instance elements (0 = unbounded).
    #[serde(default)]
    pub max_instance_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_task_timeout_ms: None,
            span_buffer: default_span_buffer(),
            max_instance_concurrency: 0,
        }
    }
}

fn default_span_buffer() -> usize {
    256
}

/// JSONL span log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable span logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run root and failures, 2 = + task attempts, 3 = everything.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> String {
    "./procflow-logs".to_string()
}

fn default_log_level() -> u8 {
    2
}

/// Rule set consumed by the health scorer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoringRules {
    #[serde(default)]
    pub weights: DimensionWeights,
    /// Task kinds that must produce at least one span.
    #[serde(default)]
    pub expected_task_kinds: Vec<String>,
    /// Maximum duration per task kind. Kinds without an entry are not measured.
    #[serde(default)]
    pub duration_thresholds_ms: BTreeMap<String, u64>,
    /// Attributes every span of a given task kind must carry.
    #[serde(default)]
    pub required_attributes: BTreeMap<String, Vec<String>>,
    /// Attributes every span must carry, regardless of kind.
    #[serde(default)]
    pub span_attributes: Vec<String>,
    #[serde(default)]
    pub thresholds: StatusThresholds,
}

/// Weights of the four health dimensions. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionWeights {
    #[serde(default = "default_weight")]
    pub structural: f64,
    #[serde(default = "default_weight")]
    pub coverage: f64,
    #[serde(default = "default_weight")]
    pub performance: f64,
    #[serde(default = "default_weight")]
    pub semantic: f64,
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            structural: default_weight(),
            coverage: default_weight(),
            performance: default_weight(),
            semantic: default_weight(),
        }
    }
}

fn default_weight() -> f64 {
    0.25
}

/// Score boundaries between health states.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusThresholds {
    /// Minimum score for `healthy`.
    #[serde(default = "default_healthy")]
    pub healthy: f64,
    /// Minimum score for `degraded`.
    #[serde(default = "default_degraded")]
    pub degraded: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            healthy: default_healthy(),
            degraded: default_degraded(),
        }
    }
}

fn default_healthy() -> f64 {
    0.8
}

fn default_degraded() -> f64 {
    0.5
}

impl ProcflowConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ProcflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ProcflowError::Config(e.to_string()))
    }

    /// Resolve the span log directory (expand ~).
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        if let Some(rest) = log.log_dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return Some(home.join(rest));
            }
        }
        Some(PathBuf::from(&log.log_dir))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
