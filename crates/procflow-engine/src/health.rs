use std::collections::{HashMap, HashSet};

use procflow_core::config::DimensionWeights;
use procflow_core::{ProcflowError, Result, ScoringRules, Span, SpanId};
use serde::{Deserialize, Serialize};

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Classification of an overall health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Structural,
    Coverage,
    Performance,
    Semantic,
}

/// Per-dimension scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub structural: f64,
    pub coverage: f64,
    pub performance: f64,
    pub semantic: f64,
}

impl DimensionScores {
    fn weighted(&self, w: &DimensionWeights) -> f64 {
        let sum = self.structural * w.structural
            + self.coverage * w.coverage
            + self.performance * w.performance
            + self.semantic * w.semantic;
        sum.clamp(0.0, 1.0)
    }
}

/// One reason a span (or the run as a whole) lost points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    /// The failing span. Coverage issues point at the run root.
    pub span_id: Option<SpanId>,
    pub dimension: Dimension,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: f64,
    pub dimensions: DimensionScores,
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
}

/// Scores a completed span collection against a rule set.
///
/// Scoring is a pure function of the spans and rules: the same input always
/// yields the same report.
#[derive(Debug, Clone)]
pub struct HealthScorer {
    rules: ScoringRules,
}

impl HealthScorer {
    /// Validate the rules. Weights must be non-negative and sum to 1.
    pub fn new(rules: ScoringRules) -> Result<Self> {
        let w = rules.weights;
        let all = [w.structural, w.coverage, w.performance, w.semantic];
        if all.iter().any(|x| !x.is_finite() || *x < 0.0) {
            return Err(ProcflowError::Config(
                "scoring weights must be finite and non-negative".to_string(),
            ));
        }
        let total: f64 = all.iter().sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ProcflowError::Config(format!(
                "scoring weights must sum to 1, got {}",
                total
            )));
        }

        let t = rules.thresholds;
        if !(0.0..=1.0).contains(&t.degraded)
            || !(0.0..=1.0).contains(&t.healthy)
            || t.degraded > t.healthy
        {
            return Err(ProcflowError::Config(format!(
                "status thresholds must satisfy 0 <= degraded ({}) <= healthy ({}) <= 1",
                t.degraded, t.healthy
            )));
        }

        Ok(Self { rules })
    }

    pub fn rules(&self) -> &ScoringRules {
        &self.rules
    }

    pub fn score(&self, spans: &[Span]) -> HealthReport {
        let mut ordered: Vec<&Span> = spans.iter().collect();
        ordered.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.id.cmp(&b.id)));

        let mut issues = Vec::new();
        let dimensions = DimensionScores {
            structural: self.structural(&ordered, &mut issues),
            coverage: self.coverage(&ordered, &mut issues),
            performance: self.performance(&ordered, &mut issues),
            semantic: self.semantic(&ordered, &mut issues),
        };

        let overall = dimensions.weighted(&self.rules.weights);
        let thresholds = self.rules.thresholds;
        let status = if overall >= thresholds.healthy {
            HealthStatus::Healthy
        } else if overall >= thresholds.degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport {
            overall,
            dimensions,
            status,
            issues,
        }
    }

    /// Fraction of spans that are well-formed and correctly parented.
    fn structural(&self, spans: &[&Span], issues: &mut Vec<HealthIssue>) -> f64 {
        if spans.is_empty() {
            issues.push(HealthIssue {
                span_id: None,
                dimension: Dimension::Structural,
                reason: "span collection is empty".to_string(),
            });
            return 0.0;
        }

        let by_id: HashMap<&SpanId, &Span> = spans.iter().map(|s| (&s.id, *s)).collect();
        let root = spans.iter().find(|s| s.is_root()).map(|s| &s.id);

        let mut valid = 0usize;
        for span in spans {
            match self.structural_problem(span, root, &by_id) {
                Some(reason) => issues.push(HealthIssue {
                    span_id: Some(span.id.clone()),
                    dimension: Dimension::Structural,
                    reason,
                }),
                None => valid += 1,
            }
        }
        ratio(valid, spans.len())
    }

    fn structural_problem<'a>(
        &self,
        span: &'a Span,
        root: Option<&SpanId>,
        by_id: &HashMap<&'a SpanId, &'a Span>,
    ) -> Option<String> {
        if span.node_id.is_empty() {
            return Some("node id is empty".to_string());
        }
        if span.task_kind.is_empty() {
            return Some("task kind is empty".to_string());
        }
        if span.ended_at < span.started_at {
            return Some("ends before it starts".to_string());
        }
        if let Some(missing) = self
            .rules
            .span_attributes
            .iter()
            .find(|key| !span.attributes.contains_key(*key))
        {
            return Some(format!("missing required attribute '{}'", missing));
        }

        match &span.parent_id {
            None if root == Some(&span.id) => None,
            None => Some("second root span".to_string()),
            Some(parent) if !by_id.contains_key(parent) => {
                Some(format!("parent '{}' does not exist", parent))
            }
            Some(_) => {
                // Walk up to the root; a repeat means a cycle.
                let mut seen = HashSet::from([&span.id]);
                let mut current = span;
                while let Some(parent) = &current.parent_id {
                    if !seen.insert(parent) {
                        return Some("parent chain contains a cycle".to_string());
                    }
                    match by_id.get(parent) {
                        Some(next) => current = *next,
                        None => return Some(format!("ancestor '{}' does not exist", parent)),
                    }
                }
                None
            }
        }
    }

    /// Fraction of expected task kinds that produced at least one span.
    fn coverage(&self, spans: &[&Span], issues: &mut Vec<HealthIssue>) -> f64 {
        let expected = &self.rules.expected_task_kinds;
        if expected.is_empty() {
            return 1.0;
        }
        let seen: HashSet<&str> = spans.iter().map(|s| s.task_kind.as_str()).collect();
        let root = spans.iter().find(|s| s.is_root()).map(|s| s.id.clone());

        let mut covered = 0usize;
        for kind in expected {
            if seen.contains(kind.as_str()) {
                covered += 1;
            } else {
                issues.push(HealthIssue {
                    span_id: root.clone(),
                    dimension: Dimension::Coverage,
                    reason: format!("expected task kind '{}' produced no span", kind),
                });
            }
        }
        ratio(covered, expected.len())
    }

    /// Fraction of measured spans that finished within their kind's threshold.
    fn performance(&self, spans: &[&Span], issues: &mut Vec<HealthIssue>) -> f64 {
        let thresholds = &self.rules.duration_thresholds_ms;
        let mut measured = 0usize;
        let mut within = 0usize;

        for span in spans {
            let Some(limit) = thresholds.get(&span.task_kind) else {
                continue;
            };
            measured += 1;
            let took = span.duration_ms();
            if took <= *limit {
                within += 1;
            } else {
                issues.push(HealthIssue {
                    span_id: Some(span.id.clone()),
                    dimension: Dimension::Performance,
                    reason: format!("took {}ms, threshold {}ms", took, limit),
                });
            }
        }
        if measured == 0 {
            return 1.0;
        }
        ratio(within, measured)
    }

    /// Fraction of spans with a declared schema whose attributes satisfy it.
    fn semantic(&self, spans: &[&Span], issues: &mut Vec<HealthIssue>) -> f64 {
        let schemas = &self.rules.required_attributes;
        let mut checked = 0usize;
        let mut compliant = 0usize;

        for span in spans {
            let Some(required) = schemas.get(&span.task_kind) else {
                continue;
            };
            checked += 1;
            let missing: Vec<&str> = required
                .iter()
                .filter(|key| !span.attributes.contains_key(*key))
                .map(|key| key.as_str())
                .collect();
            if missing.is_empty() {
                compliant += 1;
            } else {
                issues.push(HealthIssue {
                    span_id: Some(span.id.clone()),
                    dimension: Dimension::Semantic,
                    reason: format!("missing attributes: {}", missing.join(", ")),
                });
            }
        }
        if checked == 0 {
            return 1.0;
        }
        ratio(compliant, checked)
    }
}

fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 {
        1.0
    } else {
        n as f64 / d as f64
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, Utc};
    use procflow_core::config::StatusThresholds;
    use procflow_core::SpanStatus;

    use super::*;

    fn span(seq: u64, id: &str, parent: Option<&str>, kind: &str, ms: i64) -> Span {
        let start = Utc::now();
        Span {
            id: SpanId::from_string(id),
            seq,
            parent_id: parent.map(SpanId::from_string),
            node_id: format!("node-{id}"),
            task_kind: kind.to_string(),
            attempt: 1,
            started_at: start,
            ended_at: start + Duration::milliseconds(ms),
            status: SpanStatus::Ok,
            attributes: BTreeMap::new(),
        }
    }

    fn trace() -> Vec<Span> {
        vec![
            span(0, "a", Some("root"), "charge", 40),
            span(1, "b", Some("root"), "ship", 900),
            span(2, "root", None, "run", 1000),
        ]
    }

    #[test]
    fn test_default_rules_score_clean_trace_fully() {
        let scorer = HealthScorer::new(ScoringRules::default()).unwrap();
        let report = scorer.score(&trace());
        assert_eq!(report.overall, 1.0);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut rules = ScoringRules::default();
        rules.weights.semantic = 0.3;
        assert!(matches!(
            HealthScorer::new(rules),
            Err(ProcflowError::Config(_))
        ));

        let mut rules = ScoringRules::default();
        rules.weights = DimensionWeights {
            structural: 1.5,
            coverage: -0.5,
            performance: 0.0,
            semantic: 0.0,
        };
        assert!(HealthScorer::new(rules).is_err());
    }

    #[test]
    fn test_thresholds_validated() {
        let rules = ScoringRules {
            thresholds: StatusThresholds {
                healthy: 0.4,
                degraded: 0.6,
            },
            ..ScoringRules::default()
        };
        assert!(HealthScorer::new(rules).is_err());
    }

    #[test]
    fn test_structural_flags_orphans_and_extra_roots() {
        let mut spans = trace();
        spans.push(span(3, "orphan", Some("ghost"), "charge", 1));
        spans.push(span(4, "root2", None, "run", 1));

        let scorer = HealthScorer::new(ScoringRules::default()).unwrap();
        let report = scorer.score(&spans);
        assert_eq!(report.dimensions.structural, 3.0 / 5.0);
        let reasons: Vec<&str> = report.issues.iter().map(|i| i.reason.as_str()).collect();
        assert!(reasons.contains(&"parent 'ghost' does not exist"));
        assert!(reasons.contains(&"second root span"));
    }

    #[test]
    fn test_coverage_performance_semantic() {
        let mut rules = ScoringRules::default();
        rules.expected_task_kinds = vec!["charge".into(), "refund".into()];
        rules.duration_thresholds_ms.insert("ship".into(), 500);
        rules.duration_thresholds_ms.insert("charge".into(), 500);
        rules
            .required_attributes
            .insert("charge".into(), vec!["amount".into()]);

        let report = HealthScorer::new(rules).unwrap().score(&trace());
        assert_eq!(report.dimensions.coverage, 0.5);
        assert_eq!(report.dimensions.performance, 0.5);
        assert_eq!(report.dimensions.semantic, 0.0);
        assert_eq!(report.dimensions.structural, 1.0);
        assert!((report.overall - 0.5).abs() < 1e-12);
        assert_eq!(report.status, HealthStatus::Degraded);

        let coverage_issue = report
            .issues
            .iter()
            .find(|i| i.dimension == Dimension::Coverage)
            .unwrap();
        assert_eq!(coverage_issue.span_id, Some(SpanId::from_string("root")));
        assert!(coverage_issue.reason.contains("refund"));
    }

    #[test]
    fn test_scoring_is_idempotent_and_order_independent() {
        let mut rules = ScoringRules::default();
        rules.duration_thresholds_ms.insert("ship".into(), 500);
        let scorer = HealthScorer::new(rules).unwrap();

        let spans = trace();
        let mut shuffled = spans.clone();
        shuffled.reverse();

        let first = scorer.score(&spans);
        assert_eq!(first, scorer.score(&spans));
        assert_eq!(first, scorer.score(&shuffled));
    }

    #[test]
    fn test_empty_collection_is_unhealthy_structurally() {
        let report = HealthScorer::new(ScoringRules::default())
            .unwrap()
            .score(&[]);
        assert_eq!(report.dimensions.structural, 0.0);
        assert_eq!(report.overall, 0.75);
        assert_eq!(report.status, HealthStatus::Degraded);
    }
}
