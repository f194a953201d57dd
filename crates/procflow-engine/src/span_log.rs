use std::collections::HashSet;
use std::path::{Path, PathBuf};

use procflow_core::{ProcflowError, Result, Span, SpanId, SpanStatus};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// JSONL span logger.
///
/// Writes one serialized [`Span`] per line as spans close. The format is
/// append-only: if the process dies mid-run, every line already written is
/// intact and can be re-scored later.
#[derive(Debug, Clone)]
pub struct SpanLogger {
    log_dir: PathBuf,
    level: u8,
}

impl SpanLogger {
    /// `level` controls verbosity: 1 = run root and failures, 2 = + task
    /// attempts and compensations, 3 = every span.
    ///
    /// Below level 3 the ancestors of every logged span are kept as well,
    /// so a log always reads back as a well-formed trace.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Path of the log file for one run.
    pub fn path_for(&self, definition_id: &str, run_id: &str) -> PathBuf {
        self.log_dir
            .join(definition_id)
            .join(format!("{}.jsonl", run_id))
    }

    /// Consume spans until the run root closes or the channel closes.
    ///
    /// Returns the file written, if it could be opened.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<Span>,
        definition_id: String,
        run_id: String,
    ) -> Option<PathBuf> {
        let log_path = self.path_for(&definition_id, &run_id);
        if let Some(parent) = log_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(error = %e, "Failed to create span log directory");
                return None;
            }
        }

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open span log");
                return None;
            }
        };

        info!(path = %log_path.display(), "SpanLogger started");
        let mut writer = tokio::io::BufWriter::new(file);
        // Parents of logged spans. Children always close before their parent.
        let mut ancestors: HashSet<SpanId> = HashSet::new();

        loop {
            match rx.recv().await {
                Ok(span) => {
                    let is_root = span.is_root();
                    let keep = ancestors.remove(&span.id) || self.should_log(&span);
                    if keep {
                        if let Some(parent) = &span.parent_id {
                            ancestors.insert(parent.clone());
                        }
                        if let Ok(json) = serde_json::to_string(&span) {
                            let line = format!("{}\n", json);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write span");
                                break;
                            }
                            // Flush after each span for crash resilience
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush span log");
                            }
                        }
                    }
                    // The root closes last.
                    if is_root {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, path = %log_path.display(), "SpanLogger lagged, span log is incomplete");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Span channel closed, SpanLogger stopping");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "SpanLogger finished");
        Some(log_path)
    }

    fn should_log(&self, span: &Span) -> bool {
        match self.level {
            0 | 1 => span.is_root() || span.status == SpanStatus::Error,
            2 => {
                span.is_root()
                    || span.status != SpanStatus::Ok
                    || span.attempt > 0
                    || span.attr("compensation").is_some()
            }
            _ => true,
        }
    }
}

/// Read a span log back, skipping blank lines.
pub fn read_spans(path: &Path) -> Result<Vec<Span>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                ProcflowError::Config(format!("{}:{}: {}", path.display(), i + 1, e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthScorer;
    use crate::telemetry::{OpenSpan, TelemetryCollector};
    use procflow_core::ScoringRules;

    #[tokio::test]
    async fn test_writes_and_reads_back_spans() {
        let dir = tempfile::tempdir().unwrap();
        let collector = TelemetryCollector::new(16);
        let logger = SpanLogger::new(dir.path().to_path_buf(), 3);
        let handle = tokio::spawn(logger.run(collector.subscribe(), "def".into(), "run-1".into()));

        let root = OpenSpan::start("def", "run", None);
        let child = OpenSpan::start("a", "noop", Some(root.id())).with_attempt(1);
        collector.close(child, SpanStatus::Ok);
        collector.close(root, SpanStatus::Ok);

        let path = handle.await.unwrap().unwrap();
        assert_eq!(path, dir.path().join("def").join("run-1.jsonl"));

        let spans = read_spans(&path).unwrap();
        assert_eq!(spans, collector.spans());
    }

    #[tokio::test]
    async fn test_level_one_keeps_root_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let collector = TelemetryCollector::new(16);
        let logger = SpanLogger::new(dir.path().to_path_buf(), 1);
        let handle = tokio::spawn(logger.run(collector.subscribe(), "def".into(), "run-2".into()));

        let root = OpenSpan::start("def", "run", None);
        collector.close(
            OpenSpan::start("ok", "noop", Some(root.id())).with_attempt(1),
            SpanStatus::Ok,
        );
        collector.close(
            OpenSpan::start("bad", "noop", Some(root.id())).with_attempt(1),
            SpanStatus::Error,
        );
        collector.close(root, SpanStatus::Error);

        let path = handle.await.unwrap().unwrap();
        let nodes: Vec<String> = read_spans(&path)
            .unwrap()
            .into_iter()
            .map(|s| s.node_id)
            .collect();
        assert_eq!(nodes, vec!["bad", "def"]);
    }

    #[tokio::test]
    async fn test_keeps_ancestors_of_logged_spans() {
        let dir = tempfile::tempdir().unwrap();
        let collector = TelemetryCollector::new(16);
        let logger = SpanLogger::new(dir.path().to_path_buf(), 2);
        let handle = tokio::spawn(logger.run(collector.subscribe(), "def".into(), "run-3".into()));

        let root = OpenSpan::start("def", "run", None);
        let split = OpenSpan::start("split", "parallel_split", Some(root.id()));
        for branch in ["a", "b"] {
            collector.close(
                OpenSpan::start(branch, "noop", Some(split.id())).with_attempt(1),
                SpanStatus::Ok,
            );
        }
        collector.close(split, SpanStatus::Ok);
        collector.close(
            OpenSpan::start("join", "parallel_join", Some(root.id())),
            SpanStatus::Ok,
        );
        collector.close(root, SpanStatus::Ok);

        let path = handle.await.unwrap().unwrap();
        let logged = read_spans(&path).unwrap();
        let nodes: Vec<&str> = logged.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(nodes, vec!["a", "b", "split", "def"]);

        let scorer = HealthScorer::new(ScoringRules::default()).unwrap();
        assert_eq!(scorer.score(&logged).dimensions.structural, 1.0);
    }

    #[test]
    fn test_read_spans_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "\nnot json\n").unwrap();
        let err = read_spans(&path).unwrap_err();
        assert!(err.to_string().contains(":2:"));
    }
}
