use std::sync::{Mutex, PoisonError};

use procflow_core::{ExecutionContext, Invocation};

/// A completed, compensable task execution.
#[derive(Debug, Clone)]
pub struct SagaEntry {
    /// Completion order within the run.
    pub seq: u64,
    pub node_id: String,
    /// Branch path the task ran in, e.g. `main/split#1`.
    pub branch: String,
    pub handler: String,
    pub invocation: Invocation,
    /// Context as it was right after the task succeeded.
    pub context: ExecutionContext,
    pub result: serde_json::Value,
}

impl SagaEntry {
    /// Whether this entry ran in `branch` or in a branch nested below it.
    fn belongs_to(&self, branch: &str) -> bool {
        self.branch == branch
            || self
                .branch
                .strip_prefix(branch)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Run-wide rollback stack.
///
/// Every compensable success is pushed in completion order. Compensation
/// pops entries in reverse completion order; a popped entry is never
/// compensated twice.
#[derive(Default)]
pub struct SagaStack {
    inner: Mutex<SagaInner>,
}

#[derive(Default)]
struct SagaInner {
    entries: Vec<SagaEntry>,
    next_seq: u64,
}

impl SagaStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &self,
        node_id: impl Into<String>,
        branch: impl Into<String>,
        handler: impl Into<String>,
        invocation: Invocation,
        context: ExecutionContext,
        result: serde_json::Value,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push(SagaEntry {
            seq,
            node_id: node_id.into(),
            branch: branch.into(),
            handler: handler.into(),
            invocation,
            context,
            result,
        });
    }

    /// Remove and return the entries of one branch (and its nested
    /// branches), most recent first.
    pub fn drain_branch(&self, branch: &str) -> Vec<SagaEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut taken, kept): (Vec<SagaEntry>, Vec<SagaEntry>) = inner
            .entries
            .drain(..)
            .partition(|e| e.belongs_to(branch));
        inner.entries = kept;
        taken.reverse();
        taken
    }

    /// Remove and return every entry, most recent first.
    pub fn drain_all(&self) -> Vec<SagaEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut taken: Vec<SagaEntry> = inner.entries.drain(..).collect();
        taken.reverse();
        taken
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
