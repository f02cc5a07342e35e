//! Run trace and report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{AbortReason, LoopLimitExceeded};
use crate::step::StepType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    TrueBranch,
    FalseBranch,
}

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Skip,
    Timeout,
    Error,
    Branch { taken: Branch },
    Loop { iterations: u32, limited: bool },
    Aborted,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Success => f.write_str("success"),
            StepOutcome::Skip => f.write_str("skip"),
            StepOutcome::Timeout => f.write_str("timeout"),
            StepOutcome::Error => f.write_str("error"),
            StepOutcome::Branch { taken: Branch::TrueBranch } => f.write_str("true_branch"),
            StepOutcome::Branch { taken: Branch::FalseBranch } => f.write_str("false_branch"),
            StepOutcome::Loop { iterations, limited: false } => write!(f, "loop({iterations})"),
            StepOutcome::Loop { iterations, limited: true } => {
                write!(f, "loop_limit({iterations})")
            }
            StepOutcome::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub step_id: String,
    pub step_type: StepType,
    pub depth: usize,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_text: Option<String>,
    /// Bindings as they stood when the step finished.
    pub variables: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub unresolved: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TraceEntry {
    /// Same entry with timestamps zeroed, for comparing runs.
    pub fn without_timestamps(&self) -> TraceEntry {
        TraceEntry {
            started_at: DateTime::<Utc>::UNIX_EPOCH,
            finished_at: DateTime::<Utc>::UNIX_EPOCH,
            ..self.clone()
        }
    }
}

/// `click:success`, `text_search:success(match="완료")`, `if:true_branch`
impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.step_type.trace_name(), self.outcome)?;
        if let (StepOutcome::Success, Some(text)) = (&self.outcome, &self.matched_text) {
            write!(f, "(match={text:?})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunTrace {
    entries: Vec<TraceEntry>,
}

impl RunTrace {
    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
    }

    /// One display line per entry, in execution order.
    pub fn summary(&self) -> Vec<String> {
        self.entries.iter().map(ToString::to_string).collect()
    }

    pub fn without_timestamps(&self) -> Vec<TraceEntry> {
        self.entries.iter().map(TraceEntry::without_timestamps).collect()
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted {
        reason: AbortReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
    },
    Failed {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::Aborted { reason: AbortReason::Cancelled, .. } => {
                f.write_str("aborted (cancelled)")
            }
            RunOutcome::Aborted { reason: AbortReason::RunTimeout, .. } => {
                f.write_str("aborted (run timeout)")
            }
            RunOutcome::Failed { error, .. } => write!(f, "failed: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub macro_id: String,
    pub macro_name: String,
    pub outcome: RunOutcome,
    pub trace: RunTrace,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<LoopLimitExceeded>,
    /// Bindings at the end of the run.
    pub variables: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Trace entries that did not succeed.
    pub fn problems(&self) -> impl Iterator<Item = &TraceEntry> {
        self.trace.iter().filter(|e| {
            matches!(
                e.outcome,
                StepOutcome::Timeout | StepOutcome::Error | StepOutcome::Aborted
            )
        })
    }
}
