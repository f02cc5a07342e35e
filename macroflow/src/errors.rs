use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A step failed validation. Raised by the step factory and by `Macro::validate`,
/// always before a run starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidStepError {
    #[error("Unknown step type: {0}")]
    UnknownType(String),

    #[error("Malformed {step_type} step: {reason}")]
    Malformed { step_type: String, reason: String },

    #[error("Step {step_id} field `{field}` is invalid: {reason}")]
    InvalidField {
        step_id: String,
        field: &'static str,
        reason: String,
    },

    #[error("Duplicate step id: {0}")]
    DuplicateId(String),

    #[error("Invalid macro: {0}")]
    InvalidMacro(String),
}

/// Loading a persisted macro failed. Storage never hands out a partial macro.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Corrupt macro document: {0}")]
    Corrupt(String),

    #[error("Missing schema version")]
    MissingVersion,

    #[error("Unsupported schema version {found} (newest supported is {supported})")]
    UnsupportedVersion { found: String, supported: u32 },

    #[error("Cannot upgrade schema version {from}: {reason}")]
    Migration { from: u32, reason: String },

    #[error("Macro content is invalid: {0}")]
    Invalid(#[from] InvalidStepError),

    #[error("Failed to encode macro: {0}")]
    Encode(String),
}

/// A sensing step did not see its target before its timeout elapsed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Step {step_id} found no match for `{target}` within {timeout:?} ({attempts} attempts)")]
pub struct MatchTimeoutError {
    pub step_id: String,
    pub target: String,
    pub timeout: Duration,
    pub attempts: u32,
}

/// The matching backend (screen capture or OCR) cannot serve requests.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Matching backend unavailable: {0}")]
pub struct BackendUnavailableError(pub String);

/// The Action Driver rejected or failed to perform an input action.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionDriverError {
    #[error("Input synthesis failed: {0}")]
    Synthesis(String),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Clipboard error: {0}")]
    Clipboard(String),

    #[error("Unsupported action: {0}")]
    Unsupported(String),
}

/// A condition-driven loop hit its `max_iterations` cap. The loop stops and the run continues.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Loop {step_id} stopped at its limit of {max_iterations} iterations")]
pub struct LoopLimitExceeded {
    pub step_id: String,
    pub max_iterations: u32,
}

/// Why a run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    RunTimeout,
}

/// A run ended through cancellation or its global timeout. This is the `Aborted`
/// terminal outcome, not a failure.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Run {run_id} aborted ({reason:?})")]
pub struct EngineAbortError {
    pub run_id: String,
    pub reason: AbortReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Why a single step did not succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error(transparent)]
    MatchTimeout(#[from] MatchTimeoutError),

    #[error(transparent)]
    ActionDriver(#[from] ActionDriverError),

    #[error("Field `{field}` resolved to invalid value `{value}`: {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    BackendUnavailable(#[from] BackendUnavailableError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Aborted(#[from] EngineAbortError),
}

impl StepError {
    /// Recoverable failures are subject to retries and the failure policy.
    /// Everything else ends the run regardless of policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StepError::MatchTimeout(_) | StepError::ActionDriver(_) | StepError::InvalidValue { .. }
        )
    }
}

/// Misuse of the engine itself.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("A run is already active on this engine")]
    AlreadyRunning,

    #[error(transparent)]
    InvalidMacro(#[from] InvalidStepError),

    #[error("Failed to start run worker: {0}")]
    Runtime(String),

    #[error("Run worker panicked")]
    WorkerPanicked,
}

/// Filesystem-backed macro library failures.
#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Macro file not found: {0}")]
    NotFound(PathBuf),

    #[error("{path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: FormatError,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed settings {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Failed to write settings {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Umbrella error for callers that do not care which layer failed.
#[derive(Error, Debug)]
pub enum MacroflowError {
    #[error(transparent)]
    InvalidStep(#[from] InvalidStepError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendUnavailableError),
}
