//! Desktop macro engine.
//!
//! A [`Macro`] is an ordered tree of typed steps (mouse, keyboard, waits, image
//! and text searches, conditionals, loops). The [`Engine`] walks that tree on a
//! worker thread, driving input through an [`ActionDriver`] and gating progress
//! on what a [`MatchingService`] sees on screen.

pub mod condition;
pub mod config;
pub mod document;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod geometry;
pub mod matching;
pub mod step;
pub mod storage;
#[cfg(test)]
mod tests;
pub mod variables;

pub use condition::{Condition, ConditionOperator};
pub use config::{EngineConfig, FailurePolicy, Settings};
pub use document::Macro;
pub use driver::{ActionDriver, DryRunDriver};
pub use engine::{
    Engine, EngineState, RunEvent, RunHandle, RunOptions, RunOutcome, RunReport, StepOutcome,
    TraceEntry,
};
pub use errors::{
    ActionDriverError, BackendUnavailableError, EngineError, FormatError, InvalidStepError,
    LibraryError, MacroflowError, MatchTimeoutError, StepError,
};
pub use geometry::{Point, Rect};
pub use matching::{MatchResult, MatchingService, ScreenMatcher, UnavailableMatcher};
pub use step::{MacroStep, StepKind, StepType};
pub use storage::{load, save, MacroFormat, MacroLibrary};
pub use variables::Bindings;

#[cfg(feature = "input")]
pub use driver::RdevDriver;
#[cfg(feature = "screen")]
pub use matching::{UniOcrRecognizer, XcapScreen};
