use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use super::trace::{RunOutcome, TraceEntry};
use super::EngineState;
use crate::errors::LoopLimitExceeded;
use crate::step::StepType;

/// Progress notifications published while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    StateChanged {
        run_id: String,
        state: EngineState,
    },
    StepStarted {
        run_id: String,
        step_id: String,
        step_type: StepType,
        depth: usize,
    },
    StepFinished {
        run_id: String,
        entry: TraceEntry,
    },
    Warning {
        run_id: String,
        warning: LoopLimitExceeded,
    },
    RunFinished {
        run_id: String,
        outcome: RunOutcome,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::StateChanged { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepFinished { run_id, .. }
            | RunEvent::Warning { run_id, .. }
            | RunEvent::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Adapts a broadcast receiver into a stream. Lagging consumers skip events.
pub fn event_stream(mut rx: broadcast::Receiver<RunEvent>) -> impl Stream<Item = RunEvent> {
    Box::pin(async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => yield event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Run event stream lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
