//! Execution Engine: runs one macro at a time on a dedicated worker thread.
//!
//! ```text
//! Idle --start--> Running --> Completed | Aborted | Failed --> Idle
//! ```
//!
//! Progress is published as [`RunEvent`]s; the final [`RunReport`] comes back
//! through the [`RunHandle`].

mod cancellation;
mod events;
mod interpreter;
mod trace;

pub use cancellation::RunContext;
pub use events::{event_stream, RunEvent};
pub use trace::{Branch, RunOutcome, RunReport, RunTrace, StepOutcome, TraceEntry};

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, instrument};

use crate::config::EngineConfig;
use crate::document::Macro;
use crate::driver::ActionDriver;
use crate::errors::EngineError;
use crate::matching::MatchingService;
use crate::variables::Bindings;
use interpreter::Interpreter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl From<&RunOutcome> for EngineState {
    fn from(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed => EngineState::Completed,
            RunOutcome::Aborted { .. } => EngineState::Aborted,
            RunOutcome::Failed { .. } => EngineState::Failed,
        }
    }
}

/// Per-run inputs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Values that override the macro's declared variable defaults.
    pub variables: BTreeMap<String, String>,
    pub run_id: Option<String>,
}

impl RunOptions {
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

pub struct Engine {
    matcher: Arc<dyn MatchingService>,
    driver: Arc<dyn ActionDriver>,
    config: EngineConfig,
    state: Arc<Mutex<EngineState>>,
    events: broadcast::Sender<RunEvent>,
}

impl Engine {
    pub fn new(
        matcher: Arc<dyn MatchingService>,
        driver: Arc<dyn ActionDriver>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            matcher,
            driver,
            config,
            state: Arc::new(Mutex::new(EngineState::Idle)),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state.lock().map(|s| *s).unwrap_or(EngineState::Idle)
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> impl Stream<Item = RunEvent> {
        event_stream(self.events.subscribe())
    }

    /// Validates `document` and starts running it on a new worker thread.
    #[instrument(skip(self, document, options), fields(macro_name = %document.name))]
    pub fn start(
        &self,
        document: Arc<Macro>,
        options: RunOptions,
    ) -> Result<RunHandle, EngineError> {
        document.validate()?;

        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| EngineError::Runtime("engine state lock poisoned".to_string()))?;
            if *state == EngineState::Running {
                return Err(EngineError::AlreadyRunning);
            }
            *state = EngineState::Running;
        }
        let guard = StateGuard {
            state: self.state.clone(),
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::Runtime(e.to_string()))?;

        let run_id = options.run_id.clone().unwrap_or_else(crate::step::new_step_id);
        let context = RunContext::new(run_id.clone(), self.config.run_timeout());
        let bindings = Bindings::seeded(&document.variables, &options.variables);
        let interpreter = Interpreter::new(
            self.matcher.clone(),
            self.driver.clone(),
            self.config.clone(),
            context.clone(),
            self.events.clone(),
            bindings,
        );
        let events = self.events.clone();
        let (tx, rx) = oneshot::channel();

        let _ = events.send(RunEvent::StateChanged {
            run_id: run_id.clone(),
            state: EngineState::Running,
        });

        let worker_run_id = run_id.clone();
        let thread = std::thread::Builder::new()
            .name(format!("macroflow-run-{}", short(&run_id)))
            .spawn(move || {
                let guard = guard;
                let report = runtime.block_on(interpreter.run(&document));
                let _ = events.send(RunEvent::StateChanged {
                    run_id: worker_run_id.clone(),
                    state: EngineState::from(&report.outcome),
                });
                drop(guard);
                let _ = events.send(RunEvent::StateChanged {
                    run_id: worker_run_id,
                    state: EngineState::Idle,
                });
                let _ = tx.send(report);
            })
            .map_err(|e| EngineError::Runtime(e.to_string()))?;

        info!("Started run {}", run_id);
        Ok(RunHandle {
            run_id,
            context,
            result: rx,
            thread: Some(thread),
        })
    }

    /// Starts a run and waits for its report.
    pub async fn run(
        &self,
        document: Arc<Macro>,
        options: RunOptions,
    ) -> Result<RunReport, EngineError> {
        self.start(document, options)?.wait().await
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Puts the engine back to `Idle` when the worker finishes, including by panic.
struct StateGuard {
    state: Arc<Mutex<EngineState>>,
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        match self.state.lock() {
            Ok(mut state) => *state = EngineState::Idle,
            Err(poisoned) => *poisoned.into_inner() = EngineState::Idle,
        }
    }
}

/// Control over one in-flight run.
pub struct RunHandle {
    run_id: String,
    context: RunContext,
    result: oneshot::Receiver<RunReport>,
    thread: Option<JoinHandle<()>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Requests cooperative cancellation. The run ends `Aborted` at its next checkpoint.
    pub fn cancel(&self) {
        info!("Cancelling run {}", self.run_id);
        self.context.cancel();
    }

    /// A clonable token-holder for cancelling from elsewhere (e.g. a signal handler).
    pub fn context(&self) -> RunContext {
        self.context.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    pub async fn wait(self) -> Result<RunReport, EngineError> {
        let RunHandle {
            run_id,
            result,
            thread,
            ..
        } = self;
        let report = result.await;
        join_worker(&run_id, thread);
        report.map_err(|_| EngineError::WorkerPanicked)
    }

    /// Blocking variant of [`RunHandle::wait`]; must not be called from async code.
    pub fn wait_blocking(self) -> Result<RunReport, EngineError> {
        let RunHandle {
            run_id,
            result,
            thread,
            ..
        } = self;
        let report = result.blocking_recv();
        join_worker(&run_id, thread);
        report.map_err(|_| EngineError::WorkerPanicked)
    }
}

fn join_worker(run_id: &str, thread: Option<JoinHandle<()>>) {
    if let Some(thread) = thread {
        if thread.join().is_err() {
            error!("Run {} worker panicked", run_id);
        }
    }
}
