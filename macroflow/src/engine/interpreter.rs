//! Depth-first interpretation of a macro's step tree.

use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::cancellation::RunContext;
use super::events::RunEvent;
use super::trace::{Branch, RunOutcome, RunReport, RunTrace, StepOutcome, TraceEntry};
use crate::config::{EngineConfig, FailurePolicy};
use crate::document::Macro;
use crate::driver::ActionDriver;
use crate::errors::{
    AbortReason, BackendUnavailableError, EngineAbortError, LoopLimitExceeded, MatchTimeoutError,
    StepError,
};
use crate::geometry::Rect;
use crate::matching::{MatchResult, MatchingService};
use crate::step::{
    Coordinate, ErrorHandling, IfCondition, Loop, LoopMode, MacroStep, MatchClick, StepKind,
};
use crate::variables::{self, Bindings};

/// Why a sequence stopped early.
#[derive(Debug)]
pub(crate) enum Halt {
    Abort(EngineAbortError),
    Fail { error: String, step_id: Option<String> },
}

impl From<EngineAbortError> for Halt {
    fn from(e: EngineAbortError) -> Self {
        Halt::Abort(e)
    }
}

/// Per-step notes gathered while a leaf executes.
#[derive(Debug, Default)]
struct StepNotes {
    unresolved: Vec<String>,
    matched_text: Option<String>,
}

impl StepNotes {
    fn resolve(&mut self, template: &str, bindings: &Bindings) -> String {
        let resolved = variables::resolve(template, bindings);
        for name in resolved.unresolved {
            if !self.unresolved.contains(&name) {
                self.unresolved.push(name);
            }
        }
        resolved.value
    }
}

enum Probe<'a> {
    Image {
        template: &'a str,
        region: Option<Rect>,
        threshold: f64,
    },
    Text {
        query: &'a str,
        region: Option<Rect>,
        threshold: f64,
        exact: bool,
    },
}

pub(crate) struct Interpreter {
    matcher: Arc<dyn MatchingService>,
    driver: Arc<dyn ActionDriver>,
    config: EngineConfig,
    ctx: RunContext,
    events: broadcast::Sender<RunEvent>,
    bindings: Bindings,
    trace: RunTrace,
    warnings: Vec<LoopLimitExceeded>,
}

impl Interpreter {
    pub(crate) fn new(
        matcher: Arc<dyn MatchingService>,
        driver: Arc<dyn ActionDriver>,
        config: EngineConfig,
        ctx: RunContext,
        events: broadcast::Sender<RunEvent>,
        bindings: Bindings,
    ) -> Self {
        Self {
            matcher,
            driver,
            config,
            ctx,
            events,
            bindings,
            trace: RunTrace::default(),
            warnings: Vec::new(),
        }
    }

    fn emit(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) async fn run(mut self, document: &Macro) -> RunReport {
        let started_at = Utc::now();
        info!(
            "Run {} started: '{}' ({} steps, matcher={}, driver={})",
            self.ctx.run_id,
            document.name,
            document.step_count(),
            self.matcher.name(),
            self.driver.name()
        );
        self.ctx.arm_timeout();

        let outcome = match self.run_sequence(&document.steps, 0).await {
            Ok(()) => RunOutcome::Completed,
            Err(Halt::Abort(e)) => RunOutcome::Aborted {
                reason: e.reason,
                step_id: e.step_id,
            },
            Err(Halt::Fail { error, step_id }) => RunOutcome::Failed { error, step_id },
        };
        // Stops the deadline timer.
        self.ctx.cancel();

        info!("Run {} finished: {}", self.ctx.run_id, outcome);
        self.emit(RunEvent::RunFinished {
            run_id: self.ctx.run_id.clone(),
            outcome: outcome.clone(),
        });

        RunReport {
            run_id: self.ctx.run_id.clone(),
            macro_id: document.id.clone(),
            macro_name: document.name.clone(),
            outcome,
            trace: self.trace,
            warnings: self.warnings,
            variables: self.bindings.snapshot(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn run_sequence<'a>(
        &'a mut self,
        steps: &'a [MacroStep],
        depth: usize,
    ) -> BoxFuture<'a, Result<(), Halt>> {
        Box::pin(async move {
            for step in steps {
                self.ctx.checkpoint(Some(&step.id))?;
                self.run_step(step, depth).await?;
                self.ctx.checkpoint(Some(&step.id))?;
            }
            Ok(())
        })
    }

    async fn run_step(&mut self, step: &MacroStep, depth: usize) -> Result<(), Halt> {
        if depth >= self.config.max_depth {
            return Err(Halt::Fail {
                error: format!("maximum nesting depth {} exceeded", self.config.max_depth),
                step_id: Some(step.id.clone()),
            });
        }

        let started_at = Utc::now();
        if !step.enabled {
            debug!("Step {} disabled, skipping", step.id);
            self.record(step, depth, StepOutcome::Skip, StepNotes::default(), None, 0, started_at);
            return Ok(());
        }

        self.emit(RunEvent::StepStarted {
            run_id: self.ctx.run_id.clone(),
            step_id: step.id.clone(),
            step_type: step.step_type(),
            depth,
        });

        match &step.kind {
            StepKind::IfCondition(branch) => self.run_if(step, branch, depth, started_at).await,
            StepKind::Loop(repeat) => self.run_loop(step, repeat, depth, started_at).await,
            _ => self.run_leaf(step, depth, started_at).await,
        }
    }

    async fn run_if(
        &mut self,
        step: &MacroStep,
        branch: &IfCondition,
        depth: usize,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<(), Halt> {
        let evaluation = branch.condition.evaluate(&self.bindings);
        debug!(
            "Condition {} -> {} (left={:?}, right={:?})",
            branch.condition, evaluation.result, evaluation.left, evaluation.right
        );
        let (taken, steps) = if evaluation.result {
            (Branch::TrueBranch, &branch.true_branch)
        } else {
            (Branch::FalseBranch, &branch.false_branch)
        };
        let notes = StepNotes {
            unresolved: evaluation.unresolved,
            matched_text: None,
        };
        self.record(step, depth, StepOutcome::Branch { taken }, notes, None, 1, started_at);
        self.run_sequence(steps, depth + 1).await
    }

    async fn run_loop(
        &mut self,
        step: &MacroStep,
        repeat: &Loop,
        depth: usize,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<(), Halt> {
        let mut iterations = 0u32;
        let mut limited = false;
        let mut notes = StepNotes::default();

        let result = match &repeat.mode {
            LoopMode::Count(count) => {
                let mut result = Ok(());
                while iterations < *count {
                    iterations += 1;
                    if let Err(halt) = self.loop_iteration(step, repeat, iterations, depth).await {
                        result = Err(halt);
                        break;
                    }
                }
                result
            }
            LoopMode::While(condition) => loop {
                if let Err(e) = self.ctx.checkpoint(Some(&step.id)) {
                    break Err(Halt::Abort(e));
                }
                let evaluation = condition.evaluate(&self.bindings);
                for name in evaluation.unresolved {
                    if !notes.unresolved.contains(&name) {
                        notes.unresolved.push(name);
                    }
                }
                if !evaluation.result {
                    break Ok(());
                }
                if iterations >= repeat.max_iterations {
                    let warning = LoopLimitExceeded {
                        step_id: step.id.clone(),
                        max_iterations: repeat.max_iterations,
                    };
                    warn!("{}", warning);
                    self.emit(RunEvent::Warning {
                        run_id: self.ctx.run_id.clone(),
                        warning: warning.clone(),
                    });
                    self.warnings.push(warning);
                    limited = true;
                    break Ok(());
                }
                iterations += 1;
                if let Err(halt) = self.loop_iteration(step, repeat, iterations, depth).await {
                    break Err(halt);
                }
            },
        };

        let (outcome, error) = match &result {
            Ok(()) => (StepOutcome::Loop { iterations, limited }, None),
            Err(Halt::Abort(_)) => (StepOutcome::Aborted, None),
            Err(Halt::Fail { error, .. }) => (StepOutcome::Error, Some(error.clone())),
        };
        self.record(step, depth, outcome, notes, error, iterations, started_at);
        result
    }

    async fn loop_iteration(
        &mut self,
        step: &MacroStep,
        repeat: &Loop,
        iteration: u32,
        depth: usize,
    ) -> Result<(), Halt> {
        self.ctx.checkpoint(Some(&step.id))?;
        if let Some(index) = &repeat.index_variable {
            self.bindings.set(index.clone(), iteration.to_string());
        }
        self.run_sequence(&repeat.body, depth + 1).await
    }

    async fn run_leaf(
        &mut self,
        step: &MacroStep,
        depth: usize,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<(), Halt> {
        let attempts_allowed = step.retry_count.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut notes = StepNotes::default();
            let result = self.execute_leaf(step, &mut notes).await;

            let error = match result {
                Ok(()) => {
                    self.record(
                        step,
                        depth,
                        StepOutcome::Success,
                        notes,
                        None,
                        attempt,
                        started_at,
                    );
                    if let Err(reason) = self.ctx.sleep(self.config.step_delay()).await {
                        return Err(Halt::Abort(self.ctx.abort_error(reason, Some(&step.id))));
                    }
                    return Ok(());
                }
                Err(error) => error,
            };

            let error = match error {
                StepError::Aborted(abort) => {
                    self.record(
                        step,
                        depth,
                        StepOutcome::Aborted,
                        notes,
                        None,
                        attempt,
                        started_at,
                    );
                    return Err(Halt::Abort(abort));
                }
                other => other,
            };

            if error.is_recoverable() && attempt < attempts_allowed {
                warn!(
                    "Step {} attempt {}/{} failed: {}",
                    step.id, attempt, attempts_allowed, error
                );
                continue;
            }

            let outcome = match error {
                StepError::MatchTimeout(_) => StepOutcome::Timeout,
                _ => StepOutcome::Error,
            };
            let message = error.to_string();
            self.record(step, depth, outcome, notes, Some(message.clone()), attempt, started_at);

            let stop = !error.is_recoverable()
                || match step.on_error {
                    Some(ErrorHandling::Stop) => true,
                    Some(ErrorHandling::Continue) => false,
                    None => self.config.failure_policy == FailurePolicy::AbortOnFailure,
                };
            if stop {
                warn!("Step {} failed, ending run: {}", step.id, message);
                return Err(Halt::Fail {
                    error: message,
                    step_id: Some(step.id.clone()),
                });
            }
            warn!("Step {} failed, continuing: {}", step.id, message);
            return Ok(());
        }
    }

    fn aborted(&self, reason: AbortReason, step: &MacroStep) -> StepError {
        StepError::Aborted(self.ctx.abort_error(reason, Some(&step.id)))
    }

    async fn execute_leaf(
        &mut self,
        step: &MacroStep,
        notes: &mut StepNotes,
    ) -> Result<(), StepError> {
        match &step.kind {
            StepKind::MouseClick(click) => {
                let x = self.coordinate(&click.x, "x", notes)?;
                let y = self.coordinate(&click.y, "y", notes)?;
                self.driver.click(x, y, click.button, click.click_count).await?;
            }
            StepKind::MouseMove(movement) => {
                let x = self.coordinate(&movement.x, "x", notes)?;
                let y = self.coordinate(&movement.y, "y", notes)?;
                self.driver
                    .move_to(x, y, Duration::from_millis(movement.duration_ms))
                    .await?;
            }
            StepKind::KeyboardType(typing) => {
                let text = notes.resolve(&typing.text, &self.bindings);
                self.driver
                    .type_text(&text, Duration::from_millis(typing.interval_ms))
                    .await?;
            }
            StepKind::KeyboardHotkey(hotkey) => {
                let keys: Vec<String> = hotkey
                    .keys
                    .iter()
                    .map(|k| notes.resolve(k, &self.bindings))
                    .filter(|k| !k.trim().is_empty())
                    .collect();
                if keys.is_empty() {
                    return Err(StepError::InvalidValue {
                        field: "keys",
                        value: hotkey.keys.join("+"),
                        reason: "no keys left after substitution".to_string(),
                    });
                }
                self.driver.hotkey(&keys).await?;
            }
            StepKind::WaitTime(wait) => {
                self.ctx
                    .sleep(Duration::from_millis(wait.duration_ms))
                    .await
                    .map_err(|reason| self.aborted(reason, step))?;
            }
            StepKind::WaitImage(wait) => {
                let template = notes.resolve(&wait.template_ref, &self.bindings);
                self.clear_outputs(wait.output_variable.as_deref());
                let probe = Probe::Image {
                    template: &template,
                    region: wait.region,
                    threshold: wait.confidence_threshold,
                };
                let found = self.poll(step, &template, &probe, wait.timeout_ms).await?;
                self.on_match(
                    found,
                    wait.output_variable.as_deref(),
                    wait.click_on_match.as_ref(),
                    notes,
                )
                .await?;
            }
            StepKind::TextSearch(search) => {
                let query = notes.resolve(&search.query_text, &self.bindings);
                self.clear_outputs(search.output_variable.as_deref());
                let probe = Probe::Text {
                    query: &query,
                    region: search.region,
                    threshold: search.confidence_threshold,
                    exact: search.exact_match,
                };
                let found = self.poll(step, &query, &probe, search.timeout_ms).await?;
                self.on_match(
                    found,
                    search.output_variable.as_deref(),
                    search.click_on_match.as_ref(),
                    notes,
                )
                .await?;
            }
            StepKind::IfCondition(_) | StepKind::Loop(_) => {
                return Err(StepError::Internal(format!(
                    "{} is not a leaf step",
                    step.step_type()
                )))
            }
        }
        Ok(())
    }

    /// Resolves a coordinate to an integer, rounding numeric text.
    fn coordinate(
        &self,
        value: &Coordinate,
        field: &'static str,
        notes: &mut StepNotes,
    ) -> Result<i32, StepError> {
        let template = match value {
            Coordinate::Fixed(v) => return Ok(*v),
            Coordinate::Template(t) => t,
        };
        let resolved = notes.resolve(template, &self.bindings);
        let text = resolved.trim();
        if let Ok(v) = text.parse::<i32>() {
            return Ok(v);
        }
        match text.parse::<f64>() {
            Ok(v) if v.is_finite() && v.abs() <= f64::from(i32::MAX) => Ok(v.round() as i32),
            _ => Err(StepError::InvalidValue {
                field,
                value: resolved,
                reason: "not an integer coordinate".to_string(),
            }),
        }
    }

    async fn probe(
        &self,
        probe: &Probe<'_>,
    ) -> Result<Option<MatchResult>, BackendUnavailableError> {
        match probe {
            Probe::Image {
                template,
                region,
                threshold,
            } => self.matcher.find_image(template, *region, *threshold).await,
            Probe::Text {
                query,
                region,
                threshold,
                exact,
            } => self.matcher.find_text(query, *region, *threshold, *exact).await,
        }
    }

    /// Probes until a match, the step timeout, or cancellation. The timeout is
    /// measured from the first probe and never fires before it has elapsed.
    async fn poll(
        &self,
        step: &MacroStep,
        target: &str,
        probe: &Probe<'_>,
        timeout_ms: u64,
    ) -> Result<MatchResult, StepError> {
        let timeout = Duration::from_millis(timeout_ms);
        let poll_interval = self.config.poll_interval();
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            self.ctx
                .checkpoint(Some(&step.id))
                .map_err(StepError::Aborted)?;
            attempts += 1;
            let found = self
                .ctx
                .with_cancellation(self.probe(probe))
                .await
                .map_err(|reason| self.aborted(reason, step))??;
            if let Some(found) = found {
                debug!(
                    "Step {} matched {:?} ({:.3}) after {} attempt(s)",
                    step.id, found.label, found.confidence, attempts
                );
                return Ok(found);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(MatchTimeoutError {
                    step_id: step.id.clone(),
                    target: target.to_string(),
                    timeout,
                    attempts,
                }
                .into());
            }
            self.ctx
                .sleep(poll_interval.min(timeout - elapsed))
                .await
                .map_err(|reason| self.aborted(reason, step))?;
        }
    }

    fn clear_outputs(&mut self, output_variable: Option<&str>) {
        if let Some(out) = output_variable {
            self.bindings.remove(out);
            self.bindings.remove(&format!("{out}_x"));
            self.bindings.remove(&format!("{out}_y"));
        }
    }

    async fn on_match(
        &mut self,
        found: MatchResult,
        output_variable: Option<&str>,
        click: Option<&MatchClick>,
        notes: &mut StepNotes,
    ) -> Result<(), StepError> {
        let (x, y) = (found.center.x, found.center.y);
        self.bindings.set("matched_text", found.label.clone());
        self.bindings.set("matched_x", x.to_string());
        self.bindings.set("matched_y", y.to_string());
        self.bindings.set("matched_confidence", format!("{:.4}", found.confidence));
        if let Some(out) = output_variable {
            self.bindings.set(out, found.label.clone());
            self.bindings.set(format!("{out}_x"), x.to_string());
            self.bindings.set(format!("{out}_y"), y.to_string());
        }
        notes.matched_text = Some(found.label);

        if let Some(click) = click {
            let target = x
                .checked_add(click.offset.x)
                .zip(y.checked_add(click.offset.y))
                .ok_or_else(|| StepError::InvalidValue {
                    field: "click_on_match.offset",
                    value: format!("({}, {})", click.offset.x, click.offset.y),
                    reason: format!("moves the click off the coordinate range from ({x}, {y})"),
                })?;
            self.driver.click(target.0, target.1, click.button, click.click_count).await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        step: &MacroStep,
        depth: usize,
        outcome: StepOutcome,
        notes: StepNotes,
        error: Option<String>,
        attempts: u32,
        started_at: chrono::DateTime<Utc>,
    ) {
        if !notes.unresolved.is_empty() {
            warn!("Step {} referenced unbound variables: {:?}", step.id, notes.unresolved);
        }
        let entry = TraceEntry {
            step_id: step.id.clone(),
            step_type: step.step_type(),
            depth,
            outcome,
            matched_text: notes.matched_text,
            variables: self.bindings.snapshot(),
            unresolved: notes.unresolved,
            error,
            attempts,
            started_at,
            finished_at: Utc::now(),
        };
        debug!("{} [{}]", entry, step.id);
        self.emit(RunEvent::StepFinished {
            run_id: self.ctx.run_id.clone(),
            entry: entry.clone(),
        });
        self.trace.push(entry);
    }
}
