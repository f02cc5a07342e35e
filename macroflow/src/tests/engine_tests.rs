use std::sync::Arc;

use super::init_tracing;
use crate::condition::{Condition, ConditionOperator};
use crate::config::EngineConfig;
use crate::document::Macro;
use crate::driver::DryRunDriver;
use crate::engine::{Engine, EngineState, RunEvent, RunOptions, RunOutcome, StepOutcome};
use crate::errors::{AbortReason, EngineError};
use crate::matching::UnavailableMatcher;
use crate::step::MacroStep;

fn engine(config: EngineConfig) -> (Engine, Arc<DryRunDriver>) {
    let driver = Arc::new(DryRunDriver::new());
    let engine = Engine::new(Arc::new(UnavailableMatcher::default()), driver.clone(), config);
    (engine, driver)
}

fn fast() -> EngineConfig {
    EngineConfig::default().with_step_delay_ms(0).with_poll_interval_ms(10)
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    init_tracing();
    let (engine, _) = engine(fast());
    let document = Arc::new(Macro::new("slow").with_steps(vec![MacroStep::wait(30_000)]));

    let mut events = engine.subscribe();
    let handle = engine.start(document.clone(), RunOptions::default()).unwrap();
    assert_eq!(engine.state(), EngineState::Running);
    while !matches!(events.recv().await.unwrap(), RunEvent::StepStarted { .. }) {}
    assert!(matches!(
        engine.start(document, RunOptions::default()),
        Err(EngineError::AlreadyRunning)
    ));

    handle.cancel();
    let report = handle.wait().await.unwrap();
    assert!(matches!(
        report.outcome,
        RunOutcome::Aborted {
            reason: AbortReason::Cancelled,
            ..
        }
    ));
    assert_eq!(report.trace.summary(), vec!["wait:aborted"]);
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn invalid_macro_never_starts() {
    let (engine, _) = engine(fast());
    let body = vec![MacroStep::repeat(0, vec![MacroStep::wait(1)])];
    let document = Arc::new(Macro::new("bad").with_steps(body));
    assert!(matches!(
        engine.start(document, RunOptions::default()),
        Err(EngineError::InvalidMacro(_))
    ));
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn nesting_beyond_max_depth_fails_the_run() {
    let (engine, driver) = engine(fast().with_max_depth(2));
    let always = || Condition::new("x", ConditionOperator::Equals, "x");
    let inner =
        MacroStep::if_condition(always(), vec![MacroStep::click(1, 1).with_id("deep")], vec![]);
    let outer = MacroStep::if_condition(always(), vec![inner], vec![]);
    let document = Arc::new(Macro::new("deep").with_steps(vec![outer]));

    let report = engine.run(document, RunOptions::default()).await.unwrap();
    match report.outcome {
        RunOutcome::Failed { step_id, error } => {
            assert_eq!(step_id.as_deref(), Some("deep"));
            assert!(error.contains("nesting depth"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(driver.actions().is_empty());
}

#[tokio::test]
async fn sensing_without_backend_is_fatal_even_when_skipping() {
    let (engine, driver) = engine(fast());
    let document = Arc::new(Macro::new("blind").with_steps(vec![
        MacroStep::text_search("OK", 1_000).with_id("look"),
        MacroStep::click(5, 5),
    ]));
    let report = engine.run(document, RunOptions::default()).await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Failed { .. }));
    assert_eq!(report.trace.entries()[0].outcome, StepOutcome::Error);
    assert!(driver.actions().is_empty());
}

#[tokio::test]
async fn disabled_steps_are_recorded_as_skipped() {
    let (engine, driver) = engine(fast());
    let document = Arc::new(
        Macro::new("partial")
            .with_steps(vec![MacroStep::click(1, 1).disabled(), MacroStep::type_text("x")]),
    );
    let report = engine.run(document, RunOptions::default()).await.unwrap();
    assert_eq!(report.trace.summary(), vec!["click:skip", "type:success"]);
    assert_eq!(driver.actions().len(), 1);
}

#[test]
fn wait_blocking_returns_report_outside_async() {
    init_tracing();
    let (engine, driver) = engine(fast());
    let steps = vec![MacroStep::wait(5), MacroStep::click(4, 2)];
    let document = Arc::new(Macro::new("blocking").with_steps(steps));

    let handle = engine.start(document, RunOptions::default()).unwrap();
    let report = handle.wait_blocking().unwrap();

    assert!(report.outcome.is_completed());
    assert_eq!(report.trace.summary(), vec!["wait:success", "click:success"]);
    assert_eq!(driver.actions().len(), 1);
    assert_eq!(engine.state(), EngineState::Idle);
}
