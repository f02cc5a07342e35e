mod common;

use common::{fast_config, init_tracing, recording, FlakyDriver, ScriptedMatcher};
use futures::StreamExt;
use image::{Rgba, RgbaImage};
use macroflow::driver::DriverAction;
use macroflow::engine::{Branch, RunEvent};
use macroflow::errors::AbortReason;
use macroflow::matching::StillScreen;
use macroflow::step::{ErrorHandling, MatchClick, MouseButton, Offset, StepKind};
use macroflow::{
    Condition, ConditionOperator, Engine, FailurePolicy, Macro, MacroStep, Rect, RunOptions,
    RunOutcome, ScreenMatcher, StepOutcome, StepType,
};
use std::sync::Arc;
use std::time::Duration;

fn completed(outcome: &RunOutcome) -> bool {
    matches!(outcome, RunOutcome::Completed)
}

#[tokio::test]
async fn done_banner_scenario() {
    init_tracing();
    let matcher = Arc::new(ScriptedMatcher::new().shows("완료", 400, 300, 0.92));
    let driver = recording();
    let engine = Engine::new(matcher, driver.clone(), fast_config());

    let document = Macro::new("완료 확인").with_steps(vec![
        MacroStep::click(10, 10),
        MacroStep::text_search("완료", 2_000),
        MacroStep::if_condition(
            Condition::new("${matched_text}", ConditionOperator::Equals, "완료"),
            vec![MacroStep::type_text("done")],
            vec![MacroStep::wait(1_000)],
        ),
    ]);

    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert!(completed(&report.outcome));
    assert_eq!(
        report.trace.summary(),
        vec![
            "click:success",
            "text_search:success(match=\"완료\")",
            "if:true_branch",
            "type:success"
        ]
    );
    assert_eq!(report.variables.get("matched_x").map(String::as_str), Some("400"));
    assert_eq!(
        driver.actions(),
        vec![
            DriverAction::Click {
                x: 10,
                y: 10,
                button: MouseButton::Left,
                count: 1
            },
            DriverAction::Type {
                text: "done".into(),
                interval: Duration::ZERO
            },
        ]
    );
}

#[tokio::test]
async fn identical_inputs_give_identical_traces() {
    let document = Arc::new(Macro::new("repeatable").with_variable("who", "kim").with_steps(vec![
        MacroStep::wait_image("ok.png", 1_000),
        MacroStep::type_text("hi ${who}"),
        MacroStep::repeat(3, vec![MacroStep::click("${matched_x}", "${matched_y}")]),
    ]));

    let mut traces = Vec::new();
    for _ in 0..2 {
        let matcher = Arc::new(ScriptedMatcher::new().shows_after("ok.png", 2, 50, 60, 0.97));
        let engine = Engine::new(matcher, recording(), fast_config());
        let report = engine.run(document.clone(), RunOptions::default()).await.unwrap();
        assert!(completed(&report.outcome));
        traces.push(report.trace.without_timestamps());
    }
    assert_eq!(traces[0], traces[1]);
    assert_eq!(traces[0].len(), 6);
}

#[tokio::test]
async fn count_loop_runs_body_exactly_n_times() {
    let driver = recording();
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), driver.clone(), fast_config());
    let repeat = MacroStep::repeat(7, vec![MacroStep::click(1, 2)]).with_id("l");
    let document = Macro::new("seven").with_steps(vec![repeat]);

    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert_eq!(driver.actions().len(), 7);
    let last = report.trace.entries().last().unwrap();
    assert_eq!(last.step_id, "l");
    assert_eq!(
        last.outcome,
        StepOutcome::Loop {
            iterations: 7,
            limited: false
        }
    );
    assert!(report.warnings.is_empty());
}

#[tokio::test]
async fn condition_loop_stops_at_its_bound_with_warning() {
    let driver = recording();
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), driver.clone(), fast_config());
    let forever = Condition::new("go", ConditionOperator::Equals, "go");
    let document = Macro::new("bounded").with_steps(vec![
        MacroStep::loop_while(forever, 5, vec![MacroStep::type_text("x")]).with_id("spin"),
        MacroStep::hotkey(["ctrl", "s"]),
    ]);

    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert!(completed(&report.outcome), "run continues after the cap");
    assert_eq!(driver.actions().len(), 6);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].step_id, "spin");
    assert_eq!(report.warnings[0].max_iterations, 5);
    let loop_entry = report.trace.iter().find(|e| e.step_id == "spin").unwrap();
    assert_eq!(
        loop_entry.outcome,
        StepOutcome::Loop {
            iterations: 5,
            limited: true
        }
    );
    assert_eq!(report.trace.summary().last().map(String::as_str), Some("hotkey:success"));
}

#[tokio::test]
async fn condition_loop_with_index_variable() {
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), recording(), fast_config());
    let mut step = MacroStep::loop_while(
        Condition::new("${i}", ConditionOperator::LessThan, "3"),
        100,
        vec![MacroStep::type_text("row ${i}")],
    );
    if let StepKind::Loop(l) = &mut step.kind {
        l.index_variable = Some("i".to_string());
    }
    let document = Macro::new("indexed").with_steps(vec![step]);

    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    let loop_entry = report.trace.entries().last().unwrap();
    assert_eq!(
        loop_entry.outcome,
        StepOutcome::Loop {
            iterations: 3,
            limited: false
        }
    );
    // `i` is unbound on the first check.
    assert_eq!(loop_entry.unresolved, vec!["i".to_string()]);
    assert!(report.warnings.is_empty());
}

#[tokio::test]
async fn if_runs_exactly_one_branch() {
    for (value, taken, x) in [("yes", Branch::TrueBranch, 1), ("no", Branch::FalseBranch, 2)] {
        let driver = recording();
        let engine = Engine::new(Arc::new(ScriptedMatcher::new()), driver.clone(), fast_config());
        let fork = MacroStep::if_condition(
            Condition::new("${answer}", ConditionOperator::Equals, "yes"),
            vec![MacroStep::click(1, 1), MacroStep::click(1, 1)],
            vec![MacroStep::click(2, 2)],
        );
        let document = Macro::new("fork").with_variable("answer", value).with_steps(vec![fork]);

        let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
        assert_eq!(report.trace.entries()[0].outcome, StepOutcome::Branch { taken });
        let actions = driver.actions();
        assert!(!actions.is_empty());
        assert!(actions
            .iter()
            .all(|a| matches!(a, DriverAction::Click { x: cx, .. } if *cx == x)));
    }
}

#[tokio::test]
async fn match_timeout_respects_its_window() {
    let timeout_ms = 300;
    let poll_ms = 100;
    let matcher = Arc::new(ScriptedMatcher::new());
    let config = fast_config().with_poll_interval_ms(poll_ms);
    let engine = Engine::new(matcher.clone(), recording(), config);
    let look = MacroStep::text_search("never", timeout_ms).with_id("look");
    let document = Macro::new("absent").with_steps(vec![look]);

    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    let entry = &report.trace.entries()[0];
    assert_eq!(entry.outcome, StepOutcome::Timeout);
    let waited = (entry.finished_at - entry.started_at).num_milliseconds();
    assert!(waited >= timeout_ms as i64, "gave up early after {waited}ms");
    assert!(waited <= (timeout_ms + poll_ms + 150) as i64, "overshot to {waited}ms");
    assert!(matcher.probes_of("never") >= 3);
    assert!(entry.error.as_deref().unwrap_or_default().contains("never"));
}

#[tokio::test]
async fn late_match_within_timeout_succeeds() {
    let matcher = Arc::new(ScriptedMatcher::new().shows_after("저장", 3, 10, 10, 0.9));
    let engine = Engine::new(matcher.clone(), recording(), fast_config());
    let document = Macro::new("late").with_steps(vec![MacroStep::text_search("저장", 5_000)]);

    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert_eq!(report.trace.summary(), vec!["text_search:success(match=\"저장\")"]);
    assert_eq!(matcher.probes_of("저장"), 4);
}

#[tokio::test]
async fn cancelling_a_long_loop_stops_promptly() {
    init_tracing();
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), recording(), fast_config());
    let repeat = MacroStep::repeat(1_000, vec![MacroStep::wait(20)]).with_id("big");
    let document = Macro::new("long").with_steps(vec![repeat]);

    let mut events = engine.subscribe();
    let handle = engine.start(Arc::new(document), RunOptions::default()).unwrap();
    let mut finished = 0;
    while finished < 10 {
        if let RunEvent::StepFinished { .. } = events.recv().await.unwrap() {
            finished += 1;
        }
    }
    handle.cancel();
    let report = handle.wait().await.unwrap();

    assert!(matches!(
        report.outcome,
        RunOutcome::Aborted {
            reason: AbortReason::Cancelled,
            ..
        }
    ));
    assert!(report.trace.len() < 1_000);
    // At most the in-flight wait finishes after the request.
    let body_entries = report.trace.iter().filter(|e| e.step_type == StepType::WaitTime).count();
    assert!(body_entries <= finished + 2, "{body_entries} body steps ran");
    let loop_entry = report.trace.entries().last().unwrap();
    assert_eq!(loop_entry.step_id, "big");
    assert_eq!(loop_entry.outcome, StepOutcome::Aborted);
}

#[tokio::test]
async fn run_timeout_aborts_with_its_own_reason() {
    let engine = Engine::new(
        Arc::new(ScriptedMatcher::new()),
        recording(),
        fast_config().with_run_timeout_ms(Some(100)),
    );
    let document =
        Macro::new("slow").with_steps(vec![MacroStep::wait(10_000), MacroStep::click(1, 1)]);

    let started = std::time::Instant::now();
    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        report.outcome,
        RunOutcome::Aborted {
            reason: AbortReason::RunTimeout,
            ..
        }
    ));
    assert_eq!(report.trace.summary(), vec!["wait:aborted"]);
}

fn timeout_then_click() -> Macro {
    Macro::new("policy").with_steps(vec![
        MacroStep::text_search("missing", 50).with_id("look"),
        MacroStep::click(3, 3),
    ])
}

#[tokio::test]
async fn skip_policy_records_and_continues() {
    let driver = recording();
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), driver.clone(), fast_config());
    let report = engine.run(Arc::new(timeout_then_click()), RunOptions::default()).await.unwrap();
    assert!(completed(&report.outcome));
    assert_eq!(report.trace.summary(), vec!["text_search:timeout", "click:success"]);
    assert_eq!(report.problems().count(), 1);
    assert_eq!(driver.actions().len(), 1);
}

#[tokio::test]
async fn off_screen_region_times_out_and_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    RgbaImage::from_pixel(8, 8, Rgba([255, 0, 0, 255]))
        .save(dir.path().join("ok.png"))
        .unwrap();
    let screen = StillScreen::new(RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 255])));
    let matcher = Arc::new(ScreenMatcher::new(Arc::new(screen)).with_asset_root(dir.path()));
    let driver = recording();
    let engine = Engine::new(matcher, driver.clone(), fast_config());

    let mut look = MacroStep::wait_image("ok.png", 100);
    if let StepKind::WaitImage(w) = &mut look.kind {
        w.region = Some(Rect::new(500, 500, 10, 10));
    }
    let document = Macro::new("away").with_steps(vec![look, MacroStep::click(3, 3)]);

    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert!(completed(&report.outcome));
    assert_eq!(report.trace.summary(), vec!["wait_image:timeout", "click:success"]);
    assert_eq!(driver.actions().len(), 1);
}

#[tokio::test]
async fn abort_policy_fails_the_run() {
    let driver = recording();
    let config = fast_config().with_failure_policy(FailurePolicy::AbortOnFailure);
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), driver.clone(), config);
    let report = engine.run(Arc::new(timeout_then_click()), RunOptions::default()).await.unwrap();
    match &report.outcome {
        RunOutcome::Failed { step_id, .. } => assert_eq!(step_id.as_deref(), Some("look")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(report.trace.summary(), vec!["text_search:timeout"]);
    assert!(driver.actions().is_empty());
}

#[tokio::test]
async fn per_step_override_beats_run_policy() {
    let config = fast_config().with_failure_policy(FailurePolicy::AbortOnFailure);
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), recording(), config);
    let mut document = timeout_then_click();
    document.steps[0] = document.steps[0].clone().with_on_error(ErrorHandling::Continue);
    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert!(completed(&report.outcome));

    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), recording(), fast_config());
    let mut document = timeout_then_click();
    document.steps[0] = document.steps[0].clone().with_on_error(ErrorHandling::Stop);
    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Failed { .. }));
}

#[tokio::test]
async fn retries_absorb_transient_driver_failures() {
    let driver = Arc::new(FlakyDriver::new(2));
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), driver.clone(), fast_config());
    let document = Macro::new("retry").with_steps(vec![MacroStep::click(9, 9).with_retries(2)]);
    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    let entry = &report.trace.entries()[0];
    assert_eq!(entry.outcome, StepOutcome::Success);
    assert_eq!(entry.attempts, 3);
    assert_eq!(driver.inner.actions().len(), 1);

    let driver = Arc::new(FlakyDriver::new(2));
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), driver, fast_config());
    let document = Macro::new("retry").with_steps(vec![MacroStep::click(9, 9).with_retries(1)]);
    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert_eq!(report.trace.entries()[0].outcome, StepOutcome::Error);
    assert_eq!(report.trace.entries()[0].attempts, 2);
}

#[tokio::test]
async fn unbound_variables_become_empty_and_are_reported() {
    let document =
        Arc::new(Macro::new("greet").with_steps(vec![MacroStep::type_text("Hello ${name}!")]));

    let driver = recording();
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), driver.clone(), fast_config());
    let report = engine.run(document.clone(), RunOptions::default()).await.unwrap();
    assert_eq!(report.trace.entries()[0].unresolved, vec!["name".to_string()]);
    assert!(matches!(&driver.actions()[0], DriverAction::Type { text, .. } if text == "Hello !"));

    let driver = recording();
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), driver.clone(), fast_config());
    let report = engine
        .run(document, RunOptions::default().with_variable("name", "Kim"))
        .await
        .unwrap();
    assert!(report.trace.entries()[0].unresolved.is_empty());
    assert!(matches!(
        &driver.actions()[0],
        DriverAction::Type { text, .. } if text == "Hello Kim!"
    ));
}

#[tokio::test]
async fn match_outputs_drive_later_clicks() {
    let driver = recording();
    let matcher = Arc::new(ScriptedMatcher::new().shows("submit.png", 200, 120, 0.95));
    let engine = Engine::new(matcher, driver.clone(), fast_config());

    let mut find = MacroStep::wait_image("submit.png", 1_000);
    if let StepKind::WaitImage(w) = &mut find.kind {
        w.output_variable = Some("btn".to_string());
        w.click_on_match = Some(MatchClick {
            button: MouseButton::Left,
            click_count: 2,
            offset: Offset { x: 5, y: 0 },
        });
    }
    let document =
        Macro::new("outputs").with_steps(vec![find, MacroStep::move_to("${btn_x}", "${btn_y}", 0)]);

    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert!(completed(&report.outcome));
    assert_eq!(report.variables.get("btn").map(String::as_str), Some("submit.png"));
    assert_eq!(
        driver.actions(),
        vec![
            DriverAction::Click {
                x: 205,
                y: 120,
                button: MouseButton::Left,
                count: 2
            },
            DriverAction::Move {
                x: 200,
                y: 120,
                duration: Duration::ZERO
            },
        ]
    );
}

#[tokio::test]
async fn overflowing_match_offset_is_a_step_error() {
    let driver = recording();
    let matcher = Arc::new(ScriptedMatcher::new().shows("ok.png", 100, 100, 0.95));
    let engine = Engine::new(matcher, driver.clone(), fast_config());

    let mut find = MacroStep::wait_image("ok.png", 1_000);
    if let StepKind::WaitImage(w) = &mut find.kind {
        w.click_on_match = Some(MatchClick {
            button: MouseButton::Left,
            click_count: 1,
            offset: Offset { x: i32::MAX, y: 0 },
        });
    }
    let document = Macro::new("far offset").with_steps(vec![find, MacroStep::click(1, 2)]);
    document.validate().unwrap();

    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert!(completed(&report.outcome));
    assert_eq!(report.trace.summary(), vec!["wait_image:error", "click:success"]);
    assert!(report.trace.entries()[0].error.as_deref().unwrap().contains("offset"));
    assert_eq!(
        driver.actions(),
        vec![DriverAction::Click {
            x: 1,
            y: 2,
            button: MouseButton::Left,
            count: 1
        }]
    );
}

#[tokio::test]
async fn non_numeric_coordinate_is_a_step_error() {
    let driver = recording();
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), driver.clone(), fast_config());
    let document = Macro::new("bad coords")
        .with_variable("col", "abc")
        .with_steps(vec![MacroStep::click("${col}", 1), MacroStep::click(4, 4)]);
    let report = engine.run(Arc::new(document), RunOptions::default()).await.unwrap();
    assert!(completed(&report.outcome));
    assert_eq!(report.trace.summary(), vec!["click:error", "click:success"]);
    assert!(report.trace.entries()[0].error.as_deref().unwrap().contains("abc"));
    assert_eq!(driver.actions().len(), 1);
}

#[tokio::test]
async fn event_stream_reports_the_whole_run() {
    let engine = Engine::new(Arc::new(ScriptedMatcher::new()), recording(), fast_config());
    let stream = engine.event_stream();
    let document =
        Macro::new("observed").with_steps(vec![MacroStep::click(1, 1), MacroStep::type_text("a")]);
    let handle = engine.start(Arc::new(document), RunOptions::default()).unwrap();

    let collected: Vec<RunEvent> = stream
        .take_while(|e| futures::future::ready(!matches!(e, RunEvent::RunFinished { .. })))
        .collect()
        .await;
    let report = handle.wait().await.unwrap();

    assert!(matches!(collected.first(), Some(RunEvent::StateChanged { .. })));
    let started = collected.iter().filter(|e| matches!(e, RunEvent::StepStarted { .. })).count();
    let finished: Vec<_> = collected
        .iter()
        .filter_map(|e| match e {
            RunEvent::StepFinished { entry, .. } => Some(entry.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(started, 2);
    assert_eq!(finished, report.trace.entries());
    assert!(collected.iter().all(|e| e.run_id() == report.run_id));
}
