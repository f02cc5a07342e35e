#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use macroflow::errors::{ActionDriverError, BackendUnavailableError};
use macroflow::step::MouseButton;
use macroflow::{ActionDriver, DryRunDriver, EngineConfig, MatchResult, MatchingService, Rect};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine settings without inter-step pauses.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_step_delay_ms(0).with_poll_interval_ms(20)
}

struct Scripted {
    result: MatchResult,
    /// Probes that miss before the target shows up.
    misses: u32,
}

/// Matching service answering from a fixed script, keyed by template or query.
#[derive(Default)]
pub struct ScriptedMatcher {
    script: Mutex<HashMap<String, Scripted>>,
    probes: Mutex<HashMap<String, u32>>,
    total: AtomicU32,
}

impl ScriptedMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `target` is visible at `(x, y)` from the first probe on.
    pub fn shows(self, target: &str, x: i32, y: i32, confidence: f64) -> Self {
        self.shows_after(target, 0, x, y, confidence)
    }

    /// `target` appears after `misses` unsuccessful probes.
    pub fn shows_after(self, target: &str, misses: u32, x: i32, y: i32, confidence: f64) -> Self {
        let bounds = Rect::new(x - 10, y - 5, 20, 10);
        let result = MatchResult::new(target, confidence, bounds, Utc::now());
        if let Ok(mut script) = self.script.lock() {
            script.insert(target.to_string(), Scripted { result, misses });
        }
        self
    }

    pub fn probes_of(&self, target: &str) -> u32 {
        self.probes.lock().unwrap().get(target).copied().unwrap_or(0)
    }

    pub fn total_probes(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    fn answer(&self, target: &str, threshold: f64) -> Option<MatchResult> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let mut probes = self.probes.lock().unwrap();
        let seen = probes.entry(target.to_string()).or_insert(0);
        *seen += 1;
        let script = self.script.lock().unwrap();
        let entry = script.get(target)?;
        (*seen > entry.misses && entry.result.confidence >= threshold).then(|| entry.result.clone())
    }
}

#[async_trait]
impl MatchingService for ScriptedMatcher {
    async fn find_image(
        &self,
        template: &str,
        _region: Option<Rect>,
        confidence_threshold: f64,
    ) -> Result<Option<MatchResult>, BackendUnavailableError> {
        Ok(self.answer(template, confidence_threshold))
    }

    async fn find_text(
        &self,
        query: &str,
        _region: Option<Rect>,
        confidence_threshold: f64,
        _exact_match: bool,
    ) -> Result<Option<MatchResult>, BackendUnavailableError> {
        Ok(self.answer(query, confidence_threshold))
    }

    async fn extract_text(
        &self,
        _region: Option<Rect>,
    ) -> Result<Vec<MatchResult>, BackendUnavailableError> {
        let script = self.script.lock().unwrap();
        Ok(script.values().map(|s| s.result.clone()).collect())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Driver whose first `failures` clicks fail; everything is recorded by an inner dry-run driver.
pub struct FlakyDriver {
    pub inner: DryRunDriver,
    failures: AtomicU32,
}

impl FlakyDriver {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: DryRunDriver::new(),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl ActionDriver for FlakyDriver {
    async fn click(
        &self,
        x: i32,
        y: i32,
        button: MouseButton,
        count: u32,
    ) -> Result<(), ActionDriverError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(ActionDriverError::Synthesis("injected failure".to_string()));
        }
        self.inner.click(x, y, button, count).await
    }

    async fn move_to(&self, x: i32, y: i32, duration: Duration) -> Result<(), ActionDriverError> {
        self.inner.move_to(x, y, duration).await
    }

    async fn type_text(&self, text: &str, interval: Duration) -> Result<(), ActionDriverError> {
        self.inner.type_text(text, interval).await
    }

    async fn hotkey(&self, keys: &[String]) -> Result<(), ActionDriverError> {
        self.inner.hotkey(keys).await
    }
}

pub fn recording() -> Arc<DryRunDriver> {
    Arc::new(DryRunDriver::new())
}
