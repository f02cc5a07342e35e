//! Matching Service: answers "is this image / this text on screen, and where?"
//!
//! Every call is a single snapshot. "Not found" is `Ok(None)`; only backend
//! unavailability is an error. Polling is the engine's job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::errors::BackendUnavailableError;
use crate::geometry::{Point, Rect};

#[cfg(feature = "screen")]
mod capture;
#[cfg(feature = "screen")]
mod ocr;
pub mod screen;
pub mod template;

#[cfg(feature = "screen")]
pub use capture::XcapScreen;
#[cfg(feature = "screen")]
pub use ocr::UniOcrRecognizer;
pub use screen::{Capture, ScreenMatcher, ScreenSource, StillScreen, TextFragment, TextRecognizer};

/// A located image or text, produced only by a Matching Service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Matched text, or the template identifier for image matches.
    pub label: String,
    pub confidence: f64,
    pub bounds: Rect,
    pub center: Point,
    pub captured_at: DateTime<Utc>,
}

impl MatchResult {
    pub fn new(
        label: impl Into<String>,
        confidence: f64,
        bounds: Rect,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            label: label.into(),
            confidence,
            center: bounds.center(),
            bounds,
            captured_at,
        }
    }
}

#[async_trait]
pub trait MatchingService: Send + Sync {
    /// Best match of `template` at or above `confidence_threshold`.
    async fn find_image(
        &self,
        template: &str,
        region: Option<Rect>,
        confidence_threshold: f64,
    ) -> Result<Option<MatchResult>, BackendUnavailableError>;

    /// Best text match for `query` at or above `confidence_threshold`.
    async fn find_text(
        &self,
        query: &str,
        region: Option<Rect>,
        confidence_threshold: f64,
        exact_match: bool,
    ) -> Result<Option<MatchResult>, BackendUnavailableError>;

    /// All recognized text in scan order (top-to-bottom, left-to-right).
    async fn extract_text(
        &self,
        region: Option<Rect>,
    ) -> Result<Vec<MatchResult>, BackendUnavailableError>;

    fn name(&self) -> &str {
        "matcher"
    }
}

/// Highest confidence at or above `threshold`; ties go to the candidate closest to `anchor`
/// (the search region's center).
pub fn rank_best<I>(candidates: I, threshold: f64, anchor: Point) -> Option<MatchResult>
where
    I: IntoIterator<Item = MatchResult>,
{
    candidates
        .into_iter()
        .filter(|c| c.confidence >= threshold)
        .min_by(|a, b| compare_rank(a, b, anchor))
}

fn compare_rank(a: &MatchResult, b: &MatchResult, anchor: Point) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.center.distance_squared(anchor).cmp(&b.center.distance_squared(anchor)))
}

/// Orders results top-to-bottom, then left-to-right within a visual line.
/// Results whose vertical centers are within half a line height share a line.
pub fn sort_scan_order(results: &mut Vec<MatchResult>) {
    results.sort_by(|a, b| a.center.y.cmp(&b.center.y).then(a.center.x.cmp(&b.center.x)));

    let mut lines: Vec<Vec<MatchResult>> = Vec::new();
    for r in results.drain(..) {
        let joins = lines.last().and_then(|line| line.first()).map(|first| {
            let tolerance = (first.bounds.height.min(r.bounds.height) / 2).max(1) as i32;
            (r.center.y - first.center.y).abs() <= tolerance
        });
        match (joins, lines.last_mut()) {
            (Some(true), Some(line)) => line.push(r),
            _ => lines.push(vec![r]),
        }
    }

    for mut line in lines {
        line.sort_by_key(|r| r.center.x);
        results.extend(line);
    }
}

/// Case-folded, trimmed, whitespace-collapsed form used for text comparison.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `exact`: normalized equality. Otherwise the candidate contains the query, or a
/// candidate longer than two characters is contained in the query.
pub fn text_matches(query: &str, candidate: &str, exact: bool) -> bool {
    let q = normalize_text(query);
    let c = normalize_text(candidate);
    if q.is_empty() || c.is_empty() {
        return false;
    }
    if exact {
        return q == c;
    }
    c.contains(&q) || (c.chars().count() > 2 && q.contains(&c))
}

/// Stand-in for builds without screen support: every call reports the backend missing.
#[derive(Debug, Clone)]
pub struct UnavailableMatcher {
    reason: String,
}

impl UnavailableMatcher {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl Default for UnavailableMatcher {
    fn default() -> Self {
        Self::new("built without the `screen` feature")
    }
}

#[async_trait]
impl MatchingService for UnavailableMatcher {
    async fn find_image(
        &self,
        _template: &str,
        _region: Option<Rect>,
        _confidence_threshold: f64,
    ) -> Result<Option<MatchResult>, BackendUnavailableError> {
        Err(BackendUnavailableError(self.reason.clone()))
    }

    async fn find_text(
        &self,
        _query: &str,
        _region: Option<Rect>,
        _confidence_threshold: f64,
        _exact_match: bool,
    ) -> Result<Option<MatchResult>, BackendUnavailableError> {
        Err(BackendUnavailableError(self.reason.clone()))
    }

    async fn extract_text(
        &self,
        _region: Option<Rect>,
    ) -> Result<Vec<MatchResult>, BackendUnavailableError> {
        Err(BackendUnavailableError(self.reason.clone()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}
