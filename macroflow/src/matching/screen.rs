//! Screen-backed Matching Service: capture source + template matcher + text recognizer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage, RgbaImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

use super::template::TemplateMatcher;
use super::{rank_best, sort_scan_order, text_matches, MatchResult, MatchingService};
use crate::errors::BackendUnavailableError;
use crate::geometry::{Point, Rect};

/// One captured frame and where it sits on the virtual screen.
#[derive(Debug, Clone)]
pub struct Capture {
    pub image: RgbaImage,
    pub origin: Point,
    pub captured_at: DateTime<Utc>,
}

impl Capture {
    pub fn bounds(&self) -> Rect {
        Rect::new(self.origin.x, self.origin.y, self.image.width(), self.image.height())
    }
}

/// Produces screen pixels. Implementations are blocking and are called off the
/// async executor.
pub trait ScreenSource: Send + Sync + 'static {
    /// Captures `region`, or the whole primary screen when `None`. A region that
    /// lies entirely off the screen yields `Ok(None)`.
    fn capture(&self, region: Option<Rect>) -> Result<Option<Capture>, BackendUnavailableError>;
}

/// Text found in an image, in image-local coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFragment {
    pub text: String,
    pub confidence: f64,
    pub bounds: Rect,
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(
        &self,
        image: &RgbaImage,
    ) -> Result<Vec<TextFragment>, BackendUnavailableError>;
}

/// A fixed image standing in for the screen, e.g. a saved screenshot.
#[derive(Debug, Clone)]
pub struct StillScreen {
    image: RgbaImage,
}

impl StillScreen {
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn open(path: &Path) -> Result<Self, BackendUnavailableError> {
        let image = image::open(path)
            .map_err(|e| {
                BackendUnavailableError(format!("cannot read screenshot {}: {e}", path.display()))
            })?;
        Ok(Self::new(image.to_rgba8()))
    }
}

impl ScreenSource for StillScreen {
    fn capture(&self, region: Option<Rect>) -> Result<Option<Capture>, BackendUnavailableError> {
        Ok(crop_to_region(&self.image, Point::default(), region))
    }
}

/// Crops a full-screen frame (whose top-left is `origin`) to `region`.
/// `None` when the region does not overlap the frame.
pub(crate) fn crop_to_region(
    frame: &RgbaImage,
    origin: Point,
    region: Option<Rect>,
) -> Option<Capture> {
    let captured_at = Utc::now();
    let screen = Rect::new(origin.x, origin.y, frame.width(), frame.height());
    let Some(region) = region else {
        return Some(Capture {
            image: frame.clone(),
            origin,
            captured_at,
        });
    };
    let Some(visible) = screen.intersection(&region) else {
        debug!("Region {:?} lies outside the screen {:?}", region, screen);
        return None;
    };
    let image = image::imageops::crop_imm(
        frame,
        (visible.x - origin.x) as u32,
        (visible.y - origin.y) as u32,
        visible.width,
        visible.height,
    )
    .to_image();
    Some(Capture {
        image,
        origin: Point::new(visible.x, visible.y),
        captured_at,
    })
}

pub struct ScreenMatcher {
    source: Arc<dyn ScreenSource>,
    recognizer: Option<Arc<dyn TextRecognizer>>,
    matcher: TemplateMatcher,
    asset_root: Option<PathBuf>,
    templates: Mutex<HashMap<PathBuf, Arc<GrayImage>>>,
}

impl ScreenMatcher {
    pub fn new(source: Arc<dyn ScreenSource>) -> Self {
        Self {
            source,
            recognizer: None,
            matcher: TemplateMatcher::default(),
            asset_root: None,
            templates: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn TextRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    /// Directory relative template paths are resolved against (usually the macro's folder).
    pub fn with_asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.asset_root = Some(root.into());
        self
    }

    pub fn with_template_matcher(mut self, matcher: TemplateMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn clear_template_cache(&self) {
        if let Ok(mut cache) = self.templates.lock() {
            cache.clear();
        }
    }

    fn template_path(&self, template: &str) -> PathBuf {
        let path = PathBuf::from(template);
        match &self.asset_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }

    fn load_template(&self, template: &str) -> Result<Arc<GrayImage>, BackendUnavailableError> {
        let path = self.template_path(template);
        if let Some(cached) = self.templates.lock().ok().and_then(|c| c.get(&path).cloned()) {
            return Ok(cached);
        }
        let image = image::open(&path)
            .map_err(|e| {
                BackendUnavailableError(format!("cannot read template {}: {e}", path.display()))
            })?
            .to_luma8();
        let image = Arc::new(image);
        if let Ok(mut cache) = self.templates.lock() {
            cache.insert(path, image.clone());
        }
        Ok(image)
    }

    async fn capture(
        &self,
        region: Option<Rect>,
    ) -> Result<Option<Capture>, BackendUnavailableError> {
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || source.capture(region))
            .await
            .map_err(|e| BackendUnavailableError(format!("capture task failed: {e}")))?
    }

    /// Recognized text translated to screen coordinates, plus the capture it came from.
    /// `None` when the region is off screen.
    async fn recognize(
        &self,
        region: Option<Rect>,
    ) -> Result<Option<(Vec<MatchResult>, Capture)>, BackendUnavailableError> {
        let recognizer = self
            .recognizer
            .as_ref()
            .ok_or_else(|| BackendUnavailableError("no OCR backend configured".to_string()))?;
        let Some(capture) = self.capture(region).await? else {
            return Ok(None);
        };
        let fragments = recognizer.recognize(&capture.image).await?;
        let results = fragments
            .into_iter()
            .filter(|f| !f.text.trim().is_empty())
            .map(|f| {
                MatchResult::new(
                    f.text.trim(),
                    f.confidence,
                    f.bounds.translate(capture.origin),
                    capture.captured_at,
                )
            })
            .collect();
        Ok(Some((results, capture)))
    }
}

#[async_trait]
impl MatchingService for ScreenMatcher {
    #[instrument(level = "debug", skip(self))]
    async fn find_image(
        &self,
        template: &str,
        region: Option<Rect>,
        confidence_threshold: f64,
    ) -> Result<Option<MatchResult>, BackendUnavailableError> {
        let needle = self.load_template(template)?;
        let Some(capture) = self.capture(region).await? else {
            return Ok(None);
        };
        let haystack = DynamicImage::ImageRgba8(capture.image.clone()).to_luma8();

        let matcher = self.matcher.clone();
        let search_needle = needle.clone();
        let hits = tokio::task::spawn_blocking(move || {
            matcher.find_matches(&haystack, &search_needle, confidence_threshold)
        })
        .await
        .map_err(|e| BackendUnavailableError(format!("template search failed: {e}")))?;
        debug!("{} candidate(s) for {}", hits.len(), template);

        let anchor = capture.bounds().center();
        let candidates = hits.into_iter().map(|h| {
            let bounds = Rect::new(h.x as i32, h.y as i32, needle.width(), needle.height())
                .translate(capture.origin);
            MatchResult::new(template, h.score, bounds, capture.captured_at)
        });
        Ok(rank_best(candidates, confidence_threshold, anchor))
    }

    #[instrument(level = "debug", skip(self))]
    async fn find_text(
        &self,
        query: &str,
        region: Option<Rect>,
        confidence_threshold: f64,
        exact_match: bool,
    ) -> Result<Option<MatchResult>, BackendUnavailableError> {
        let Some((results, capture)) = self.recognize(region).await? else {
            return Ok(None);
        };
        let anchor = capture.bounds().center();
        let candidates = results
            .into_iter()
            .filter(|r| text_matches(query, &r.label, exact_match));
        Ok(rank_best(candidates, confidence_threshold, anchor))
    }

    async fn extract_text(
        &self,
        region: Option<Rect>,
    ) -> Result<Vec<MatchResult>, BackendUnavailableError> {
        let Some((mut results, _)) = self.recognize(region).await? else {
            return Ok(Vec::new());
        };
        sort_scan_order(&mut results);
        Ok(results)
    }

    fn name(&self) -> &str {
        "screen"
    }
}
