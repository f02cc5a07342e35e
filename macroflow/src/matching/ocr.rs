//! OCR through uni-ocr.
//!
//! The engine returns plain text for an image, not boxes. Text is localized by
//! recognizing horizontal bands separately and spreading each band's lines
//! evenly over its height, which is enough to aim a click at a line.

use async_trait::async_trait;
use image::{DynamicImage, RgbaImage};
use std::future::Future;
use tracing::{debug, warn};

use super::screen::{TextFragment, TextRecognizer};
use crate::errors::BackendUnavailableError;
use crate::geometry::Rect;

const DEFAULT_BAND_HEIGHT: u32 = 64;

#[derive(Debug, Clone)]
pub struct UniOcrRecognizer {
    band_height: u32,
}

impl Default for UniOcrRecognizer {
    fn default() -> Self {
        Self {
            band_height: DEFAULT_BAND_HEIGHT,
        }
    }
}

impl UniOcrRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_band_height(mut self, band_height: u32) -> Self {
        self.band_height = band_height.max(8);
        self
    }
}

async fn read_band(
    engine: &uni_ocr::OcrEngine,
    pixels: RgbaImage,
) -> Result<(String, f64), BackendUnavailableError> {
    let (text, _language, confidence) = engine
        .recognize_image(&DynamicImage::ImageRgba8(pixels))
        .await
        .map_err(|e| BackendUnavailableError(format!("OCR recognition failed: {e}")))?;
    Ok((text, normalize_confidence(confidence)))
}

/// Engines report either a 0..1 score, a percentage, or nothing.
fn normalize_confidence(raw: impl Into<Option<f64>>) -> f64 {
    match raw.into() {
        Some(c) if c.is_finite() && c > 1.0 => (c / 100.0).clamp(0.0, 1.0),
        Some(c) if c.is_finite() => c.max(0.0),
        _ => 1.0,
    }
}

/// Splits band text into lines and assigns each an equal slice of the band.
fn layout_lines(text: &str, confidence: f64, band: Rect) -> Vec<TextFragment> {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        return Vec::new();
    }
    let slice = (band.height / lines.len() as u32).max(1);
    lines
        .into_iter()
        .enumerate()
        .map(|(i, line)| TextFragment {
            text: line.to_string(),
            confidence,
            bounds: Rect::new(band.x, band.y + (i as u32 * slice) as i32, band.width, slice),
        })
        .collect()
}

/// Runs `read` over horizontal strips of `image` and lays out the lines it returns.
async fn recognize_bands<F, Fut>(
    image: &RgbaImage,
    band_height: u32,
    mut read: F,
) -> Result<Vec<TextFragment>, BackendUnavailableError>
where
    F: FnMut(RgbaImage) -> Fut,
    Fut: Future<Output = Result<(String, f64), BackendUnavailableError>>,
{
    let (width, height) = image.dimensions();
    let mut fragments = Vec::new();
    let mut top = 0;
    while top < height {
        let band_h = band_height.min(height - top);
        let band = Rect::new(0, top as i32, width, band_h);
        let pixels = image::imageops::crop_imm(image, 0, top, width, band_h).to_image();
        match read(pixels).await {
            Ok((text, confidence)) => fragments.extend(layout_lines(&text, confidence, band)),
            // A blank strip can make some engines fail; keep the rest of the frame.
            Err(e) if top > 0 || band_h < height => warn!("OCR band at y={} skipped: {}", top, e),
            Err(e) => return Err(e),
        }
        top += band_h;
    }
    debug!("OCR found {} line(s)", fragments.len());
    Ok(fragments)
}

#[async_trait]
impl TextRecognizer for UniOcrRecognizer {
    async fn recognize(
        &self,
        image: &RgbaImage,
    ) -> Result<Vec<TextFragment>, BackendUnavailableError> {
        let engine = uni_ocr::OcrEngine::new(uni_ocr::OcrProvider::Auto)
            .map_err(|e| BackendUnavailableError(format!("Failed to create OCR engine: {e}")))?;
        let engine = &engine;
        recognize_bands(image, self.band_height, |pixels| read_band(engine, pixels)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_scales() {
        assert_eq!(normalize_confidence(Some(87.0)), 0.87);
        assert_eq!(normalize_confidence(Some(0.5)), 0.5);
        assert_eq!(normalize_confidence(None), 1.0);
    }

    #[test]
    fn lines_split_band_evenly() {
        let lines = layout_lines("저장\n\n 완료 \n", 0.9, Rect::new(0, 64, 300, 64));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].text, "완료");
        assert_eq!(lines[1].bounds, Rect::new(0, 96, 300, 32));
    }

    #[tokio::test]
    async fn bands_cover_the_frame_and_skip_failed_strips() {
        let image = RgbaImage::new(300, 150);
        let mut seen = Vec::new();
        let fragments = recognize_bands(&image, 64, |pixels| {
            seen.push(pixels.height());
            let reply = match seen.len() {
                1 => Ok(("저장".to_string(), 0.9)),
                2 => Err(BackendUnavailableError("blank strip".into())),
                _ => Ok(("완료".to_string(), 0.8)),
            };
            async move { reply }
        })
        .await
        .unwrap();

        assert_eq!(seen, vec![64, 64, 22]);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].text, "완료");
        assert_eq!(fragments[1].bounds, Rect::new(0, 128, 300, 22));
    }

    #[tokio::test]
    async fn single_band_failure_is_reported() {
        let image = RgbaImage::new(100, 40);
        let result = recognize_bands(&image, 64, |_| async {
            Err(BackendUnavailableError("no engine".into()))
        })
        .await;
        assert!(result.is_err());
    }
}
