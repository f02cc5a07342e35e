//! Grayscale template matching by normalized cross-correlation.
//!
//! Scores are the zero-mean normalized correlation coefficient, clamped to [0, 1].
//! Large templates are first located on a downscaled copy of both images and then
//! refined at full resolution around the best coarse candidates.

use image::imageops::{self, FilterType};
use image::GrayImage;

use crate::geometry::Rect;

const EPSILON: f64 = 1e-6;

/// A template position (top-left, image coordinates) and its score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateHit {
    pub x: u32,
    pub y: u32,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct TemplateMatcher {
    /// Upper bound on hits returned per search.
    pub max_hits: usize,
    /// Smallest template side allowed at the coarse level.
    pub min_coarse_side: u32,
    /// Largest downscale factor tried.
    pub max_factor: u32,
    /// Coarse candidates carried into full-resolution refinement.
    pub refine_candidates: usize,
    /// How far below the final threshold a coarse score may be and still be refined.
    pub coarse_slack: f64,
}

impl Default for TemplateMatcher {
    fn default() -> Self {
        Self {
            max_hits: 32,
            min_coarse_side: 8,
            max_factor: 8,
            refine_candidates: 16,
            coarse_slack: 0.3,
        }
    }
}

impl TemplateMatcher {
    /// Non-overlapping hits scoring at least `threshold`, best first.
    pub fn find_matches(
        &self,
        haystack: &GrayImage,
        needle: &GrayImage,
        threshold: f64,
    ) -> Vec<TemplateHit> {
        let (hw, hh) = haystack.dimensions();
        let (nw, nh) = needle.dimensions();
        if nw == 0 || nh == 0 || nw > hw || nh > hh {
            return Vec::new();
        }

        let factor = self.pyramid_factor(nw, nh);
        let full = Correlator::new(haystack, needle);

        let hits = if factor == 1 {
            let mut hits = Vec::new();
            for y in 0..=(hh - nh) {
                for x in 0..=(hw - nw) {
                    let score = full.score(x, y);
                    if score >= threshold {
                        hits.push(TemplateHit { x, y, score });
                    }
                }
            }
            hits
        } else {
            self.coarse_to_fine(haystack, needle, &full, factor, threshold)
        };

        suppress_overlaps(hits, nw, nh, self.max_hits)
    }

    fn pyramid_factor(&self, nw: u32, nh: u32) -> u32 {
        let mut factor = self.max_factor.max(1);
        while factor > 1
            && (nw / factor < self.min_coarse_side || nh / factor < self.min_coarse_side)
        {
            factor /= 2;
        }
        factor.max(1)
    }

    fn coarse_to_fine(
        &self,
        haystack: &GrayImage,
        needle: &GrayImage,
        full: &Correlator,
        factor: u32,
        threshold: f64,
    ) -> Vec<TemplateHit> {
        let (hw, hh) = haystack.dimensions();
        let (nw, nh) = needle.dimensions();

        let small_hay = imageops::resize(
            haystack,
            (hw / factor).max(1),
            (hh / factor).max(1),
            FilterType::Triangle,
        );
        let small_needle = imageops::resize(
            needle,
            (nw / factor).max(1),
            (nh / factor).max(1),
            FilterType::Triangle,
        );
        let (sw, sh) = small_hay.dimensions();
        let (snw, snh) = small_needle.dimensions();
        if snw > sw || snh > sh {
            return Vec::new();
        }

        let coarse = Correlator::new(&small_hay, &small_needle);
        let coarse_threshold = (threshold - self.coarse_slack).max(0.0);
        let mut candidates = Vec::new();
        for y in 0..=(sh - snh) {
            for x in 0..=(sw - snw) {
                let score = coarse.score(x, y);
                if score >= coarse_threshold {
                    candidates.push(TemplateHit { x, y, score });
                }
            }
        }
        let candidates = suppress_overlaps(candidates, snw, snh, self.refine_candidates);

        let radius = 2 * factor;
        let mut hits = Vec::new();
        for c in candidates {
            let cx = c.x * factor;
            let cy = c.y * factor;
            let x0 = cx.saturating_sub(radius);
            let y0 = cy.saturating_sub(radius);
            let x1 = (cx + radius).min(hw - nw);
            let y1 = (cy + radius).min(hh - nh);

            let mut best: Option<TemplateHit> = None;
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let score = full.score(x, y);
                    if best.map(|b| score > b.score).unwrap_or(true) {
                        best = Some(TemplateHit { x, y, score });
                    }
                }
            }
            if let Some(b) = best.filter(|b| b.score >= threshold) {
                hits.push(b);
            }
        }
        hits
    }
}

/// Greedy non-maximum suppression: keeps the best hits whose boxes overlap
/// an already kept hit by at most half.
fn suppress_overlaps(mut hits: Vec<TemplateHit>, w: u32, h: u32, limit: usize) -> Vec<TemplateHit> {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<TemplateHit> = Vec::new();
    for hit in hits {
        if kept.len() >= limit {
            break;
        }
        let rect = Rect::new(hit.x as i32, hit.y as i32, w, h);
        let overlaps = kept
            .iter()
            .any(|k| Rect::new(k.x as i32, k.y as i32, w, h).overlap_ratio(&rect) > 0.5);
        if !overlaps {
            kept.push(hit);
        }
    }
    kept
}

/// Precomputed state for scoring one needle against one haystack.
struct Correlator<'a> {
    haystack: &'a GrayImage,
    width: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    needle_w: u32,
    needle_h: u32,
    zero_mean: Vec<f64>,
    needle_mean: f64,
    needle_norm: f64,
}

impl<'a> Correlator<'a> {
    fn new(haystack: &'a GrayImage, needle: &GrayImage) -> Self {
        let (w, h) = haystack.dimensions();
        let stride = w as usize + 1;
        let mut sum = vec![0.0; stride * (h as usize + 1)];
        let mut sum_sq = vec![0.0; stride * (h as usize + 1)];
        for y in 0..h as usize {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w as usize {
                let v = f64::from(haystack.get_pixel(x as u32, y as u32)[0]);
                row += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
            }
        }

        let n = f64::from(needle.width() * needle.height());
        let needle_mean = needle.pixels().map(|p| f64::from(p[0])).sum::<f64>() / n;
        let zero_mean: Vec<f64> = needle.pixels().map(|p| f64::from(p[0]) - needle_mean).collect();
        let needle_norm = zero_mean.iter().map(|v| v * v).sum::<f64>().sqrt();

        Self {
            haystack,
            width: stride,
            sum,
            sum_sq,
            needle_w: needle.width(),
            needle_h: needle.height(),
            zero_mean,
            needle_mean,
            needle_norm,
        }
    }

    fn window(&self, table: &[f64], x: u32, y: u32) -> f64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + self.needle_w as usize, y0 + self.needle_h as usize);
        table[y1 * self.width + x1] - table[y0 * self.width + x1] - table[y1 * self.width + x0]
            + table[y0 * self.width + x0]
    }

    fn score(&self, x: u32, y: u32) -> f64 {
        let n = f64::from(self.needle_w * self.needle_h);
        let s = self.window(&self.sum, x, y);
        let variance = (self.window(&self.sum_sq, x, y) - s * s / n).max(0.0);

        if self.needle_norm < EPSILON {
            // Flat template: only flat windows of similar brightness match.
            if variance < EPSILON * n {
                return (1.0 - (s / n - self.needle_mean).abs() / 255.0).clamp(0.0, 1.0);
            }
            return 0.0;
        }
        if variance < EPSILON * n {
            return 0.0;
        }

        let mut cross = 0.0;
        let mut i = 0;
        for dy in 0..self.needle_h {
            for dx in 0..self.needle_w {
                cross += f64::from(self.haystack.get_pixel(x + dx, y + dy)[0]) * self.zero_mean[i];
                i += 1;
            }
        }
        (cross / (variance.sqrt() * self.needle_norm)).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// Smooth, non-periodic test scene.
    pub(crate) fn scene(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let (xf, yf) = (f64::from(x), f64::from(y));
            let v = 128.0
                + 50.0 * (xf * 0.11 + yf * 0.03).sin()
                + 40.0 * (yf * 0.17 - xf * 0.05).cos()
                + 30.0 * (xf * yf * 0.0009).sin();
            Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn finds_exact_crop_with_pyramid() {
        let hay = scene(200, 120);
        let needle = imageops::crop_imm(&hay, 37, 21, 32, 32).to_image();
        let hits = TemplateMatcher::default().find_matches(&hay, &needle, 0.9);
        let best = hits.first().expect("template should be found");
        assert_eq!((best.x, best.y), (37, 21));
        assert!(best.score > 0.999);
    }

    #[test]
    fn finds_small_template_at_full_resolution() {
        let hay = scene(200, 120);
        let needle = imageops::crop_imm(&hay, 100, 60, 12, 12).to_image();
        let hits = TemplateMatcher::default().find_matches(&hay, &needle, 0.99);
        assert_eq!((hits[0].x, hits[0].y), (100, 60));
    }

    #[test]
    fn foreign_template_is_not_found() {
        let hay = scene(200, 120);
        let checker = GrayImage::from_fn(32, 32, |x, y| {
            if ((x / 4) + (y / 4)) % 2 == 0 {
                Luma([0])
            } else {
                Luma([255])
            }
        });
        assert!(TemplateMatcher::default().find_matches(&hay, &checker, 0.9).is_empty());
    }

    #[test]
    fn oversized_template_yields_nothing() {
        let hay = scene(20, 20);
        let needle = scene(30, 10);
        assert!(TemplateMatcher::default().find_matches(&hay, &needle, 0.5).is_empty());
    }

    #[test]
    fn flat_template_matches_flat_region() {
        let mut hay = scene(60, 60);
        for y in 10..30 {
            for x in 10..30 {
                hay.put_pixel(x, y, Luma([200]));
            }
        }
        let needle = GrayImage::from_pixel(10, 10, Luma([200]));
        let hits = TemplateMatcher::default().find_matches(&hay, &needle, 0.99);
        assert!(!hits.is_empty());
        let r = Rect::new(10, 10, 20, 20);
        assert!(hits
            .iter()
            .all(|h| r.contains(crate::geometry::Point::new(h.x as i32, h.y as i32))));
    }
}
