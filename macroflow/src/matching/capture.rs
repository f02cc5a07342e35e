//! Live screen capture through xcap.

use image::RgbaImage;
use tracing::debug;

use super::screen::{crop_to_region, Capture, ScreenSource};
use crate::errors::BackendUnavailableError;
use crate::geometry::{Point, Rect};

/// Captures the monitor containing the requested region (or the primary monitor).
#[derive(Debug, Clone, Copy, Default)]
pub struct XcapScreen;

impl XcapScreen {
    pub fn new() -> Self {
        Self
    }
}

struct MonitorFrame {
    origin: Point,
    image: RgbaImage,
}

fn grab_monitor(region: Option<Rect>) -> Result<MonitorFrame, BackendUnavailableError> {
    let monitors = xcap::Monitor::all()
        .map_err(|e| BackendUnavailableError(format!("Failed to enumerate monitors: {e}")))?;

    let mut fallback = None;
    for monitor in monitors {
        let x = monitor
            .x()
            .map_err(|e| BackendUnavailableError(format!("Failed to get monitor x: {e}")))?;
        let y = monitor
            .y()
            .map_err(|e| BackendUnavailableError(format!("Failed to get monitor y: {e}")))?;
        let width = monitor
            .width()
            .map_err(|e| BackendUnavailableError(format!("Failed to get monitor width: {e}")))?;
        let height = monitor
            .height()
            .map_err(|e| BackendUnavailableError(format!("Failed to get monitor height: {e}")))?;
        let bounds = Rect::new(x, y, width, height);

        let wanted = match region {
            Some(r) => bounds.contains(Point::new(r.x, r.y)),
            None => monitor.is_primary().unwrap_or(false),
        };
        if wanted {
            fallback = Some((monitor, bounds));
            break;
        }
        if fallback.is_none() {
            fallback = Some((monitor, bounds));
        }
    }

    let (monitor, bounds) =
        fallback.ok_or_else(|| BackendUnavailableError("No monitor found".to_string()))?;
    debug!("Capturing monitor at {:?}", bounds);
    let image = monitor
        .capture_image()
        .map_err(|e| BackendUnavailableError(format!("Failed to capture monitor: {e}")))?;
    Ok(MonitorFrame {
        origin: Point::new(bounds.x, bounds.y),
        image,
    })
}

impl ScreenSource for XcapScreen {
    fn capture(&self, region: Option<Rect>) -> Result<Option<Capture>, BackendUnavailableError> {
        let frame = grab_monitor(region)?;
        Ok(crop_to_region(&frame.image, frame.origin, region))
    }
}
