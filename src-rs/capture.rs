//! Screen capture and scale-factor inference.

use image::{imageops, RgbaImage};
use thiserror::Error;

use crate::geometry::{LogicalPoint, LogicalRect, PhysicalPoint};

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The underlying capture call was denied (typically a missing screen
    /// recording permission) or produced an unusable buffer. Fatal to the
    /// current detection attempt; retry policy belongs to the caller.
    #[error("screen capture unavailable: {0}")]
    Unavailable(String),
}

/// One captured raster plus the logical->physical scale factor in effect and
/// the logical rectangle the buffer covers. Immutable for its lifetime; a
/// detection invocation owns exactly one.
#[derive(Debug, Clone)]
pub struct ScreenFrame {
    pub image: RgbaImage,
    pub scale: f64,
    pub region: LogicalRect,
}

impl ScreenFrame {
    /// Maps a point measured on this frame's pixel buffer to the logical
    /// screen coordinate it corresponds to.
    pub fn to_screen_logical(&self, point: PhysicalPoint) -> LogicalPoint {
        let local = point.to_logical(self.scale);
        LogicalPoint {
            x: self.region.x + local.x,
            y: self.region.y + local.y,
        }
    }
}

/// Source of screen frames. The production implementation talks to the OS;
/// tests substitute canned frames.
pub trait ScreenSource {
    /// Captures `region` (logical coordinates), or the full screen when
    /// `None`. The returned frame's scale factor is consistent for the
    /// frame's whole lifetime.
    fn capture(&self, region: Option<LogicalRect>) -> Result<ScreenFrame, CaptureError>;
}

/// xcap-backed source reading the primary monitor. Captures the full screen
/// once and crops the physical sub-rectangle itself, so regional captures
/// cannot disagree with the inferred scale.
pub struct MonitorSource;

impl ScreenSource for MonitorSource {
    fn capture(&self, region: Option<LogicalRect>) -> Result<ScreenFrame, CaptureError> {
        let unavailable = |err: xcap::XCapError| CaptureError::Unavailable(err.to_string());
        let monitors = xcap::Monitor::all().map_err(unavailable)?;
        let monitor = monitors
            .first()
            .ok_or_else(|| CaptureError::Unavailable("no monitors found".to_string()))?;
        let image = monitor.capture_image().map_err(unavailable)?;
        if image.width() == 0 || image.height() == 0 {
            return Err(CaptureError::Unavailable("empty capture buffer".to_string()));
        }

        let logical_w = monitor.width().map_err(unavailable)?;
        let logical_h = monitor.height().map_err(unavailable)?;
        let reported = monitor
            .scale_factor()
            .map(f64::from)
            .unwrap_or(1.0);
        let scale = infer_scale(image.width(), logical_w, reported);
        let full = LogicalRect::new(0, 0, logical_w, logical_h);

        let Some(region) = region else {
            return Ok(ScreenFrame {
                image,
                scale,
                region: full,
            });
        };

        let physical = region.to_physical(scale);
        let x0 = physical.x.max(0) as u32;
        let y0 = physical.y.max(0) as u32;
        if x0 >= image.width() || y0 >= image.height() || physical.w == 0 || physical.h == 0 {
            return Err(CaptureError::Unavailable(format!(
                "capture region {region:?} lies outside the screen"
            )));
        }
        let w = physical.w.min(image.width() - x0);
        let h = physical.h.min(image.height() - y0);
        let cropped = imageops::crop_imm(&image, x0, y0, w, h).to_image();

        Ok(ScreenFrame {
            image: cropped,
            scale,
            region,
        })
    }
}

/// Derives the scale factor from the buffer/logical width ratio, snapped to
/// the nearest representable scale (multiples of 0.5, commonly 1 or 2). Falls
/// back to the monitor-reported factor when the ratio is unusable.
pub fn infer_scale(buffer_w: u32, logical_w: u32, reported: f64) -> f64 {
    if logical_w == 0 {
        return reported.max(1.0);
    }
    let ratio = f64::from(buffer_w) / f64::from(logical_w);
    let snapped = (ratio * 2.0).round() / 2.0;
    if snapped <= 0.0 {
        reported.max(1.0)
    } else {
        snapped
    }
}
