//! Annotated debug snapshots of each detection attempt.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{Rgba, RgbaImage};

use crate::capture::ScreenFrame;
use crate::geometry::{PhysicalPoint, PhysicalRect};
use crate::matcher::MatchCandidate;

const CANDIDATE_COLOR: Rgba<u8> = Rgba([220, 40, 40, 255]);
const REGION_COLOR: Rgba<u8> = Rgba([40, 180, 60, 255]);
const CLICK_COLOR: Rgba<u8> = Rgba([250, 210, 40, 230]);

/// Writes an annotated copy of the frame per detection attempt: candidate
/// rects with confidence labels in red, derived text regions in green, the
/// accepted click point as a disc. Pure observer: every failure is swallowed
/// and logged at warn, and a `None` directory disables it entirely.
#[derive(Debug, Clone, Default)]
pub struct DebugRecorder {
    dir: Option<PathBuf>,
}

impl DebugRecorder {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn record(
        &self,
        frame: &ScreenFrame,
        candidates: &[MatchCandidate],
        regions: &[PhysicalRect],
        click: Option<PhysicalPoint>,
    ) {
        let Some(dir) = &self.dir else {
            return;
        };
        if let Err(err) = self.write_snapshot(dir, frame, candidates, regions, click) {
            log::warn!("debug snapshot failed: {err:#}");
        }
    }

    fn write_snapshot(
        &self,
        dir: &Path,
        frame: &ScreenFrame,
        candidates: &[MatchCandidate],
        regions: &[PhysicalRect],
        click: Option<PhysicalPoint>,
    ) -> Result<()> {
        let mut annotated = frame.image.clone();
        for candidate in candidates {
            draw_rect_outline(&mut annotated, candidate.rect, CANDIDATE_COLOR, 2);
            let label = format!("{} {:.2}", candidate.template, candidate.confidence);
            draw_bitmap_text(
                &mut annotated,
                candidate.rect.x,
                candidate.rect.y - 10,
                &label,
                CANDIDATE_COLOR,
            );
        }
        for region in regions {
            draw_rect_outline(&mut annotated, *region, REGION_COLOR, 2);
        }
        if let Some(point) = click {
            draw_disc(&mut annotated, point, 6, CLICK_COLOR);
        }

        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create debug dir: {}", dir.display()))?;
        let path = dir.join(format!("detect-{}.png", timestamp_compact()));
        annotated
            .save(&path)
            .with_context(|| format!("failed to save debug snapshot: {}", path.display()))?;
        log::debug!("debug snapshot written to {}", path.display());
        Ok(())
    }
}

fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S%3f").to_string()
}

fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = f64::from(src[3]) / 255.0;
    if a <= 0.0 {
        return dst;
    }
    let inv = 1.0 - a;
    let channel = |d: u8, s: u8| {
        (f64::from(d) * inv + f64::from(s) * a)
            .round()
            .clamp(0.0, 255.0) as u8
    };
    Rgba([
        channel(dst[0], src[0]),
        channel(dst[1], src[1]),
        channel(dst[2], src[2]),
        (f64::from(dst[3]) + f64::from(src[3]) * inv)
            .round()
            .clamp(0.0, 255.0) as u8,
    ])
}

fn draw_rect_outline(img: &mut RgbaImage, rect: PhysicalRect, color: Rgba<u8>, thickness: u32) {
    if rect.w == 0 || rect.h == 0 || img.width() == 0 || img.height() == 0 {
        return;
    }
    let max_x = img.width() as i32 - 1;
    let max_y = img.height() as i32 - 1;
    let x0 = rect.x.clamp(0, max_x);
    let y0 = rect.y.clamp(0, max_y);
    let x1 = (rect.right() - 1).clamp(0, max_x);
    let y1 = (rect.bottom() - 1).clamp(0, max_y);

    for t in 0..thickness.max(1) as i32 {
        let tx0 = (x0 - t).clamp(0, max_x);
        let ty0 = (y0 - t).clamp(0, max_y);
        let tx1 = (x1 + t).clamp(0, max_x);
        let ty1 = (y1 + t).clamp(0, max_y);
        for x in tx0..=tx1 {
            img.put_pixel(x as u32, ty0 as u32, color);
            img.put_pixel(x as u32, ty1 as u32, color);
        }
        for y in ty0..=ty1 {
            img.put_pixel(tx0 as u32, y as u32, color);
            img.put_pixel(tx1 as u32, y as u32, color);
        }
    }
}

fn draw_disc(img: &mut RgbaImage, center: PhysicalPoint, radius: i32, color: Rgba<u8>) {
    let r2 = radius * radius;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let x = center.x + dx;
            let y = center.y + dy;
            if x >= 0 && y >= 0 && x < img.width() as i32 && y < img.height() as i32 {
                let dst = *img.get_pixel(x as u32, y as u32);
                img.put_pixel(x as u32, y as u32, blend_pixel(dst, color));
            }
        }
    }
}

fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>) {
    let mut cursor_x = x;
    for ch in text.chars() {
        let glyph = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?'));
        let Some(glyph) = glyph else {
            cursor_x += 8;
            continue;
        };
        for (row_idx, row) in glyph.iter().enumerate() {
            for col_idx in 0..8 {
                if (*row >> col_idx) & 1 == 0 {
                    continue;
                }
                let px = cursor_x + col_idx;
                let py = y + row_idx as i32;
                if px >= 0 && py >= 0 && px < img.width() as i32 && py < img.height() as i32 {
                    let dst = *img.get_pixel(px as u32, py as u32);
                    img.put_pixel(px as u32, py as u32, blend_pixel(dst, color));
                }
            }
        }
        cursor_x += 8;
    }
}
