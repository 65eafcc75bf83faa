//! Deriving the chat-message text region that sits beside a matched avatar.

use serde::{Deserialize, Serialize};

use crate::geometry::PhysicalRect;
use crate::matcher::MatchCandidate;

/// Fixed geometry of the message block relative to a matched avatar, in
/// physical pixels. The defaults mirror the game's chat layout: the text
/// starts 10 px right of the avatar, aligned with its top, in a 420x222 box.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OffsetProfile {
    /// Gap between the avatar's right edge and the text area.
    pub offset_x: i32,
    pub width: u32,
    pub height: u32,
    /// Fraction of `height` added above and below (0.2 = 20% margin).
    pub vertical_margin: f64,
}

impl Default for OffsetProfile {
    fn default() -> Self {
        Self {
            offset_x: 10,
            width: 420,
            height: 222,
            vertical_margin: 0.0,
        }
    }
}

/// The area expected to contain the message associated with an avatar.
/// Physical space, clamped to the frame. Transient between extraction and
/// scoring.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TextRegion {
    pub rect: PhysicalRect,
}

/// Derives the text region for `candidate` inside a `frame_w` x `frame_h`
/// buffer. Returns `None` (no region, skip the candidate) when the derived
/// rectangle would lie entirely outside the frame; a partially off-frame
/// rectangle is clamped instead of degenerating.
pub fn derive_text_region(
    candidate: &MatchCandidate,
    profile: &OffsetProfile,
    frame_w: u32,
    frame_h: u32,
) -> Option<TextRegion> {
    let margin = (f64::from(profile.height) * profile.vertical_margin).round() as i32;
    let x = candidate.rect.right() + profile.offset_x;
    let y = candidate.rect.y - margin;
    let h = profile.height as i32 + 2 * margin;

    let x0 = x.max(0);
    let y0 = y.max(0);
    if x0 >= frame_w as i32 || y0 >= frame_h as i32 {
        return None;
    }
    let x1 = (x + profile.width as i32).min(frame_w as i32);
    let y1 = (y + h).min(frame_h as i32);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some(TextRegion {
        rect: PhysicalRect::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32),
    })
}
