//! Coordinate spaces and the logical/physical transform.
//!
//! Logical coordinates are what the OS uses for click targeting; physical
//! coordinates index the captured pixel buffer. On HiDPI displays the two
//! differ by the scale factor, and mixing them up moves every click by that
//! factor — so rectangles and points carry their space in the type.

use serde::{Deserialize, Serialize};

/// A point in logical (click-target) space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPoint {
    pub x: i32,
    pub y: i32,
}

/// A point in physical (pixel-buffer) space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalPoint {
    pub x: i32,
    pub y: i32,
}

/// A rectangle in logical space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

/// A rectangle in physical space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalRect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl LogicalRect {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Logical rect spanning two corner points, pyautogui-style.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        let x = x1.min(x2);
        let y = y1.min(y2);
        Self {
            x,
            y,
            w: (x1.max(x2) - x) as u32,
            h: (y1.max(y2) - y) as u32,
        }
    }

    pub fn to_physical(&self, scale: f64) -> PhysicalRect {
        PhysicalRect {
            x: scale_round(self.x, scale),
            y: scale_round(self.y, scale),
            w: scale_round_u(self.w, scale),
            h: scale_round_u(self.h, scale),
        }
    }
}

impl PhysicalRect {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Converts to logical space, truncating toward the top-left origin so the
    /// resulting click target stays inside the matched element instead of
    /// drifting past its edge.
    pub fn to_logical(&self, scale: f64) -> LogicalRect {
        LogicalRect {
            x: scale_floor(self.x, scale),
            y: scale_floor(self.y, scale),
            w: scale_floor_u(self.w, scale),
            h: scale_floor_u(self.h, scale),
        }
    }

    pub fn center(&self) -> PhysicalPoint {
        PhysicalPoint {
            x: self.x + (self.w / 2) as i32,
            y: self.y + (self.h / 2) as i32,
        }
    }

    pub fn right(&self) -> i32 {
        self.x + self.w as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h as i32
    }
}

impl PhysicalPoint {
    pub fn to_logical(&self, scale: f64) -> LogicalPoint {
        LogicalPoint {
            x: scale_floor(self.x, scale),
            y: scale_floor(self.y, scale),
        }
    }
}

impl LogicalPoint {
    pub fn to_physical(&self, scale: f64) -> PhysicalPoint {
        PhysicalPoint {
            x: scale_round(self.x, scale),
            y: scale_round(self.y, scale),
        }
    }
}

fn scale_floor(v: i32, scale: f64) -> i32 {
    (f64::from(v) / scale).floor() as i32
}

fn scale_floor_u(v: u32, scale: f64) -> u32 {
    (f64::from(v) / scale).floor().max(0.0) as u32
}

fn scale_round(v: i32, scale: f64) -> i32 {
    (f64::from(v) * scale).round() as i32
}

fn scale_round_u(v: u32, scale: f64) -> u32 {
    (f64::from(v) * scale).round().max(0.0) as u32
}
