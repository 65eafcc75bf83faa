//! Visual automation pilot.
//!
//! The core pipeline captures a screen region, locates UI elements and player
//! avatars via template matching, scores the chat text next to each avatar
//! against target keywords through an external vision model, and resolves the
//! accepted match into a click point in logical (click-target) coordinates —
//! correct even when the display's physical pixel grid is scaled (Retina-style
//! 2x, or fractional 1.5x).
//!
//! Coordinate spaces are tagged at the type level: anything measured on a
//! captured pixel buffer is physical, anything handed to the OS pointer is
//! logical. The only bridge between the two is [`geometry`].

pub mod capture;
pub mod config;
pub mod detect;
pub mod geometry;
pub mod matcher;
pub mod plan;
pub mod recorder;
pub mod region;
pub mod scorer;
pub mod template;
