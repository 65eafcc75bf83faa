//! Template matching via normalized cross-correlation.

use std::collections::BTreeMap;

use image::RgbaImage;
use serde::Serialize;

use crate::geometry::PhysicalRect;
use crate::template::Template;

/// One located occurrence of a template within a frame. The rectangle is in
/// physical pixel space, relative to the frame buffer's origin. Confidence is
/// the clamped correlation score in [0, 1] and must always be checked against
/// a caller-supplied threshold before the candidate is treated as a hit.
#[derive(Debug, Clone, Serialize)]
pub struct MatchCandidate {
    pub template: String,
    pub rect: PhysicalRect,
    pub confidence: f64,
}

// Stride prescan kicks in above this template extent; below it, every offset
// is scored at full resolution.
const COARSE_MIN_EXTENT: u32 = 32;

/// Locates `template` inside `frame`, best-first.
///
/// Zero-mean normalized cross-correlation is evaluated on grayscale, at every
/// integer offset for small templates and via a strided prescan plus
/// full-resolution refinement of peak neighborhoods for large ones. Only
/// local maxima at or above `min_confidence` survive; weaker maxima within
/// half the template's width and height of a stronger one are suppressed so
/// one visual element yields one candidate. A template larger than the frame,
/// or nothing clearing the threshold, yields an empty list — not an error.
///
/// Equal-confidence ties resolve to the first maximum in raster scan order.
/// That ordering is deterministic but arbitrary; callers needing a specific
/// tie-break must disambiguate via geometry.
pub fn find_matches(
    frame: &RgbaImage,
    template: &Template,
    min_confidence: f64,
) -> Vec<MatchCandidate> {
    let (fw, fh) = frame.dimensions();
    let (tw, th) = template.image.dimensions();
    if tw == 0 || th == 0 || tw > fw || th > fh {
        return Vec::new();
    }

    let frame_gray = to_gray(frame);
    let tpl_gray = to_gray(&template.image);
    let Some(tpl) = TemplateStats::compute(&tpl_gray) else {
        // A flat template correlates with nothing meaningfully.
        log::debug!("template {} has zero variance, skipping", template.name);
        return Vec::new();
    };

    let max_x = fw - tw;
    let max_y = fh - th;
    let step = (tw.min(th) / 16).max(1);
    let coarse = tw.min(th) >= COARSE_MIN_EXTENT && step > 1;

    // (y, x) -> score, raster-ordered so tie-breaks stay deterministic.
    let mut scored: BTreeMap<(u32, u32), f64> = BTreeMap::new();

    if !coarse {
        for y in 0..=max_y {
            for x in 0..=max_x {
                let score = ncc_at(&frame_gray, fw, &tpl, tw, th, x, y);
                if score >= min_confidence {
                    scored.insert((y, x), score);
                }
            }
        }
    } else {
        // Coarse pass with a lowered floor so a peak straddling the stride
        // grid is not lost, then exact rescan of each seed's neighborhood.
        let floor = (min_confidence - 0.15).max(0.0);
        let mut seeds = Vec::new();
        let mut y = 0;
        while y <= max_y {
            let mut x = 0;
            while x <= max_x {
                if ncc_at(&frame_gray, fw, &tpl, tw, th, x, y) >= floor {
                    seeds.push((x, y));
                }
                x += step;
            }
            y += step;
        }
        for (sx, sy) in seeds {
            let x0 = sx.saturating_sub(step);
            let y0 = sy.saturating_sub(step);
            let x1 = (sx + step).min(max_x);
            let y1 = (sy + step).min(max_y);
            for y in y0..=y1 {
                for x in x0..=x1 {
                    if scored.contains_key(&(y, x)) {
                        continue;
                    }
                    let score = ncc_at(&frame_gray, fw, &tpl, tw, th, x, y);
                    if score >= min_confidence {
                        scored.insert((y, x), score);
                    }
                }
            }
        }
    }

    suppress_non_maxima(scored, template, tw, th)
}

/// Greedy non-max suppression: strongest first (raster order on ties), each
/// accepted candidate shadows anything within half the template extent.
fn suppress_non_maxima(
    scored: BTreeMap<(u32, u32), f64>,
    template: &Template,
    tw: u32,
    th: u32,
) -> Vec<MatchCandidate> {
    let mut ordered: Vec<((u32, u32), f64)> = scored.into_iter().collect();
    ordered.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let half_w = (tw / 2).max(1) as i64;
    let half_h = (th / 2).max(1) as i64;
    let mut kept: Vec<MatchCandidate> = Vec::new();
    for ((y, x), score) in ordered {
        let shadowed = kept.iter().any(|c| {
            (i64::from(x as i32) - i64::from(c.rect.x)).abs() < half_w
                && (i64::from(y as i32) - i64::from(c.rect.y)).abs() < half_h
        });
        if shadowed {
            continue;
        }
        kept.push(MatchCandidate {
            template: template.name.clone(),
            rect: PhysicalRect::new(x as i32, y as i32, tw, th),
            confidence: score,
        });
    }
    kept
}

struct TemplateStats {
    deviations: Vec<f64>,
    norm: f64,
}

impl TemplateStats {
    fn compute(gray: &[f64]) -> Option<Self> {
        let mean = gray.iter().sum::<f64>() / gray.len() as f64;
        let deviations: Vec<f64> = gray.iter().map(|v| v - mean).collect();
        let norm = deviations.iter().map(|d| d * d).sum::<f64>().sqrt();
        if norm < 1e-6 {
            None
        } else {
            Some(Self { deviations, norm })
        }
    }
}

fn ncc_at(
    frame_gray: &[f64],
    frame_w: u32,
    tpl: &TemplateStats,
    tw: u32,
    th: u32,
    x: u32,
    y: u32,
) -> f64 {
    let area = (tw * th) as f64;

    let mut patch_sum = 0.0;
    for ty in 0..th {
        let row = ((y + ty) * frame_w + x) as usize;
        for tx in 0..tw as usize {
            patch_sum += frame_gray[row + tx];
        }
    }
    let patch_mean = patch_sum / area;

    let mut cross = 0.0;
    let mut patch_sq = 0.0;
    for ty in 0..th {
        let row = ((y + ty) * frame_w + x) as usize;
        let tpl_row = (ty * tw) as usize;
        for tx in 0..tw as usize {
            let dev = frame_gray[row + tx] - patch_mean;
            cross += dev * tpl.deviations[tpl_row + tx];
            patch_sq += dev * dev;
        }
    }

    let patch_norm = patch_sq.sqrt();
    if patch_norm < 1e-6 {
        return 0.0;
    }
    (cross / (patch_norm * tpl.norm)).clamp(0.0, 1.0)
}

fn to_gray(image: &RgbaImage) -> Vec<f64> {
    image
        .pixels()
        .map(|p| {
            0.2126 * f64::from(p[0]) + 0.7152 * f64::from(p[1]) + 0.0722 * f64::from(p[2])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn patterned_template(name: &str, w: u32, h: u32) -> Template {
        let mut img = RgbaImage::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let v = (((x * 31 + y * 17) % 97) + 80) as u8;
                img.put_pixel(x, y, Rgba([v, v / 2, 255 - v, 255]));
            }
        }
        Template {
            name: name.to_string(),
            category: None,
            image: img,
        }
    }

    fn paste(frame: &mut RgbaImage, src: &RgbaImage, ox: u32, oy: u32) {
        for y in 0..src.height() {
            for x in 0..src.width() {
                frame.put_pixel(ox + x, oy + y, *src.get_pixel(x, y));
            }
        }
    }

    fn gray_frame(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([40, 40, 40, 255]))
    }

    #[test]
    fn finds_exact_instance_with_full_confidence() {
        let template = patterned_template("probe", 12, 12);
        let mut frame = gray_frame(120, 80);
        paste(&mut frame, &template.image, 30, 22);

        let matches = find_matches(&frame, &template, 0.9);
        assert_eq!(matches.len(), 1);
        let top = &matches[0];
        assert_eq!((top.rect.x, top.rect.y), (30, 22));
        assert!(top.confidence > 0.99, "confidence {}", top.confidence);
    }

    #[test]
    fn two_separated_instances_yield_exactly_two_candidates() {
        let template = patterned_template("probe", 12, 12);
        let mut frame = gray_frame(160, 90);
        paste(&mut frame, &template.image, 10, 20);
        paste(&mut frame, &template.image, 100, 55);

        let matches = find_matches(&frame, &template, 0.9);
        assert_eq!(matches.len(), 2);
        let mut at: Vec<(i32, i32)> = matches.iter().map(|m| (m.rect.x, m.rect.y)).collect();
        at.sort();
        assert_eq!(at, vec![(10, 20), (100, 55)]);
    }

    #[test]
    fn raising_threshold_never_increases_matches() {
        let template = patterned_template("probe", 12, 12);
        let mut frame = gray_frame(160, 90);
        paste(&mut frame, &template.image, 10, 20);
        paste(&mut frame, &template.image, 100, 55);

        let mut previous = usize::MAX;
        for threshold in [0.2, 0.5, 0.8, 0.95, 0.999] {
            let count = find_matches(&frame, &template, threshold).len();
            assert!(
                count <= previous,
                "count rose from {previous} to {count} at threshold {threshold}"
            );
            previous = count;
        }
    }

    #[test]
    fn template_larger_than_frame_is_empty_not_error() {
        let template = patterned_template("big", 64, 64);
        let frame = gray_frame(32, 32);
        assert!(find_matches(&frame, &template, 0.5).is_empty());
    }

    #[test]
    fn noise_frame_clears_no_reasonable_threshold() {
        let template = patterned_template("probe", 12, 12);
        let mut rng = StdRng::seed_from_u64(7);
        let mut frame = RgbaImage::new(100, 70);
        for pixel in frame.pixels_mut() {
            let v: u8 = rng.gen();
            *pixel = Rgba([v, rng.gen(), rng.gen(), 255]);
        }
        assert!(find_matches(&frame, &template, 0.8).is_empty());
    }

    #[test]
    fn flat_template_matches_nothing() {
        let template = Template {
            name: "flat".to_string(),
            category: None,
            image: RgbaImage::from_pixel(8, 8, Rgba([90, 90, 90, 255])),
        };
        let frame = gray_frame(64, 64);
        assert!(find_matches(&frame, &template, 0.1).is_empty());
    }

    #[test]
    fn coarse_path_still_pins_the_exact_offset() {
        // Large templates take the strided prescan. Real UI art is smooth, so
        // a radial gradient stands in for it here.
        let mut img = RgbaImage::new(48, 48);
        for y in 0..48i32 {
            for x in 0..48i32 {
                let d = (((x - 24).pow(2) + (y - 24).pow(2)) as f64).sqrt();
                let v = (d * 6.0).min(255.0) as u8;
                img.put_pixel(x as u32, y as u32, Rgba([v, v, 255 - v, 255]));
            }
        }
        let template = Template {
            name: "large".to_string(),
            category: None,
            image: img,
        };
        let mut frame = gray_frame(300, 200);
        paste(&mut frame, &template.image, 123, 77);

        let matches = find_matches(&frame, &template, 0.9);
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].rect.x, matches[0].rect.y), (123, 77));
    }
}
