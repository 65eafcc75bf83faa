//! Detection orchestration: capture, match, score, resolve.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::imageops;
use serde::Serialize;
use thiserror::Error;

use crate::capture::{CaptureError, ScreenFrame, ScreenSource};
use crate::geometry::{LogicalPoint, LogicalRect, PhysicalPoint, PhysicalRect};
use crate::matcher::{find_matches, MatchCandidate};
use crate::recorder::DebugRecorder;
use crate::region::{derive_text_region, OffsetProfile};
use crate::scorer::{KeywordQuery, KeywordScorer, ScoreError, ScoreVerdict};
use crate::template::TemplateLibrary;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    /// A requested template name is not in the library. Configuration error,
    /// surfaced rather than silently matching nothing.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
}

/// The one artifact that crosses back out of the pipeline: a click point in
/// logical screen coordinates plus the evidence that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedClick {
    pub point: LogicalPoint,
    pub candidate: MatchCandidate,
    pub verdict: Option<ScoreVerdict>,
}

/// Terminal state of one detection invocation. `NotFound` is a normal
/// outcome, not an error; `Failed` carries the taxonomy.
#[derive(Debug)]
pub enum Outcome {
    Resolved(ResolvedClick),
    NotFound,
    Failed(DetectError),
    Cancelled,
}

/// Cooperative cancellation handle, checked between pipeline stages and
/// before each scoring call. An in-flight HTTP request is bounded by the
/// scorer's own timeout rather than interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Single-invocation detection driver. Borrowed collaborators keep the
/// detector cheap to construct per call; the library and recorder outlive it.
pub struct Detector<'a> {
    pub source: &'a dyn ScreenSource,
    pub library: &'a TemplateLibrary,
    pub scorer: Option<&'a dyn KeywordScorer>,
    pub recorder: Option<&'a DebugRecorder>,
    /// Logical region to capture; full screen when `None`.
    pub capture_region: Option<LogicalRect>,
    pub offsets: OffsetProfile,
}

impl<'a> Detector<'a> {
    pub fn new(source: &'a dyn ScreenSource, library: &'a TemplateLibrary) -> Self {
        Self {
            source,
            library,
            scorer: None,
            recorder: None,
            capture_region: None,
            offsets: OffsetProfile::default(),
        }
    }

    /// Runs one full detection pass.
    ///
    /// Templates are matched in the order given (caller priority); all
    /// candidates land in one pool sorted by descending confidence, with
    /// overlapping detections of the same element by different templates
    /// collapsed to the highest-confidence one. Without a query, the best
    /// candidate resolves immediately. With a query, candidates are scored
    /// lazily best-first and the first accepting verdict wins, so the
    /// expensive scorer runs exactly once in the common case. Per-candidate
    /// region or scoring failures skip that candidate and never abort the
    /// run.
    pub fn find_match(
        &self,
        template_names: &[String],
        query: Option<&KeywordQuery>,
        min_confidence: f64,
        cancel: &CancelFlag,
    ) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let frame = match self.source.capture(self.capture_region) {
            Ok(frame) => frame,
            Err(err) => return Outcome::Failed(err.into()),
        };

        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let mut pool = Vec::new();
        for name in template_names {
            let Some(template) = self.library.get(name) else {
                return Outcome::Failed(DetectError::UnknownTemplate(name.clone()));
            };
            pool.extend(find_matches(&frame.image, template, min_confidence));
        }
        let pool = collapse_duplicates(pool);
        log::debug!(
            "{} candidate(s) across {} template(s)",
            pool.len(),
            template_names.len()
        );

        let mut regions: Vec<PhysicalRect> = Vec::new();
        let outcome = self.resolve(&frame, &pool, query, cancel, &mut regions);
        let click = match &outcome {
            Outcome::Resolved(resolved) => Some(resolved.candidate.rect.center()),
            _ => None,
        };
        if let Some(recorder) = self.recorder {
            recorder.record(&frame, &pool, &regions, click);
        }
        outcome
    }

    fn resolve(
        &self,
        frame: &ScreenFrame,
        pool: &[MatchCandidate],
        query: Option<&KeywordQuery>,
        cancel: &CancelFlag,
        regions: &mut Vec<PhysicalRect>,
    ) -> Outcome {
        let Some(query) = query else {
            return match pool.first() {
                Some(best) => Outcome::Resolved(self.resolved(frame, best, None)),
                None => Outcome::NotFound,
            };
        };

        let Some(scorer) = self.scorer else {
            log::warn!("keyword query given but no scorer configured");
            return Outcome::NotFound;
        };

        for candidate in pool {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            let Some(region) = derive_text_region(
                candidate,
                &self.offsets,
                frame.image.width(),
                frame.image.height(),
            ) else {
                log::debug!(
                    "candidate {} at ({}, {}) has no text region, skipping",
                    candidate.template,
                    candidate.rect.x,
                    candidate.rect.y
                );
                continue;
            };
            regions.push(region.rect);

            let crop = imageops::crop_imm(
                &frame.image,
                region.rect.x as u32,
                region.rect.y as u32,
                region.rect.w,
                region.rect.h,
            )
            .to_image();
            match scorer.score(&crop, query) {
                Ok(verdict) if verdict.accepts(query) => {
                    log::info!(
                        "candidate {} accepted at confidence {:.2}",
                        candidate.template,
                        verdict.confidence
                    );
                    return Outcome::Resolved(self.resolved(frame, candidate, Some(verdict)));
                }
                Ok(verdict) => {
                    log::debug!(
                        "candidate {} rejected (matched={}, confidence {:.2})",
                        candidate.template,
                        verdict.matched,
                        verdict.confidence
                    );
                }
                Err(err @ ScoreError::Unavailable(_)) => {
                    log::warn!("scorer unreachable for {}: {err}", candidate.template);
                }
                Err(err @ ScoreError::MalformedResponse(_)) => {
                    log::warn!("scorer reply unusable for {}: {err}", candidate.template);
                }
            }
        }
        Outcome::NotFound
    }

    fn resolved(
        &self,
        frame: &ScreenFrame,
        candidate: &MatchCandidate,
        verdict: Option<ScoreVerdict>,
    ) -> ResolvedClick {
        ResolvedClick {
            point: frame.to_screen_logical(candidate.rect.center()),
            candidate: candidate.clone(),
            verdict,
        }
    }
}

/// Different templates sometimes fire on the same on-screen element. Keep the
/// highest-confidence detection of each spot; ties fall back to raster order.
fn collapse_duplicates(mut pool: Vec<MatchCandidate>) -> Vec<MatchCandidate> {
    pool.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| (a.rect.y, a.rect.x).cmp(&(b.rect.y, b.rect.x)))
    });
    let mut kept: Vec<MatchCandidate> = Vec::new();
    for candidate in pool {
        let duplicate = kept.iter().any(|k| centers_close(&k.rect, &candidate.rect));
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

fn centers_close(a: &PhysicalRect, b: &PhysicalRect) -> bool {
    let threshold = (a.w.min(a.h).min(b.w).min(b.h) / 2).max(1) as i32;
    let ca: PhysicalPoint = a.center();
    let cb: PhysicalPoint = b.center();
    (ca.x - cb.x).abs() < threshold && (ca.y - cb.y).abs() < threshold
}
