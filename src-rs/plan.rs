//! Action plans: a closed set of scripted steps driving the pipeline.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use enigo::{Button, Coordinate, Direction, Enigo, Mouse};
use serde::{Deserialize, Serialize};

use crate::config::{NamedTarget, PilotConfig};
use crate::detect::{CancelFlag, Detector, Outcome};
use crate::geometry::LogicalPoint;
use crate::recorder::DebugRecorder;
use crate::scorer::{KeywordQuery, KeywordScorer};
use crate::template::TemplateLibrary;

/// One plan step. The action set is closed: an unknown `action` tag fails
/// deserialization instead of being carried as an opaque map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: ActionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    Click {
        target: ClickTarget,
    },
    Wait {
        duration_secs: f64,
    },
    OpenApp {
        app: String,
    },
    /// Find the avatar whose adjacent message mentions one of the keywords
    /// and click it. Empty `templates` means every template in the `avatar`
    /// category.
    AvatarKeywordClick {
        keywords: Vec<String>,
        #[serde(default)]
        templates: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },
}

/// Where a click step lands: a name from the coordinate registry, a literal
/// logical point, or a template located at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClickTarget {
    Named(String),
    Point(LogicalPoint),
    Template { template: String },
}

/// Issues OS-level clicks. Production goes through enigo; tests record.
pub trait ClickSink {
    fn click(&mut self, point: LogicalPoint) -> Result<()>;
}

pub struct EnigoSink {
    enigo: Enigo,
}

impl EnigoSink {
    pub fn new() -> Result<Self> {
        let enigo = Enigo::new(&enigo::Settings::default())
            .map_err(|err| anyhow!("failed to initialize input synthesis: {err}"))?;
        Ok(Self { enigo })
    }
}

impl ClickSink for EnigoSink {
    fn click(&mut self, point: LogicalPoint) -> Result<()> {
        self.enigo
            .move_mouse(point.x, point.y, Coordinate::Abs)
            .map_err(|err| anyhow!("failed to move pointer: {err}"))?;
        // Give the UI a beat to react to the hover before pressing.
        std::thread::sleep(Duration::from_millis(200));
        self.enigo
            .button(Button::Left, Direction::Click)
            .map_err(|err| anyhow!("failed to click: {err}"))?;
        Ok(())
    }
}

/// Runs a plan's steps in order, stopping at the first failure.
pub struct PlanExecutor<'a> {
    pub config: &'a PilotConfig,
    pub library: &'a TemplateLibrary,
    pub source: &'a dyn crate::capture::ScreenSource,
    pub scorer: Option<&'a dyn KeywordScorer>,
    pub recorder: Option<&'a DebugRecorder>,
}

impl<'a> PlanExecutor<'a> {
    pub fn run_plan(&self, name: &str, sink: &mut dyn ClickSink, cancel: &CancelFlag) -> Result<()> {
        let steps = self
            .config
            .plans
            .get(name)
            .with_context(|| format!("no plan named {name:?}"))?;
        self.run_steps(steps, sink, cancel)
    }

    pub fn run_steps(
        &self,
        steps: &[Step],
        sink: &mut dyn ClickSink,
        cancel: &CancelFlag,
    ) -> Result<()> {
        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                bail!("plan cancelled at step {}", index + 1);
            }
            let label = step.description.as_deref().unwrap_or("(unnamed)");
            log::info!("step {}: {label}", index + 1);
            self.run_step(step, sink, cancel)
                .with_context(|| format!("step {} ({label}) failed", index + 1))?;
        }
        Ok(())
    }

    fn run_step(&self, step: &Step, sink: &mut dyn ClickSink, cancel: &CancelFlag) -> Result<()> {
        match &step.kind {
            ActionKind::Click { target } => {
                let point = self.resolve_target(target, cancel)?;
                sink.click(point)
            }
            ActionKind::Wait { duration_secs } => wait_cancellable(*duration_secs, cancel),
            ActionKind::OpenApp { app } => self.open_app(app),
            ActionKind::AvatarKeywordClick {
                keywords,
                templates,
                confidence,
            } => {
                let query = KeywordQuery::new(
                    keywords.clone(),
                    confidence.unwrap_or(KeywordQuery::DEFAULT_MIN_CONFIDENCE),
                )?;
                let templates = if templates.is_empty() {
                    self.library.names_in_category("avatar")
                } else {
                    templates.clone()
                };
                if templates.is_empty() {
                    bail!("no avatar templates available");
                }
                let point = self.detect_click(&templates, Some(&query), cancel)?;
                sink.click(point)
            }
        }
    }

    fn resolve_target(&self, target: &ClickTarget, cancel: &CancelFlag) -> Result<LogicalPoint> {
        match target {
            ClickTarget::Point(point) => Ok(*point),
            ClickTarget::Template { template } => {
                self.detect_click(std::slice::from_ref(template), None, cancel)
            }
            ClickTarget::Named(name) => match self.config.coords.get(name) {
                Some(NamedTarget::Point(point)) => Ok(*point),
                Some(NamedTarget::Template { template }) => {
                    self.detect_click(std::slice::from_ref(template), None, cancel)
                }
                None => bail!("no configured coordinate named {name:?}"),
            },
        }
    }

    fn detect_click(
        &self,
        templates: &[String],
        query: Option<&KeywordQuery>,
        cancel: &CancelFlag,
    ) -> Result<LogicalPoint> {
        let mut detector = Detector::new(self.source, self.library);
        detector.scorer = self.scorer;
        detector.recorder = self.recorder;
        detector.capture_region = self.config.capture_region;
        detector.offsets = self.config.offsets;

        match detector.find_match(templates, query, self.config.min_confidence, cancel) {
            Outcome::Resolved(resolved) => Ok(resolved.point),
            Outcome::NotFound => bail!("no match for templates {templates:?}"),
            Outcome::Failed(err) => Err(err.into()),
            Outcome::Cancelled => bail!("detection cancelled"),
        }
    }

    fn open_app(&self, app: &str) -> Result<()> {
        let command = self
            .config
            .apps
            .get(app)
            .with_context(|| format!("no launch command configured for app {app:?}"))?;
        let (program, args) = command
            .split_first()
            .with_context(|| format!("empty launch command for app {app:?}"))?;
        std::process::Command::new(program)
            .args(args)
            .spawn()
            .with_context(|| format!("failed to launch {app:?}"))?;
        Ok(())
    }
}

/// Sleeps in short slices so a cancel request takes effect promptly.
fn wait_cancellable(duration_secs: f64, cancel: &CancelFlag) -> Result<()> {
    if !duration_secs.is_finite() || duration_secs < 0.0 {
        bail!("wait duration must be a non-negative number of seconds");
    }
    let mut remaining = Duration::from_secs_f64(duration_secs);
    let slice = Duration::from_millis(100);
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            bail!("wait cancelled");
        }
        let nap = remaining.min(slice);
        std::thread::sleep(nap);
        remaining -= nap;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureError, ScreenFrame, ScreenSource};
    use crate::geometry::LogicalRect;
    use crate::template::Template;
    use image::{Rgba, RgbaImage};
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSink {
        clicks: Vec<LogicalPoint>,
    }

    impl ClickSink for RecordingSink {
        fn click(&mut self, point: LogicalPoint) -> Result<()> {
            self.clicks.push(point);
            Ok(())
        }
    }

    struct FrameSource {
        frame: RefCell<Option<ScreenFrame>>,
    }

    impl ScreenSource for FrameSource {
        fn capture(&self, _region: Option<LogicalRect>) -> Result<ScreenFrame, CaptureError> {
            self.frame
                .borrow_mut()
                .take()
                .ok_or_else(|| CaptureError::Unavailable("no frame scripted".to_string()))
        }
    }

    fn config_with_coords() -> PilotConfig {
        let raw = r#"{
            "template_dir": "game_elements",
            "coords": { "menu": { "x": 100, "y": 40 } }
        }"#;
        serde_json::from_str(raw).unwrap()
    }

    fn empty_source() -> FrameSource {
        FrameSource {
            frame: RefCell::new(None),
        }
    }

    #[test]
    fn closed_action_set_rejects_unknown_actions() {
        let err = serde_json::from_str::<Step>(
            r#"{ "action": "reboot_host", "description": "nope" }"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn deserializes_every_action_kind() {
        let raw = r#"[
            { "action": "open_app", "app": "emulator" },
            { "action": "wait", "duration_secs": 1.5 },
            { "action": "click", "target": "menu", "description": "open menu" },
            { "action": "click", "target": { "x": 10, "y": 20 } },
            { "action": "click", "target": { "template": "play_button" } },
            { "action": "avatar_keyword_click", "keywords": ["320"] }
        ]"#;
        let steps: Vec<Step> = serde_json::from_str(raw).unwrap();
        assert_eq!(steps.len(), 6);
        assert!(matches!(
            &steps[2].kind,
            ActionKind::Click { target: ClickTarget::Named(name) } if name == "menu"
        ));
        assert!(matches!(
            &steps[3].kind,
            ActionKind::Click { target: ClickTarget::Point(LogicalPoint { x: 10, y: 20 }) }
        ));
        assert!(matches!(
            &steps[5].kind,
            ActionKind::AvatarKeywordClick { templates, confidence: None, .. }
                if templates.is_empty()
        ));
    }

    #[test]
    fn named_coordinate_click_goes_to_the_sink() {
        let config = config_with_coords();
        let library = TemplateLibrary::default();
        let source = empty_source();
        let executor = PlanExecutor {
            config: &config,
            library: &library,
            source: &source,
            scorer: None,
            recorder: None,
        };
        let steps: Vec<Step> = serde_json::from_str(
            r#"[{ "action": "click", "target": "menu" }]"#,
        )
        .unwrap();

        let mut sink = RecordingSink::default();
        executor
            .run_steps(&steps, &mut sink, &CancelFlag::new())
            .unwrap();
        assert_eq!(sink.clicks, vec![LogicalPoint { x: 100, y: 40 }]);
    }

    #[test]
    fn plan_stops_at_the_first_failing_step() {
        let config = config_with_coords();
        let library = TemplateLibrary::default();
        let source = empty_source();
        let executor = PlanExecutor {
            config: &config,
            library: &library,
            source: &source,
            scorer: None,
            recorder: None,
        };
        let steps: Vec<Step> = serde_json::from_str(
            r#"[
                { "action": "click", "target": "ghost" },
                { "action": "click", "target": "menu" }
            ]"#,
        )
        .unwrap();

        let mut sink = RecordingSink::default();
        let err = executor
            .run_steps(&steps, &mut sink, &CancelFlag::new())
            .unwrap_err();
        assert!(err.to_string().contains("step 1"), "{err:#}");
        assert!(sink.clicks.is_empty());
    }

    #[test]
    fn template_target_resolves_through_the_detector() {
        let mut tpl_img = RgbaImage::new(16, 16);
        for y in 0..16u32 {
            for x in 0..16u32 {
                let v = (((x * 37 + y * 11) % 71) + 100) as u8;
                tpl_img.put_pixel(x, y, Rgba([v, v, 255 - v, 255]));
            }
        }
        let template = Template {
            name: "play_button".to_string(),
            category: None,
            image: tpl_img.clone(),
        };
        let mut library = TemplateLibrary::default();
        library.insert(template).unwrap();

        let mut image = RgbaImage::from_pixel(120, 90, Rgba([20, 20, 20, 255]));
        for y in 0..16 {
            for x in 0..16 {
                image.put_pixel(60 + x, 30 + y, *tpl_img.get_pixel(x, y));
            }
        }
        let source = FrameSource {
            frame: RefCell::new(Some(ScreenFrame {
                image,
                scale: 1.0,
                region: LogicalRect::new(0, 0, 120, 90),
            })),
        };

        let config = config_with_coords();
        let executor = PlanExecutor {
            config: &config,
            library: &library,
            source: &source,
            scorer: None,
            recorder: None,
        };
        let steps: Vec<Step> = serde_json::from_str(
            r#"[{ "action": "click", "target": { "template": "play_button" } }]"#,
        )
        .unwrap();

        let mut sink = RecordingSink::default();
        executor
            .run_steps(&steps, &mut sink, &CancelFlag::new())
            .unwrap();
        assert_eq!(sink.clicks, vec![LogicalPoint { x: 68, y: 38 }]);
    }

    #[test]
    fn cancelled_wait_returns_promptly() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(wait_cancellable(10.0, &cancel).is_err());
    }

    #[test]
    fn negative_wait_is_rejected() {
        assert!(wait_cancellable(-1.0, &CancelFlag::new()).is_err());
        assert!(wait_cancellable(f64::NAN, &CancelFlag::new()).is_err());
    }
}
