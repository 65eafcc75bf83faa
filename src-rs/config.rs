//! Pilot configuration, loaded once from JSON and passed around immutably.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::geometry::{LogicalPoint, LogicalRect};
use crate::plan::Step;
use crate::region::OffsetProfile;

/// Everything the pipeline needs to run, resolved at startup. There is no
/// global mutable state; callers hold a `PilotConfig` and pass it down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PilotConfig {
    /// Directory of template images, one-level category subdirs allowed.
    pub template_dir: PathBuf,
    /// Logical screen rectangle to capture, typically the chat area. Full
    /// screen when absent.
    #[serde(default)]
    pub capture_region: Option<LogicalRect>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub offsets: OffsetProfile,
    #[serde(default)]
    pub scorer: ScorerConfig,
    /// Directory for annotated debug snapshots; disabled when absent.
    #[serde(default)]
    pub debug_dir: Option<PathBuf>,
    /// Named click targets usable from plans.
    #[serde(default)]
    pub coords: BTreeMap<String, NamedTarget>,
    /// Commands used by `open_app` steps, keyed by app name.
    #[serde(default)]
    pub apps: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub plans: BTreeMap<String, Vec<Step>>,
}

/// Vision-scorer endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ScorerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A named target from the coordinate registry: either a literal logical
/// point or a template resolved through the detector at click time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NamedTarget {
    Point(LogicalPoint),
    Template { template: String },
}

impl PilotConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            bail!(
                "min_confidence must be within [0, 1], got {}",
                self.min_confidence
            );
        }
        // The scorer call is synchronous; an unbounded timeout would hang a
        // detection invocation indefinitely.
        if !(10..=30).contains(&self.scorer.timeout_secs) {
            bail!(
                "scorer timeout_secs must be within [10, 30], got {}",
                self.scorer.timeout_secs
            );
        }
        Ok(())
    }
}

fn default_min_confidence() -> f64 {
    0.8
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pilot.json");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let (_dir, path) = write_config(r#"{ "template_dir": "game_elements" }"#);
        let config = PilotConfig::load(&path).unwrap();
        assert_eq!(config.min_confidence, 0.8);
        assert_eq!(config.scorer.timeout_secs, 30);
        assert_eq!(config.scorer.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.offsets.width, 420);
        assert!(config.capture_region.is_none());
        assert!(config.plans.is_empty());
    }

    #[test]
    fn full_config_round_trips() {
        let (_dir, path) = write_config(
            r#"{
                "template_dir": "game_elements",
                "capture_region": { "x": 660, "y": 145, "w": 275, "h": 351 },
                "min_confidence": 0.85,
                "debug_dir": "debug_out",
                "scorer": { "model": "gpt-4o-mini", "timeout_secs": 15 },
                "coords": {
                    "menu": { "x": 100, "y": 40 },
                    "play": { "template": "play_button" }
                },
                "apps": { "emulator": ["open", "-a", "Emulator"] }
            }"#,
        );
        let config = PilotConfig::load(&path).unwrap();
        assert_eq!(
            config.capture_region,
            Some(LogicalRect::new(660, 145, 275, 351))
        );
        assert_eq!(config.scorer.model, "gpt-4o-mini");
        assert_eq!(config.scorer.timeout_secs, 15);
        assert!(matches!(
            config.coords.get("menu"),
            Some(NamedTarget::Point(LogicalPoint { x: 100, y: 40 }))
        ));
        assert!(matches!(
            config.coords.get("play"),
            Some(NamedTarget::Template { template }) if template == "play_button"
        ));
        assert_eq!(config.apps["emulator"][0], "open");
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let (_dir, path) =
            write_config(r#"{ "template_dir": "t", "min_confidence": 1.2 }"#);
        assert!(PilotConfig::load(&path).is_err());

        let (_dir, path) =
            write_config(r#"{ "template_dir": "t", "scorer": { "timeout_secs": 5 } }"#);
        assert!(PilotConfig::load(&path).is_err());
    }
}
