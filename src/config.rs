// src/config.rs - Application configuration, read from the environment (and `.env`)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::advisor::GeminiConfig;
use crate::controller::{ControllerConfig, StaleResultPolicy};
use crate::mediapipe_bridge::{BridgeTimeouts, MediaPipeBridge};
use crate::pose::{LandmarkSource, SimulatedPoseSource};
use crate::video::CaptureFormat;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoseSourceKind {
    /// Built-in simulated figure.
    Simulated,
    /// External MediaPipe helper started with this command line.
    Bridge {
        command: String,
        timeouts: BridgeTimeouts,
    },
}

impl PoseSourceKind {
    pub fn build(&self) -> Box<dyn LandmarkSource> {
        match self {
            PoseSourceKind::Simulated => Box::new(SimulatedPoseSource::new()),
            PoseSourceKind::Bridge { command, timeouts } => {
                Box::new(MediaPipeBridge::new(command).with_timeouts(*timeouts))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub camera_index: u32,
    pub capture: CaptureFormat,
    pub pose_source: PoseSourceKind,
    pub controller: ControllerConfig,
    pub advisor: GeminiConfig,
    /// Starting directory of the model file picker.
    pub model_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            capture: CaptureFormat::default(),
            pose_source: PoseSourceKind::Simulated,
            controller: ControllerConfig::default(),
            advisor: GeminiConfig::default(),
            model_dir: default_model_dir(),
        }
    }
}

fn default_model_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.document_dir().map(|p| p.join("VirtualDresser")))
        .unwrap_or_else(|| PathBuf::from("./models"))
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Whole milliseconds, never zero.
fn millis_or(value: Option<String>, default: Duration) -> Duration {
    Duration::from_millis(parse_or(value, default.as_millis() as u64).max(1))
}

impl StaleResultPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "apply" => Some(Self::Apply),
            "discard_after_disable" => Some(Self::DiscardAfterDisable),
            "discard_on_model_change" => Some(Self::DiscardOnModelChange),
            _ => None,
        }
    }
}

impl AppConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let capture = CaptureFormat {
            width: parse_or(lookup("FRAME_WIDTH"), defaults.capture.width),
            height: parse_or(lookup("FRAME_HEIGHT"), defaults.capture.height),
            fps: parse_or(lookup("CAMERA_FPS"), defaults.capture.fps),
        };

        let pose_source = match lookup("POSE_SOURCE").as_deref().map(str::trim) {
            Some("bridge") => match lookup("POSE_BRIDGE_CMD").filter(|c| !c.trim().is_empty()) {
                Some(command) => PoseSourceKind::Bridge {
                    command,
                    timeouts: BridgeTimeouts {
                        startup: millis_or(lookup("POSE_BRIDGE_STARTUP_MS"), BridgeTimeouts::default().startup),
                        frame: millis_or(lookup("POSE_BRIDGE_TIMEOUT_MS"), BridgeTimeouts::default().frame),
                    },
                },
                None => PoseSourceKind::Simulated,
            },
            _ => PoseSourceKind::Simulated,
        };

        let controller = ControllerConfig {
            tick_interval: millis_or(lookup("TICK_INTERVAL_MS"), defaults.controller.tick_interval),
            default_frame_size: (capture.width, capture.height),
            stale_policy: lookup("STALE_RESULT_POLICY")
                .and_then(|v| StaleResultPolicy::parse(&v))
                .unwrap_or(defaults.controller.stale_policy),
        };

        let advisor = GeminiConfig {
            api_key: lookup("GEMINI_API_KEY").unwrap_or_default(),
            models: lookup("GEMINI_MODELS")
                .map(|s| {
                    s.split(',')
                        .map(|m| m.trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|models| !models.is_empty())
                .unwrap_or(defaults.advisor.models),
            base_url: lookup("GEMINI_BASE_URL").unwrap_or(defaults.advisor.base_url),
            timeout: Duration::from_secs(
                parse_or(lookup("ADVISOR_TIMEOUT_SECS"), defaults.advisor.timeout.as_secs()).max(1),
            ),
        };

        Self {
            camera_index: parse_or(lookup("CAMERA_INDEX"), defaults.camera_index),
            capture,
            pose_source,
            controller,
            advisor,
            model_dir: lookup("MODEL_DIR").map(PathBuf::from).unwrap_or(defaults.model_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]);
        assert_eq!(config.camera_index, 0);
        assert_eq!(config.capture, CaptureFormat::default());
        assert_eq!(config.pose_source, PoseSourceKind::Simulated);
        assert_eq!(config.controller.tick_interval, Duration::from_millis(16));
        assert_eq!(config.controller.default_frame_size, (640, 480));
        assert_eq!(config.controller.stale_policy, StaleResultPolicy::Apply);
        assert!(config.advisor.api_key.is_empty());
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("CAMERA_INDEX", "2"),
            ("FRAME_WIDTH", "1280"),
            ("FRAME_HEIGHT", "720"),
            ("POSE_SOURCE", "bridge"),
            ("POSE_BRIDGE_CMD", "python3 pose_bridge.py"),
            ("STALE_RESULT_POLICY", "discard-after-disable"),
            ("GEMINI_MODELS", "a, b ,,c"),
            ("TICK_INTERVAL_MS", "33"),
        ]);
        assert_eq!(config.camera_index, 2);
        assert_eq!(config.controller.default_frame_size, (1280, 720));
        assert_eq!(
            config.pose_source,
            PoseSourceKind::Bridge {
                command: "python3 pose_bridge.py".to_string(),
                timeouts: BridgeTimeouts::default(),
            }
        );
        assert_eq!(config.controller.stale_policy, StaleResultPolicy::DiscardAfterDisable);
        assert_eq!(config.advisor.models, vec!["a", "b", "c"]);
        assert_eq!(config.controller.tick_interval, Duration::from_millis(33));
    }

    #[test]
    fn unparsable_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("CAMERA_INDEX", "front"),
            ("TICK_INTERVAL_MS", "0"),
            ("ADVISOR_TIMEOUT_SECS", "0"),
            ("STALE_RESULT_POLICY", "sometimes"),
            ("POSE_SOURCE", "bridge"),
        ]);
        assert_eq!(config.camera_index, 0);
        assert_eq!(config.controller.tick_interval, Duration::from_millis(1));
        assert_eq!(config.advisor.timeout, Duration::from_secs(1));
        assert_eq!(config.controller.stale_policy, StaleResultPolicy::Apply);
        assert_eq!(config.pose_source, PoseSourceKind::Simulated);
    }

    #[test]
    fn bridge_timeouts_are_configurable() {
        let config = config_from(&[
            ("POSE_SOURCE", "bridge"),
            ("POSE_BRIDGE_CMD", "pose-bridge"),
            ("POSE_BRIDGE_STARTUP_MS", "1500"),
            ("POSE_BRIDGE_TIMEOUT_MS", "0"),
        ]);
        let PoseSourceKind::Bridge { timeouts, .. } = config.pose_source else {
            panic!("expected the bridge source");
        };
        assert_eq!(timeouts.startup, Duration::from_millis(1500));
        assert_eq!(timeouts.frame, Duration::from_millis(1));
    }
}
