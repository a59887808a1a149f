use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::event::EventKind;
use crate::ids::{CameraId, LaneId};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub lanes: Vec<LaneConfig>,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub events: EventConfig,
    #[serde(default)]
    pub clips: ClipConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Mjpeg,
    Polling,
    Synthetic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub id: CameraId,
    #[serde(default = "default_mode")]
    pub mode: CaptureMode,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_quality")]
    pub quality: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// A pull that takes longer than this counts as a transient failure.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

/// Bootstrap lane assignment used to seed the registry at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct LaneConfig {
    pub id: LaneId,
    pub cameras: Vec<CameraId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Allocation ceiling per camera.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Δ: maximum spread of capture timestamps inside one frame set.
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: i64,
    /// How long a camera may stay silent before the lane degrades.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: i64,
    /// Unconsumed notices kept per camera while waiting for alignment.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Null,
    Scripted,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_detection_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    /// k: consecutive consistent frame sets required for a transition.
    #[serde(default = "default_debounce_frames")]
    pub debounce_frames: u32,
    #[serde(default = "default_bowler_confidence")]
    pub bowler_confidence: f32,
    #[serde(default = "default_release_confidence")]
    pub release_confidence: f32,
    #[serde(default = "default_ball_confidence")]
    pub ball_confidence: f32,
    #[serde(default = "default_pin_confidence")]
    pub pin_confidence: f32,
    #[serde(default = "default_foul_line_y")]
    pub foul_line_y: f32,
    #[serde(default = "default_pin_deck_y")]
    pub pin_deck_y: f32,
    /// Displacement (lane-normalized) above which a pin counts as moving.
    #[serde(default = "default_pin_motion_epsilon")]
    pub pin_motion_epsilon: f32,
    #[serde(default = "default_approach_timeout_ms")]
    pub approach_timeout_ms: i64,
    #[serde(default = "default_delivered_timeout_ms")]
    pub delivered_timeout_ms: i64,
    /// Without observed pin motion, settling lasts at least this long.
    #[serde(default = "default_settle_quiet_ms")]
    pub settle_quiet_ms: i64,
    #[serde(default = "default_settling_timeout_ms")]
    pub settling_timeout_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClipConfig {
    #[serde(default = "default_pre_roll_ms")]
    pub pre_roll_ms: i64,
    #[serde(default = "default_post_roll_ms")]
    pub post_roll_ms: i64,
    /// Event kinds that cause an extraction.
    #[serde(default = "default_triggers")]
    pub triggers: Vec<EventKind>,
    /// Gap at either end of the window tolerated before a camera is partial.
    #[serde(default = "default_coverage_slack_ms")]
    pub coverage_slack_ms: i64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Extra wait after the window end before reading, so post-roll frames land.
    #[serde(default = "default_extraction_margin_ms")]
    pub extraction_margin_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_crf")]
    pub crf: u32,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_handoff_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_stats_path")]
    pub path: PathBuf,
    #[serde(default = "default_stats_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            max_frames: default_max_frames(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tolerance_ms: default_tolerance_ms(),
            grace_ms: default_grace_ms(),
            max_pending: default_max_pending(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            script_path: None,
            workers: default_workers(),
            queue_depth: default_queue_depth(),
            timeout_ms: default_detection_timeout_ms(),
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            debounce_frames: default_debounce_frames(),
            bowler_confidence: default_bowler_confidence(),
            release_confidence: default_release_confidence(),
            ball_confidence: default_ball_confidence(),
            pin_confidence: default_pin_confidence(),
            foul_line_y: default_foul_line_y(),
            pin_deck_y: default_pin_deck_y(),
            pin_motion_epsilon: default_pin_motion_epsilon(),
            approach_timeout_ms: default_approach_timeout_ms(),
            delivered_timeout_ms: default_delivered_timeout_ms(),
            settle_quiet_ms: default_settle_quiet_ms(),
            settling_timeout_ms: default_settling_timeout_ms(),
        }
    }
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            pre_roll_ms: default_pre_roll_ms(),
            post_roll_ms: default_post_roll_ms(),
            triggers: default_triggers(),
            coverage_slack_ms: default_coverage_slack_ms(),
            dedup_capacity: default_dedup_capacity(),
            extraction_margin_ms: default_extraction_margin_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            prefix: default_prefix(),
            codec: default_codec(),
            crf: default_crf(),
            preset: default_preset(),
            fps: default_fps(),
            queue_depth: default_handoff_queue_depth(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            path: default_stats_path(),
            interval_secs: default_stats_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings under which the pipeline cannot do anything useful.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let mut camera_ids = HashSet::new();
        for camera in &self.cameras {
            if !camera_ids.insert(&camera.id) {
                return invalid(format!("camera {} is declared twice", camera.id));
            }
            if !valid_fps(camera.fps) {
                return invalid(format!("camera {} needs a finite, positive fps", camera.id));
            }
            if camera.mode != CaptureMode::Synthetic && camera.url.is_empty() {
                return invalid(format!("camera {} needs a url", camera.id));
            }
        }
        for lane in &self.lanes {
            if lane.cameras.is_empty() {
                return invalid(format!("lane {} has no cameras", lane.id));
            }
            if let Some(unknown) = lane.cameras.iter().find(|c| !camera_ids.contains(c)) {
                return invalid(format!("lane {} names unknown camera {unknown}", lane.id));
            }
        }
        if self.buffer.retention_secs == 0 || self.buffer.max_frames == 0 {
            return invalid("buffer retention and max_frames must be positive".into());
        }
        if self.sync.tolerance_ms < 0 || self.sync.grace_ms <= 0 || self.sync.max_pending == 0 {
            return invalid("sync tolerance, grace and max_pending out of range".into());
        }
        if self.detection.workers == 0
            || self.detection.queue_depth == 0
            || self.detection.timeout_ms == 0
        {
            return invalid("detection workers, queue_depth and timeout_ms must be positive".into());
        }
        if self.detection.backend == BackendKind::Scripted && self.detection.script_path.is_none()
        {
            return invalid("scripted backend needs detection.script_path".into());
        }
        if self.events.debounce_frames == 0 {
            return invalid("events.debounce_frames must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.events.foul_line_y)
            || !(0.0..=1.0).contains(&self.events.pin_deck_y)
            || self.events.foul_line_y >= self.events.pin_deck_y
        {
            return invalid("lane geometry needs 0 <= foul_line_y < pin_deck_y <= 1".into());
        }
        let retention_ms = self.buffer.retention_secs as i64 * 1_000;
        if self.clips.pre_roll_ms < 0
            || self.clips.post_roll_ms < 0
            || self.clips.pre_roll_ms + self.clips.post_roll_ms > retention_ms
        {
            return invalid("pre_roll_ms + post_roll_ms must fit in buffer retention".into());
        }
        if !valid_fps(self.storage.fps) {
            return invalid("storage.fps must be finite and positive".into());
        }
        if self.storage.max_attempts == 0 || self.storage.queue_depth == 0 {
            return invalid("storage max_attempts and queue_depth must be positive".into());
        }
        for camera in &self.cameras {
            let interval_ms = 1_000.0 / camera.fps;
            if (self.sync.tolerance_ms * 2) as f64 >= interval_ms {
                warn!(
                    camera = %camera.id,
                    tolerance_ms = self.sync.tolerance_ms,
                    interval_ms,
                    "sync tolerance reaches half the frame interval; frame sets may pair neighbouring frames"
                );
            }
        }
        Ok(())
    }

    pub fn camera(&self, id: &CameraId) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| &c.id == id)
    }
}

impl BufferConfig {
    pub fn retention_ms(&self) -> i64 {
        self.retention_secs as i64 * 1_000
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_mode() -> CaptureMode {
    CaptureMode::Mjpeg
}
fn default_quality() -> u32 {
    80
}
fn valid_fps(fps: f64) -> bool {
    fps.is_finite() && fps > 0.0
}

fn default_fps() -> f64 {
    30.0
}
fn default_stall_timeout_ms() -> u64 {
    2_000
}
fn default_retry_initial_ms() -> u64 {
    250
}
fn default_retry_max_ms() -> u64 {
    5_000
}
fn default_retention_secs() -> u64 {
    30
}
fn default_max_frames() -> usize {
    3_600
}
fn default_tolerance_ms() -> i64 {
    20
}
fn default_grace_ms() -> i64 {
    1_000
}
fn default_max_pending() -> usize {
    8
}
fn default_backend() -> BackendKind {
    BackendKind::Null
}
fn default_workers() -> usize {
    2
}
fn default_queue_depth() -> usize {
    16
}
fn default_detection_timeout_ms() -> u64 {
    200
}
fn default_debounce_frames() -> u32 {
    4
}
fn default_bowler_confidence() -> f32 {
    0.5
}
fn default_release_confidence() -> f32 {
    0.7
}
fn default_ball_confidence() -> f32 {
    0.5
}
fn default_pin_confidence() -> f32 {
    0.5
}
fn default_foul_line_y() -> f32 {
    0.25
}
fn default_pin_deck_y() -> f32 {
    0.9
}
fn default_pin_motion_epsilon() -> f32 {
    0.01
}
fn default_approach_timeout_ms() -> i64 {
    6_000
}
fn default_delivered_timeout_ms() -> i64 {
    5_000
}
fn default_settle_quiet_ms() -> i64 {
    1_500
}
fn default_settling_timeout_ms() -> i64 {
    8_000
}
fn default_pre_roll_ms() -> i64 {
    3_000
}
fn default_post_roll_ms() -> i64 {
    2_000
}
fn default_triggers() -> Vec<EventKind> {
    vec![EventKind::EndOfDelivery]
}
fn default_coverage_slack_ms() -> i64 {
    100
}
fn default_dedup_capacity() -> usize {
    4_096
}
fn default_extraction_margin_ms() -> i64 {
    250
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("clips")
}
fn default_prefix() -> String {
    "replays/".into()
}
fn default_codec() -> String {
    "h264".into()
}
fn default_crf() -> u32 {
    23
}
fn default_preset() -> String {
    "veryfast".into()
}
fn default_handoff_queue_depth() -> usize {
    64
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    8_000
}
fn default_stats_path() -> PathBuf {
    PathBuf::from("lane-replay-stats.json")
}
fn default_stats_interval() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[cameras]]
        id = "lane1-left"
        url = "http://10.0.0.11/stream"

        [[cameras]]
        id = "lane1-right"
        mode = "synthetic"
        fps = 60.0

        [[lanes]]
        id = "lane-1"
        cameras = ["lane1-left", "lane1-right"]

        [sync]
        tolerance_ms = 12

        [clips]
        triggers = ["release", "end-of-delivery"]
    "#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.cameras[0].mode, CaptureMode::Mjpeg);
        assert_eq!(config.cameras[1].mode, CaptureMode::Synthetic);
        assert_eq!(config.sync.tolerance_ms, 12);
        assert_eq!(config.sync.grace_ms, 1_000);
        assert_eq!(config.events.debounce_frames, 4);
        assert_eq!(config.buffer.retention_ms(), 30_000);
        assert_eq!(
            config.clips.triggers,
            vec![EventKind::Release, EventKind::EndOfDelivery]
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn empty_config_is_valid() {
        let config = Config::from_toml("").unwrap();
        assert!(config.cameras.is_empty());
        assert_eq!(config.detection.backend, BackendKind::Null);
        assert_eq!(config.storage.max_attempts, 5);
    }

    #[test]
    fn rejects_lane_with_unknown_camera() {
        let toml = r#"
            [[lanes]]
            id = "lane-9"
            cameras = ["ghost"]
        "#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("ghost")));
    }

    #[test]
    fn rejects_zero_debounce() {
        let err = Config::from_toml("[events]\ndebounce_frames = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_rolls_longer_than_retention() {
        let toml = "[buffer]\nretention_secs = 2\n[clips]\npre_roll_ms = 1500\npost_roll_ms = 1000\n";
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn rejects_scripted_backend_without_script() {
        let err = Config::from_toml("[detection]\nbackend = \"scripted\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unusable_frame_rates() {
        for fps in ["nan", "inf", "-inf", "0.0", "-25.0"] {
            let camera = format!("[[cameras]]\nid = \"cam\"\nmode = \"synthetic\"\nfps = {fps}\n");
            assert!(Config::from_toml(&camera).is_err(), "camera fps {fps} accepted");
            let storage = format!("[storage]\nfps = {fps}\n");
            assert!(Config::from_toml(&storage).is_err(), "storage fps {fps} accepted");
        }
    }

    #[test]
    fn rejects_zero_detection_timeout() {
        let err = Config::from_toml("[detection]\ntimeout_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = Config::load(Path::new("/nonexistent/lane-replay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile(..)));
    }
}
