//! Configuration management for segcast

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{AudioConstraints, CaptureConstraints};
use crate::recorder::WEBM_MIME_TYPE;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Capture configuration (grabber, devices, audio processing)
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Recording configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// ffmpeg binary; looked up on PATH when not absolute
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// Grabber arguments replacing the platform defaults, e.g.
    /// `["-f", "x11grab", "-i", ":1.0"]`
    #[serde(default)]
    pub input_args: Option<Vec<String>>,

    #[serde(default = "default_framerate")]
    pub framerate: u32,

    #[serde(default = "default_video_bitrate")]
    pub video_bitrate_kbps: u32,

    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Capture microphone audio alongside the display
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub constraints: AudioConstraints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory repaired segments are written to
    #[serde(default = "default_recording_output_directory")]
    pub output_directory: PathBuf,

    /// Segment length before rolling over to a new recorder (ms, 0 disables)
    #[serde(default = "default_rollover_period")]
    pub rollover_period_ms: u64,

    /// How often the recorder hands over buffered data (ms)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// MIME type attached to finished segments
    #[serde(default = "default_mime_type")]
    pub mime_type: String,

    /// Finished segments that may wait for export before rollover blocks
    #[serde(default = "default_export_queue_capacity")]
    pub export_queue_capacity: usize,

    /// Whether to start recording automatically on launch
    #[serde(default)]
    pub autostart_on_launch: bool,

    /// Forward pause/resume to the recorder instead of only changing state
    #[serde(default)]
    pub suspend_on_pause: bool,
}

// Default value functions
fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_framerate() -> u32 {
    30
}

fn default_video_bitrate() -> u32 {
    2500
}

fn default_true() -> bool {
    true
}

fn default_recording_output_directory() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.video_dir().map(|dir| dir.join("segcast")))
        .unwrap_or_else(|| std::env::temp_dir().join("segcast-recordings"))
}

fn default_rollover_period() -> u64 {
    60_000
}

fn default_flush_interval() -> u64 {
    1000
}

fn default_mime_type() -> String {
    WEBM_MIME_TYPE.to_string()
}

fn default_export_queue_capacity() -> usize {
    8
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            input_args: None,
            framerate: default_framerate(),
            video_bitrate_kbps: default_video_bitrate(),
            audio: AudioConfig::default(),
        }
    }
}

impl CaptureConfig {
    /// Constraints requested when acquiring a stream
    pub fn constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            video: true,
            audio: self
                .audio
                .enabled
                .then(|| self.audio.constraints.clone()),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            constraints: AudioConstraints::default(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_directory: default_recording_output_directory(),
            rollover_period_ms: default_rollover_period(),
            flush_interval_ms: default_flush_interval(),
            mime_type: default_mime_type(),
            export_queue_capacity: default_export_queue_capacity(),
            autostart_on_launch: false,
            suspend_on_pause: false,
        }
    }
}

impl RecordingConfig {
    pub fn rollover_period(&self) -> Option<Duration> {
        (self.rollover_period_ms > 0).then(|| Duration::from_millis(self.rollover_period_ms))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from `path`, writing defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?;

            config.config_path = Some(path.to_path_buf());
            Ok(config)
        } else {
            let config = Config {
                config_path: Some(path.to_path_buf()),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "segcast", "segcast")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
