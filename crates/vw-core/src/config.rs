//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries
//! sub-configs for the job runner, the transcode engine, and external tool
//! paths. Every section defaults sensibly so a completely empty `{}` file
//! is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runner: RunnerConfig,
    pub transcode: TranscodeConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    ///
    /// This is intentionally string-based so the caller can read the file
    /// however it sees fit (async, embedded, etc.).
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.runner.tick_interval_ms == 0 {
            warnings.push("runner.tick_interval_ms is 0; the runner will busy-loop".into());
        }
        if self.runner.sweep_every_ticks == 0 {
            warnings.push("runner.sweep_every_ticks is 0; stale recovery is disabled".into());
        }
        if self.transcode.max_concurrent == 0 {
            warnings.push("transcode.max_concurrent is 0; all transcodes will stall".into());
        }
        if let Some(ref p) = self.tools.ffmpeg_path {
            if !p.exists() {
                warnings.push(format!("tools.ffmpeg_path does not exist: {}", p.display()));
            }
        }
        if let Some(ref p) = self.tools.ffprobe_path {
            if !p.exists() {
                warnings.push(format!("tools.ffprobe_path does not exist: {}", p.display()));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// RunnerConfig
// ---------------------------------------------------------------------------

/// Job runner (scheduler) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Polling interval between ticks, in milliseconds.
    pub tick_interval_ms: u64,
    /// Jobs stuck in `running` longer than this are swept back to `queued`.
    pub stale_after_secs: u64,
    /// Run the stale sweep every Nth tick.
    pub sweep_every_ticks: u64,
    /// Maximum number of requeues before a job is permanently errored.
    pub max_retries: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            stale_after_secs: 600,
            sweep_every_ticks: 100,
            max_retries: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// TranscodeConfig
// ---------------------------------------------------------------------------

/// Transcode engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Root directory for cached transcode outputs.
    pub cache_dir: PathBuf,
    /// Maximum number of simultaneous encode processes.
    pub max_concurrent: usize,
    /// Preferred hardware encoder id (e.g. "h264_nvenc"); used when it
    /// tested available, otherwise the priority fallback order applies.
    pub preferred_encoder: Option<String>,
    /// CRF for full-quality software encodes.
    pub crf: u32,
    /// x264 preset for full-quality software encodes.
    pub preset: String,
    /// CRF for low-resolution preview encodes.
    pub low_res_crf: u32,
    /// x264 preset for low-resolution preview encodes.
    pub low_res_preset: String,
    /// Timeout for a single encode process, in seconds.
    pub encode_timeout_secs: u64,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/tmp/vodworks/transcodes"),
            max_concurrent: 4,
            preferred_encoder: None,
            crf: 20,
            preset: "medium".to_string(),
            low_res_crf: 28,
            low_res_preset: "veryfast".to_string(),
            encode_timeout_secs: 3600,
        }
    }
}

// ---------------------------------------------------------------------------
// ToolsConfig
// ---------------------------------------------------------------------------

/// Overrides for external tool locations. When unset, tools are located
/// via `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Path to the ffmpeg binary.
    pub ffmpeg_path: Option<PathBuf>,
    /// Path to the ffprobe binary.
    pub ffprobe_path: Option<PathBuf>,
}
