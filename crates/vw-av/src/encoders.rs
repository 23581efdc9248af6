//! Hardware encoder detection.
//!
//! ffmpeg listing an encoder as compiled in says nothing about whether it
//! works on this machine (no GPU, missing driver, no /dev/dri device), so
//! each hardware candidate is validated with a real micro-encode: one
//! frame of a synthetic 64x64 black clip under a short timeout. Results
//! are cached for the process lifetime.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::command::ToolCommand;

/// The guaranteed-available software encoder, terminal fallback of every
/// selection chain.
pub const SOFTWARE_ENCODER: &str = "libx264";

/// Maximum time a single test encode may take.
const TEST_ENCODE_TIMEOUT: Duration = Duration::from_secs(10);

/// Candidate encoders in selection priority order (software last).
const CANDIDATES: &[(&str, &str, &str)] = &[
    (
        "h264_nvenc",
        "NVIDIA NVENC",
        "NVIDIA GPU H.264 encoder",
    ),
    (
        "h264_videotoolbox",
        "Apple VideoToolbox",
        "Apple hardware H.264 encoder",
    ),
    (
        "h264_qsv",
        "Intel Quick Sync",
        "Intel Quick Sync Video H.264 encoder",
    ),
    (
        "h264_vaapi",
        "VAAPI",
        "VA-API H.264 encoder",
    ),
    (
        SOFTWARE_ENCODER,
        "x264 (software)",
        "Software H.264 encoder, always available",
    ),
];

/// Availability information for a single encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderInfo {
    /// ffmpeg encoder id (e.g. "h264_nvenc").
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Whether a test encode with this encoder succeeded.
    pub available: bool,
    /// What this encoder is, or why it is unavailable.
    pub description: String,
}

/// Probes the runtime for usable video encoders and caches the result.
///
/// One long-lived instance per process; tests construct isolated instances
/// (optionally with [`EncoderDetector::with_detected`]) so there is no
/// cross-test leakage.
#[derive(Debug)]
pub struct EncoderDetector {
    ffmpeg: Option<PathBuf>,
    cache: Mutex<Option<Vec<EncoderInfo>>>,
    preferred: RwLock<Option<String>>,
}

impl EncoderDetector {
    /// Create a detector that shells out to the given ffmpeg binary.
    pub fn new(ffmpeg: Option<PathBuf>) -> Self {
        Self {
            ffmpeg,
            cache: Mutex::new(None),
            preferred: RwLock::new(None),
        }
    }

    /// Create a detector with pre-filled results (no probing will run).
    ///
    /// Used by tests and by deployments that pin encoder availability in
    /// config.
    pub fn with_detected(results: Vec<EncoderInfo>) -> Self {
        Self {
            ffmpeg: None,
            cache: Mutex::new(Some(results)),
            preferred: RwLock::new(None),
        }
    }

    /// Run detection if it has not run yet and return all encoder infos.
    ///
    /// The cache lock is held across detection so concurrent callers never
    /// probe twice.
    pub async fn detect_hardware_encoders(&self) -> Vec<EncoderInfo> {
        let mut cache = self.cache.lock().await;
        if let Some(ref results) = *cache {
            return results.clone();
        }

        let results = self.run_detection().await;
        for info in &results {
            tracing::info!(
                encoder = %info.id,
                available = info.available,
                "{}",
                info.description
            );
        }
        *cache = Some(results.clone());
        results
    }

    /// Alias for [`detect_hardware_encoders`](Self::detect_hardware_encoders);
    /// detection runs at most once per process unless [`reset`](Self::reset)
    /// is called.
    pub async fn list_encoders(&self) -> Vec<EncoderInfo> {
        self.detect_hardware_encoders().await
    }

    /// Drop cached results so the next call re-probes.
    pub async fn reset(&self) {
        *self.cache.lock().await = None;
    }

    /// Set the preferred encoder id. It is only used when it tested
    /// available.
    pub fn set_preferred(&self, encoder: Option<String>) {
        *self.preferred.write() = encoder;
    }

    /// The currently preferred encoder id, if any.
    pub fn get_preferred(&self) -> Option<String> {
        self.preferred.read().clone()
    }

    /// Pick the encoder to use: the preferred one when it tested
    /// available, otherwise the first available candidate in priority
    /// order. [`SOFTWARE_ENCODER`] is the terminal fallback.
    pub async fn best_encoder(&self) -> String {
        let results = self.detect_hardware_encoders().await;

        if let Some(preferred) = self.get_preferred() {
            if results.iter().any(|e| e.id == preferred && e.available) {
                return preferred;
            }
            tracing::warn!(
                encoder = %preferred,
                "preferred encoder unavailable; falling back"
            );
        }

        for (id, _, _) in CANDIDATES {
            if results.iter().any(|e| e.id == *id && e.available) {
                return (*id).to_string();
            }
        }
        SOFTWARE_ENCODER.to_string()
    }

    async fn run_detection(&self) -> Vec<EncoderInfo> {
        let Some(ref ffmpeg) = self.ffmpeg else {
            return CANDIDATES
                .iter()
                .map(|(id, name, _)| EncoderInfo {
                    id: (*id).to_string(),
                    display_name: (*name).to_string(),
                    available: false,
                    description: "ffmpeg not found".to_string(),
                })
                .collect();
        };

        let compiled = match list_compiled_encoders(ffmpeg).await {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!("failed to list ffmpeg encoders: {e}");
                HashSet::new()
            }
        };

        let mut results = Vec::with_capacity(CANDIDATES.len());
        for (id, name, description) in CANDIDATES {
            let info = if *id == SOFTWARE_ENCODER {
                EncoderInfo {
                    id: (*id).to_string(),
                    display_name: (*name).to_string(),
                    available: true,
                    description: (*description).to_string(),
                }
            } else if !compiled.contains(*id) {
                EncoderInfo {
                    id: (*id).to_string(),
                    display_name: (*name).to_string(),
                    available: false,
                    description: format!("{name}: not compiled into ffmpeg"),
                }
            } else {
                match test_encode(ffmpeg, id).await {
                    Ok(()) => EncoderInfo {
                        id: (*id).to_string(),
                        display_name: (*name).to_string(),
                        available: true,
                        description: (*description).to_string(),
                    },
                    Err(e) => EncoderInfo {
                        id: (*id).to_string(),
                        display_name: (*name).to_string(),
                        available: false,
                        description: format!("{name}: test encode failed: {e}"),
                    },
                }
            };
            results.push(info);
        }
        results
    }
}

/// Query ffmpeg's compiled-in encoder list.
async fn list_compiled_encoders(ffmpeg: &Path) -> vw_core::Result<HashSet<String>> {
    let mut cmd = ToolCommand::new(ffmpeg.to_path_buf());
    cmd.args(["-hide_banner", "-encoders"]);
    cmd.timeout(Duration::from_secs(10));
    let output = cmd.execute().await?;
    Ok(parse_encoder_ids(&output.stdout))
}

/// Parse encoder ids out of `ffmpeg -encoders` output.
///
/// Lines before the `------` separator are legend; after it each line is
/// ` <flags> <id> <description>`.
fn parse_encoder_ids(stdout: &str) -> HashSet<String> {
    let mut ids = HashSet::new();
    let mut in_list = false;
    for line in stdout.lines() {
        if !in_list {
            if line.trim_start().starts_with("------") {
                in_list = true;
            }
            continue;
        }
        if let Some(id) = line.split_whitespace().nth(1) {
            ids.insert(id.to_string());
        }
    }
    ids
}

/// Encode one frame of a synthetic black clip with the given encoder.
///
/// Output is discarded (`-f null`); all we care about is whether the
/// encoder initializes and produces a frame.
async fn test_encode(ffmpeg: &Path, encoder: &str) -> vw_core::Result<()> {
    let mut cmd = ToolCommand::new(ffmpeg.to_path_buf());
    cmd.args([
        "-hide_banner",
        "-v",
        "error",
        "-f",
        "lavfi",
        "-i",
        "color=c=black:s=64x64:d=0.1",
        "-frames:v",
        "1",
        "-c:v",
    ]);
    cmd.arg(encoder);
    cmd.args(["-f", "null", "-"]);
    cmd.timeout(TEST_ENCODE_TIMEOUT);
    cmd.execute().await.map(|_| ())
}
