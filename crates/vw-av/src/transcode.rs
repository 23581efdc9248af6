//! The transcode engine.
//!
//! Turns an input media file into a playable MP4 under a deterministic
//! cache path. Guarantees:
//!
//! - a cached output short-circuits (zero encode invocations),
//! - concurrent requests for the same output share one underlying encode,
//! - at most `max_concurrent` encode processes run at once (FIFO waiters),
//! - outputs appear atomically (temp file + rename), so a crash mid-encode
//!   never leaves a partial file at the canonical path,
//! - a failed hardware encode gets exactly one software retry with
//!   conservative settings before the operation is reported failed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Semaphore;

use vw_core::config::TranscodeConfig;
use vw_core::{Error, Result};

use crate::command::ToolCommand;
use crate::compat::{self, CompatChecker};
use crate::encoders::{EncoderDetector, SOFTWARE_ENCODER};
use crate::tools::Tools;

/// CRF for the software fallback attempt after a hardware failure.
const FALLBACK_CRF: u32 = 23;

/// Preset for the software fallback attempt.
const FALLBACK_PRESET: &str = "fast";

type SharedEncode = Shared<BoxFuture<'static, std::result::Result<PathBuf, Arc<Error>>>>;

/// Shape of a single encode.
#[derive(Debug, Clone, Copy)]
enum EncodeProfile {
    /// Full-quality conversion.
    Full,
    /// Cheap scaled-down conversion for many-simultaneous-tile previews.
    LowRes { max_height: u32 },
}

struct Inner {
    ffmpeg: Option<PathBuf>,
    config: TranscodeConfig,
    detector: Arc<EncoderDetector>,
    compat: CompatChecker,
    semaphore: Arc<Semaphore>,
    in_flight: DashMap<String, SharedEncode>,
}

/// Long-lived transcoding service.
///
/// Owns the in-flight map and the concurrency semaphore; construct one per
/// process and share it (`Clone` is cheap).
#[derive(Clone)]
pub struct TranscodeEngine {
    inner: Arc<Inner>,
}

impl TranscodeEngine {
    /// Create an engine from discovered tools and config.
    ///
    /// `tools.ffmpeg = None` makes every transcode fail fast;
    /// `tools.ffprobe = None` makes every deep probe report "needs
    /// transcode".
    pub fn new(tools: &Tools, config: TranscodeConfig, detector: Arc<EncoderDetector>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                ffmpeg: tools.ffmpeg.clone(),
                compat: CompatChecker::new(tools.ffprobe.clone()),
                detector,
                semaphore,
                in_flight: DashMap::new(),
                config,
            }),
        }
    }

    /// Fast compatibility check on the extension alone.
    pub fn needs_transcode(&self, extension: &str) -> bool {
        compat::needs_transcode(extension)
    }

    /// Deep codec-level compatibility check (memoized, fail-safe).
    pub async fn probe_needs_transcode(&self, path: &Path) -> bool {
        self.inner.compat.probe_needs_transcode(path).await
    }

    /// Deterministic output path for a full transcode of `media_id`.
    pub fn cache_path(&self, media_id: &str) -> PathBuf {
        self.inner.config.cache_dir.join(format!("{media_id}.mp4"))
    }

    /// Deterministic output path for a low-resolution transcode.
    pub fn low_res_cache_path(&self, media_id: &str, max_height: u32) -> PathBuf {
        self.inner
            .config
            .cache_dir
            .join(format!("{media_id}_h{max_height}.mp4"))
    }

    /// Convert `input` to a playable MP4 cached under `media_id`.
    ///
    /// Idempotent: if the cached output already exists the path is
    /// returned without any work, which makes job-level retries cheap.
    pub async fn transcode_to_mp4(&self, input: &Path, media_id: &str) -> Result<PathBuf> {
        let output = self.cache_path(media_id);
        self.run_cached(input.to_path_buf(), output, EncodeProfile::Full)
            .await
    }

    /// Convert `input` to a scaled-down preview MP4, cached under a key
    /// combining `media_id` and the target height.
    pub async fn transcode_low_res(
        &self,
        input: &Path,
        media_id: &str,
        max_height: u32,
    ) -> Result<PathBuf> {
        let output = self.low_res_cache_path(media_id, max_height);
        self.run_cached(
            input.to_path_buf(),
            output,
            EncodeProfile::LowRes { max_height },
        )
        .await
    }

    /// Cache-hit short-circuit, in-flight de-duplication, then the actual
    /// encode.
    async fn run_cached(
        &self,
        input: PathBuf,
        output: PathBuf,
        profile: EncodeProfile,
    ) -> Result<PathBuf> {
        if output.exists() {
            tracing::debug!(output = %output.display(), "transcode cache hit");
            return Ok(output);
        }

        let key = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| output.to_string_lossy().into_owned());

        // All concurrent callers for the same output share one future and
        // one outcome; this is what prevents two writers racing to the
        // same path.
        let fut = match self.inner.in_flight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                tracing::debug!(key = %key, "joining in-flight transcode");
                entry.get().clone()
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let inner = Arc::clone(&self.inner);
                let fut = async move {
                    encode_with_fallback(inner, input, output, profile)
                        .await
                        .map_err(Arc::new)
                }
                .boxed()
                .shared();
                entry.insert(fut.clone());
                fut
            }
        };

        let result = fut.clone().await;
        // Only evict our own entry: a caller resuming late after a failed
        // encode must not remove a fresh in-flight entry inserted by a
        // retry, or a later caller would start a second concurrent encode
        // for the same output.
        self.inner
            .in_flight
            .remove_if(&key, |_, entry| entry.ptr_eq(&fut));

        result.map_err(|e| match Arc::try_unwrap(e) {
            Ok(err) => err,
            Err(shared) => Error::internal(shared.to_string()),
        })
    }
}

impl std::fmt::Debug for TranscodeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeEngine")
            .field("cache_dir", &self.inner.config.cache_dir)
            .field("max_concurrent", &self.inner.config.max_concurrent)
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

/// Acquire a concurrency slot, encode with the best encoder, fall back to
/// software once on hardware failure, and atomically publish the output.
async fn encode_with_fallback(
    inner: Arc<Inner>,
    input: PathBuf,
    output: PathBuf,
    profile: EncodeProfile,
) -> Result<PathBuf> {
    let ffmpeg = inner
        .ffmpeg
        .clone()
        .ok_or_else(|| Error::tool("ffmpeg", "not found; cannot transcode"))?;

    // FIFO among waiters; released when the permit drops.
    let _permit = inner
        .semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| Error::internal("transcode semaphore closed"))?;

    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let encoder = inner.detector.best_encoder().await;
    let tmp = temp_path(&output);

    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        encoder = %encoder,
        "starting transcode"
    );

    match encode_once(&ffmpeg, &input, &tmp, &encoder, profile, &inner.config, false).await {
        Ok(()) => {
            tokio::fs::rename(&tmp, &output).await?;
            Ok(output)
        }
        Err(e) if encoder != SOFTWARE_ENCODER => {
            tracing::warn!(
                encoder = %encoder,
                "hardware encode failed, retrying with {SOFTWARE_ENCODER}: {e}"
            );
            let _ = tokio::fs::remove_file(&tmp).await;

            match encode_once(
                &ffmpeg,
                &input,
                &tmp,
                SOFTWARE_ENCODER,
                profile,
                &inner.config,
                true,
            )
            .await
            {
                Ok(()) => {
                    tokio::fs::rename(&tmp, &output).await?;
                    Ok(output)
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    Err(Error::encode(
                        SOFTWARE_ENCODER,
                        format!("software fallback failed: {e}"),
                    ))
                }
            }
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(Error::encode(encoder, e.to_string()))
        }
    }
}

/// Run one ffmpeg encode of `input` into `tmp`.
async fn encode_once(
    ffmpeg: &Path,
    input: &Path,
    tmp: &Path,
    encoder: &str,
    profile: EncodeProfile,
    config: &TranscodeConfig,
    conservative: bool,
) -> Result<()> {
    let mut cmd = ToolCommand::new(ffmpeg.to_path_buf());
    cmd.args(["-y", "-hide_banner", "-v", "error", "-i"]);
    cmd.arg(input.to_string_lossy());
    cmd.arg("-c:v");
    cmd.arg(encoder);

    if encoder == SOFTWARE_ENCODER {
        let (crf, preset) = if conservative {
            (FALLBACK_CRF, FALLBACK_PRESET.to_string())
        } else {
            match profile {
                EncodeProfile::Full => (config.crf, config.preset.clone()),
                EncodeProfile::LowRes { .. } => {
                    (config.low_res_crf, config.low_res_preset.clone())
                }
            }
        };
        cmd.args(["-crf".to_string(), crf.to_string(), "-preset".to_string(), preset]);
    } else {
        // Hardware encoders take bitrate caps instead of CRF.
        cmd.args(["-b:v", "5M", "-maxrate", "8M", "-bufsize", "16M"]);
    }

    let audio_bitrate = match profile {
        EncodeProfile::Full => "192k",
        EncodeProfile::LowRes { max_height } => {
            // Scale down preserving aspect ratio; -2 keeps the width even.
            cmd.arg("-vf");
            cmd.arg(format!("scale=-2:'min({max_height},ih)'"));
            "128k"
        }
    };

    cmd.args(["-c:a", "aac", "-b:a", audio_bitrate, "-ac", "2"]);
    cmd.args(["-movflags", "+faststart", "-f", "mp4"]);
    cmd.arg(tmp.to_string_lossy());
    cmd.timeout(Duration::from_secs(config.encode_timeout_secs));

    cmd.execute().await.map(|_| ())
}

/// Unique sibling temp path for an output file.
fn temp_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.mp4".to_string());
    let unique = uuid::Uuid::new_v4();
    output.with_file_name(format!(".{name}.{unique}.tmp"))
}
