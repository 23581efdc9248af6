//! Browser-playability checks.
//!
//! Two tiers: a free extension check for containers that are never
//! directly playable, and an ffprobe-backed codec check for everything
//! else. Probe results are memoized per path for the process lifetime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;

use crate::command::ToolCommand;

/// Container extensions that browsers cannot play regardless of codecs.
const INCOMPATIBLE_EXTENSIONS: &[&str] = &[
    "mkv", "avi", "wmv", "flv", "mpg", "mpeg", "ts", "m2ts", "vob", "3gp", "rm", "divx",
];

/// Video codecs browsers decode natively.
const PLAYABLE_VIDEO_CODECS: &[&str] = &["h264", "vp8", "vp9", "av1"];

/// Audio codecs browsers decode natively.
const PLAYABLE_AUDIO_CODECS: &[&str] = &["aac", "mp3", "opus", "vorbis", "flac"];

/// Timeout for a single ffprobe invocation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Fast compatibility check on the file extension alone. O(1), no I/O.
///
/// Accepts the extension with or without a leading dot, any case.
pub fn needs_transcode(extension: &str) -> bool {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    INCOMPATIBLE_EXTENSIONS.contains(&ext.as_str())
}

/// Deep compatibility checker backed by ffprobe.
///
/// One long-lived instance per process owns the memoization cache; tests
/// construct fresh instances for isolation.
#[derive(Debug)]
pub struct CompatChecker {
    ffprobe: Option<PathBuf>,
    cache: DashMap<PathBuf, bool>,
}

impl CompatChecker {
    /// Create a checker using the given ffprobe binary (`None` means every
    /// probe fails and therefore reports "needs transcode").
    pub fn new(ffprobe: Option<PathBuf>) -> Self {
        Self {
            ffprobe,
            cache: DashMap::new(),
        }
    }

    /// Inspect the file's actual video/audio codecs and decide whether it
    /// needs a transcode to be playable.
    ///
    /// Fail-safe: if probing errors for any reason, the file is treated as
    /// needing a transcode. Results are memoized per absolute path, so
    /// repeat checks are free.
    pub async fn probe_needs_transcode(&self, path: &Path) -> bool {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        if let Some(cached) = self.cache.get(&key) {
            return *cached;
        }

        let result = match self.probe_codecs(path).await {
            Ok((video, audio)) => {
                let video_ok = video
                    .as_deref()
                    .is_some_and(|c| PLAYABLE_VIDEO_CODECS.contains(&c));
                let audio_ok = audio
                    .as_deref()
                    .map_or(true, |c| PLAYABLE_AUDIO_CODECS.contains(&c));
                !(video_ok && audio_ok)
            }
            Err(e) => {
                // Never silently trust an unprobeable file.
                tracing::warn!(path = %path.display(), "probe failed, assuming transcode needed: {e}");
                true
            }
        };

        self.cache.insert(key, result);
        result
    }

    /// Return the first video and audio codec names reported by ffprobe.
    async fn probe_codecs(
        &self,
        path: &Path,
    ) -> vw_core::Result<(Option<String>, Option<String>)> {
        let ffprobe = self
            .ffprobe
            .as_ref()
            .ok_or_else(|| vw_core::Error::Probe("ffprobe not found".to_string()))?;

        let mut cmd = ToolCommand::new(ffprobe.clone());
        cmd.args(["-v", "quiet", "-print_format", "json", "-show_streams"]);
        cmd.arg(path.to_string_lossy());
        cmd.timeout(PROBE_TIMEOUT);

        let output = cmd.execute().await?;
        let probed: ProbeOutput = serde_json::from_str(&output.stdout)
            .map_err(|e| vw_core::Error::Probe(format!("ffprobe JSON parse error: {e}")))?;

        let mut video = None;
        let mut audio = None;
        for stream in probed.streams {
            match stream.codec_type.as_deref() {
                Some("video") if video.is_none() => video = stream.codec_name,
                Some("audio") if audio.is_none() => audio = stream.codec_name,
                _ => {}
            }
        }
        Ok((video, audio))
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
}
