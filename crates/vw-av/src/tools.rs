//! External tool discovery.
//!
//! Locates the ffmpeg and ffprobe binaries once at startup. A config
//! override wins when the path exists; otherwise the tool is searched on
//! `PATH` via [`which::which`]. Missing tools are represented as `None`,
//! in which case dependent operations fail fast instead of erroring at
//! spawn time with a confusing message.

use std::path::PathBuf;

use vw_core::config::ToolsConfig;

/// Resolved locations of the external binaries the transcode pipeline
/// shells out to.
#[derive(Debug, Clone, Default)]
pub struct Tools {
    /// Path to ffmpeg, if found.
    pub ffmpeg: Option<PathBuf>,
    /// Path to ffprobe, if found.
    pub ffprobe: Option<PathBuf>,
}

impl Tools {
    /// Discover tools from config overrides and `PATH`.
    pub fn discover(config: &ToolsConfig) -> Self {
        let ffmpeg = resolve("ffmpeg", config.ffmpeg_path.as_deref());
        let ffprobe = resolve("ffprobe", config.ffprobe_path.as_deref());

        match &ffmpeg {
            Some(p) => tracing::info!("ffmpeg: {}", p.display()),
            None => tracing::warn!("ffmpeg not found; transcodes will fail fast"),
        }
        match &ffprobe {
            Some(p) => tracing::info!("ffprobe: {}", p.display()),
            None => tracing::warn!("ffprobe not found; codec probes will fail open"),
        }

        Self { ffmpeg, ffprobe }
    }
}

fn resolve(name: &str, custom: Option<&std::path::Path>) -> Option<PathBuf> {
    if let Some(p) = custom {
        if p.exists() {
            return Some(p.to_path_buf());
        }
        // Custom path does not exist; fall back to PATH.
        tracing::warn!(
            "configured path for {name} does not exist: {}; searching PATH",
            p.display()
        );
    }
    which::which(name).ok()
}
