//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] (in-memory DB + registry + runner whose
//! `tick()` the tests drive directly) and helpers for writing fake
//! ffmpeg/ffprobe shell scripts so no real encoder is required.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use vodworks::{HandlerRegistry, JobRunner};
use vw_core::config::RunnerConfig;
use vw_db::pool::{get_conn, init_memory_pool, DbPool, PooledConnection};

/// Test harness wrapping an in-memory job store and a runner that is
/// ticked manually for determinism.
pub struct TestHarness {
    pub db: DbPool,
    pub registry: Arc<HandlerRegistry>,
    pub runner: Arc<JobRunner>,
}

impl TestHarness {
    /// Harness with default policy (max_retries = 3, sweep every 100th
    /// tick).
    pub fn new() -> Self {
        Self::with_runner_config(RunnerConfig::default())
    }

    pub fn with_runner_config(config: RunnerConfig) -> Self {
        let db = init_memory_pool().expect("failed to create in-memory pool");
        let registry = Arc::new(HandlerRegistry::new());
        let runner = Arc::new(JobRunner::new(db.clone(), Arc::clone(&registry), config));
        Self {
            db,
            registry,
            runner,
        }
    }

    /// Get a database connection from the pool.
    pub fn conn(&self) -> PooledConnection {
        get_conn(&self.db).expect("failed to get db connection")
    }
}

/// Write an executable shell script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).expect("failed to write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to chmod script");
    path
}

/// A fake ffmpeg that logs each invocation, sleeps briefly, then writes
/// its last argument (the temp output file).
///
/// `fail_marker`: when non-empty and present in the argument list, the
/// script exits 1 instead of producing output (used to force hardware
/// encoder failures).
pub fn fake_ffmpeg(dir: &Path, log: &Path, sleep_secs: &str, fail_marker: &str) -> PathBuf {
    let body = format!(
        r#"#!/bin/sh
log="{log}"
echo "start $(date +%s%N) $*" >> "$log"
fail="{fail_marker}"
if [ -n "$fail" ]; then
    case "$*" in
        *"$fail"*)
            echo "forced failure" >&2
            exit 1
            ;;
    esac
fi
sleep {sleep_secs}
for last in "$@"; do :; done
echo "encoded" > "$last"
echo "end $(date +%s%N)" >> "$log"
exit 0
"#,
        log = log.display(),
    );
    write_script(dir, "ffmpeg", &body)
}

/// A fake ffprobe that prints fixed stream JSON.
pub fn fake_ffprobe(dir: &Path, video_codec: &str, audio_codec: &str) -> PathBuf {
    let body = format!(
        r#"#!/bin/sh
cat <<'EOF'
{{"streams":[
  {{"codec_type":"video","codec_name":"{video_codec}"}},
  {{"codec_type":"audio","codec_name":"{audio_codec}"}}
]}}
EOF
"#
    );
    write_script(dir, "ffprobe", &body)
}

/// Count occurrences of a marker in the fake tool's log file.
pub fn count_log_lines(log: &Path, marker: &str) -> usize {
    match std::fs::read_to_string(log) {
        Ok(contents) => contents.lines().filter(|l| l.contains(marker)).count(),
        Err(_) => 0,
    }
}
