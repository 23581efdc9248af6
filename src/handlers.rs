//! Built-in job handlers.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use vw_av::TranscodeEngine;
use vw_db::DbPool;

use crate::registry::JobHandler;

/// Payload for `"transcode"` jobs.
///
/// `retry_count` is managed by the runner and ignored here.
#[derive(Debug, Deserialize)]
struct TranscodePayload {
    media_id: String,
    path: PathBuf,
    #[serde(default)]
    max_height: Option<u32>,
}

/// Bridges `"transcode"` jobs to the [`TranscodeEngine`].
///
/// Idempotent by construction: the engine returns a cached output without
/// re-encoding, so at-least-once job execution is safe.
#[derive(Debug, Clone)]
pub struct TranscodeHandler {
    engine: TranscodeEngine,
}

impl TranscodeHandler {
    pub fn new(engine: TranscodeEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for TranscodeHandler {
    async fn run(&self, _db: &DbPool, payload: serde_json::Value) -> vw_core::Result<()> {
        let payload: TranscodePayload = serde_json::from_value(payload)
            .map_err(|e| vw_core::Error::Validation(format!("bad transcode payload: {e}")))?;

        let output = match payload.max_height {
            Some(max_height) => {
                self.engine
                    .transcode_low_res(&payload.path, &payload.media_id, max_height)
                    .await?
            }
            None => {
                self.engine
                    .transcode_to_mp4(&payload.path, &payload.media_id)
                    .await?
            }
        };

        tracing::info!(
            media_id = %payload.media_id,
            output = %output.display(),
            "transcode job finished"
        );
        Ok(())
    }
}
