//! Encoder detection and adaptive transcoding for vodworks.
//!
//! Converts incompatible media files into a browser-playable MP4 using the
//! best available encoder: hardware-accelerated when a real test encode
//! succeeds, software (`libx264`) as the guaranteed fallback. Outputs are
//! written to a deterministic cache path via temp-file-then-atomic-rename,
//! concurrent identical requests share one underlying encode, and total
//! encode parallelism is bounded by a semaphore.

pub mod command;
pub mod compat;
pub mod encoders;
pub mod tools;
pub mod transcode;

pub use command::{ToolCommand, ToolOutput};
pub use compat::{needs_transcode, CompatChecker};
pub use encoders::{EncoderDetector, EncoderInfo, SOFTWARE_ENCODER};
pub use tools::Tools;
pub use transcode::TranscodeEngine;
