use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vodworks")]
#[command(author, version, about = "Background job runner and media transcoding service")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the job database
    #[arg(long, global = true, default_value = "vodworks.db")]
    pub db: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the job runner and process queued work until interrupted
    Run,

    /// Enqueue a job
    Enqueue {
        /// Job kind (must match a registered handler, e.g. "transcode")
        kind: String,

        /// JSON payload for the handler
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Priority (higher is served first)
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },

    /// Detect usable video encoders and print the results
    Encoders,

    /// Validate configuration file
    Validate,

    /// Display version information
    Version,
}
