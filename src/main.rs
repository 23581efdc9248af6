mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use vodworks::handlers::TranscodeHandler;
use vodworks::{HandlerRegistry, JobRunner};
use vw_av::{EncoderDetector, Tools, TranscodeEngine};
use vw_core::config::Config;
use vw_db::queries::jobs;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise derive a filter from --verbose.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "vodworks=trace,vw_av=trace,vw_db=debug,vw_core=debug".to_string()
        } else {
            "vodworks=debug,vw_av=debug,vw_db=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    let config = Config::load_or_default(cli.config.as_deref());
    for warning in config.validate() {
        tracing::warn!("config: {warning}");
    }

    match cli.command {
        Commands::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run(config, &cli.db))
        }
        Commands::Enqueue {
            kind,
            payload,
            priority,
        } => enqueue(&cli.db, &kind, &payload, priority),
        Commands::Encoders => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(print_encoders(config))
        }
        Commands::Validate => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("config ok");
            } else {
                for w in warnings {
                    println!("warning: {w}");
                }
            }
            Ok(())
        }
        Commands::Version => {
            println!("vodworks {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run(config: Config, db_path: &Path) -> Result<()> {
    tracing::info!("starting vodworks");

    let db = vw_db::init_pool(&db_path.to_string_lossy())?;

    // Recover jobs orphaned by a previous crash before the loop starts.
    {
        let conn = vw_db::get_conn(&db)?;
        let stale_after = chrono::Duration::seconds(config.runner.stale_after_secs as i64);
        let recovered = jobs::reset_stale_running(&conn, stale_after)?;
        if recovered > 0 {
            tracing::info!(recovered, "recovered stale jobs from previous session");
        }
    }

    let tools = Tools::discover(&config.tools);
    let detector = Arc::new(EncoderDetector::new(tools.ffmpeg.clone()));
    detector.set_preferred(config.transcode.preferred_encoder.clone());
    let engine = TranscodeEngine::new(&tools, config.transcode.clone(), Arc::clone(&detector));

    let registry = Arc::new(HandlerRegistry::new());
    registry.register("transcode", Arc::new(TranscodeHandler::new(engine)));

    let runner = Arc::new(JobRunner::new(db, Arc::clone(&registry), config.runner));

    let cancel = CancellationToken::new();
    let run_handle = {
        let runner = Arc::clone(&runner);
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();
    run_handle.await?;

    Ok(())
}

fn enqueue(db_path: &Path, kind: &str, payload: &str, priority: i64) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    let db = vw_db::init_pool(&db_path.to_string_lossy())?;
    let conn = vw_db::get_conn(&db)?;
    let job = jobs::enqueue(&conn, kind, &payload, priority)?;
    println!("{}", job.id);
    Ok(())
}

async fn print_encoders(config: Config) -> Result<()> {
    let tools = Tools::discover(&config.tools);
    let detector = EncoderDetector::new(tools.ffmpeg.clone());
    detector.set_preferred(config.transcode.preferred_encoder.clone());

    for info in detector.detect_hardware_encoders().await {
        let status = if info.available { "available" } else { "unavailable" };
        println!("{:<22} {:<12} {}", info.id, status, info.description);
    }
    println!("best: {}", detector.best_encoder().await);
    Ok(())
}
