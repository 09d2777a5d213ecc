//! Manta Sync Agent - Main entry point

use anyhow::{bail, Context};
use clap::Parser;
use manta_agent::config::AgentConfig;
use manta_agent::delta::{compute_delta, find_duplicates, write_delta, write_delta_file};
use manta_agent::extract::SqlExtractor;
use manta_agent::upload::Uploader;
use manta_agent::{Cli, Commands, RunOptions, SyncAgent};
use manta_common::logging::{init_logging, LogConfig, LogLevel, WorkerGuard};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // LOG_* variables may live in .env
    dotenvy::dotenv().ok();

    // The guard flushes file logs when main returns
    let _log_guard = match logging(cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        },
    };

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            ExitCode::FAILURE
        },
    }
}

fn logging(verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let mut config = LogConfig::default()
        .with_file_prefix("manta-agent")
        .with_env_overrides()
        .context("Invalid logging environment")?;
    if verbose {
        config = config.with_level(LogLevel::Debug);
    }
    Ok(init_logging(&config)?)
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let options = cli.run_options();

    match cli.command {
        None => run_cycle(&cli.config, options).await,

        Some(Commands::Sql { kind, output_dir }) => {
            let config = load_tool_config(&cli.config)?;
            let outputs = SqlExtractor::new(config.sql)
                .run_matching(&kind, &output_dir)
                .await?;
            for output in outputs {
                println!("{}", output.display());
            }
            Ok(())
        },

        Some(Commands::Delta { old, new, output }) => {
            run_delta(old, new, output, options).await
        },

        Some(Commands::Upload { url, file }) => {
            let config = load_tool_config(&cli.config)?;
            let uploader = Uploader::new(config.upload.settings())?;
            let report = uploader
                .upload_file_with_cancel(&url, &file, shutdown_token())
                .await?;
            if !report.success {
                bail!(
                    "Uploaded {} of {} lines: {}",
                    report.uploaded_lines,
                    report.total_lines,
                    report.last_status
                );
            }
            Ok(())
        },

        Some(Commands::Duplicates { file }) => {
            let reader = BufReader::new(
                File::open(&file).with_context(|| format!("Failed to open {}", file.display()))?,
            );
            let duplicates = find_duplicates(reader)?;
            for duplicate in &duplicates {
                println!("{} ({} rows)", duplicate.key, duplicate.rows.len());
                for row in &duplicate.rows {
                    println!("  {}", row.join(","));
                }
            }
            info!(file = %file.display(), keys = duplicates.len(), "Duplicate scan finished");
            Ok(())
        },
    }
}

async fn run_cycle(config_path: &Path, options: RunOptions) -> anyhow::Result<()> {
    let config = AgentConfig::load(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    let config = Arc::new(config);
    info!(
        root = %config.root_dir.display(),
        endpoint = %config.endpoint,
        kinds = %options.kinds,
        "Starting sync cycle"
    );

    let extractor = Arc::new(SqlExtractor::new(config.sql.clone()));
    let agent = SyncAgent::new(config, options, extractor)?.with_cancellation(shutdown_token());
    agent.run_cycle().await?;
    Ok(())
}

async fn run_delta(
    old: PathBuf,
    new: PathBuf,
    output: Option<PathBuf>,
    options: RunOptions,
) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        match output {
            Some(output) => {
                write_delta_file(&old, &new, &output, &options.delta)?;
            },
            None => {
                let old = BufReader::new(File::open(&old)?);
                let new = BufReader::new(File::open(&new)?);
                let delta = compute_delta(old, new, &options.delta)?;
                write_delta(&delta, std::io::stdout().lock())?;
            },
        }
        Ok(())
    })
    .await?
}

/// Sub-commands other than the cycle only need the upload and sql sections,
/// so a missing file falls back to defaults
fn load_tool_config(path: &Path) -> anyhow::Result<AgentConfig> {
    let config = if path.exists() {
        AgentConfig::from_file(path)?
    } else {
        AgentConfig::default()
    };
    let config = config.with_env_overrides()?;
    config.upload.validate()?;
    config.sql.validate()?;
    Ok(config)
}

/// Token cancelled on Ctrl+C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));
    token
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, stopping uploads"),
        _ = terminate => info!("Received terminate signal, stopping uploads"),
    }
    token.cancel();
}
