mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::pipeline::PipelineCommands;
use cli::pipeline_handlers;
use std::path::PathBuf;
use steprail_core::models::{Configuration, LogLevel};
use steprail_core::services::init_logging;

#[derive(Parser)]
#[command(name = "steprail")]
#[command(version = "0.1.0")]
#[command(about = "Run gated, resumable step pipelines")]
#[command(
    help_template = "{name} - {version}\n{about}\n\n{usage-heading}\n  {usage}\n\n{all-args}{options}\n"
)]
struct Cli {
    /// Path to configuration file (default: <config dir>/steprail/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: PipelineCommands,
}

fn load_configuration(cli: &Cli) -> Result<Configuration> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => Configuration::default_config_path()?,
    };
    let mut config = Configuration::load_from_file(&path)?;

    if let Some(level) = &cli.log_level {
        config.log_level = level
            .parse::<LogLevel>()
            .context("Invalid --log-level")?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_configuration(&cli)?;
    init_logging(config.log_level)?;

    match cli.command {
        PipelineCommands::Status { status, json } => {
            pipeline_handlers::handle_status(status, json)?;
        }
        PipelineCommands::Validate { manifest, json } => {
            pipeline_handlers::handle_validate(&manifest, json)?;
        }
        PipelineCommands::Run {
            manifest,
            run_id,
            auto_approve,
        } => {
            pipeline_handlers::handle_run(&config, &manifest, run_id, auto_approve).await?;
        }
        PipelineCommands::Resume {
            run_id,
            manifest,
            auto_approve,
        } => {
            pipeline_handlers::handle_resume(&config, &run_id, &manifest, auto_approve).await?;
        }
        PipelineCommands::Inspect { run_id, json } => {
            pipeline_handlers::handle_inspect(&config, &run_id, json)?;
        }
        PipelineCommands::List { json } => {
            pipeline_handlers::handle_list(&config, json)?;
        }
        PipelineCommands::Forget { run_id } => {
            pipeline_handlers::handle_forget(&config, &run_id)?;
        }
    }

    Ok(())
}
