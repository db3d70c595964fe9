mod cli;
mod config;
mod replay;
mod session;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use session::{run_session, SessionPlan, ValueSink};

fn init_tracing(default_filter: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::load_settings_or_default(cli.config.as_deref());
    init_tracing(&settings.log_filter, cli.verbose);

    match cli.command {
        Commands::Replay { file, chunk_size } => {
            let count = replay::replay_file(&file, chunk_size, |v| println!("{}", v)).await?;
            tracing::info!("{} value(s) from {}", count, file.display());
        }
        Commands::Session {
            response,
            attachments,
            chunk_size,
            messages,
        } => {
            let sink: ValueSink = Arc::new(|content: &str, v: Value| {
                println!("{}", serde_json::json!({ "message": content, "value": v }));
            });
            let report = run_session(
                settings.queue,
                SessionPlan {
                    response,
                    attachments,
                    chunk_size,
                    messages,
                },
                sink,
            )
            .await?;
            eprintln!("{}", serde_json::to_string_pretty(&report.status)?);
            if report.failed > 0 {
                anyhow::bail!("{} message(s) failed to send", report.failed);
            }
        }
        Commands::Config => {
            if let Some(path) = config::config_path() {
                tracing::debug!("default settings path: {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}
