use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sidebar")]
#[command(version, about = "Replay AI provider streams and drive a chat send queue")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (defaults to settings.json in the platform config dir)
    #[arg(long, global = true, env = "SIDEBAR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Feed a captured response body through the stream parser
    Replay {
        /// Captured body (JSON array, SSE or NDJSON)
        file: PathBuf,

        /// Bytes per chunk handed to the parser
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,
    },

    /// Queue chat turns behind attachment uploads and send them in order
    Session {
        /// Captured response body replayed as the reply to every message
        #[arg(long)]
        response: PathBuf,

        /// Files to "upload" before the messages may be sent
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,

        /// Bytes per chunk when replaying the response
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,

        /// Messages to send, in order
        #[arg(required = true)]
        messages: Vec<String>,
    },

    /// Print the effective settings
    Config,
}
