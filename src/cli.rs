use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reelvault")]
#[command(author, version, about = "Resumable movie ingestion and HLS delivery server")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by the upload client commands.
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server base URL (overrides the config file)
    #[arg(long, env = "REELVAULT_SERVER")]
    pub server: Option<String>,

    /// File recording resumable upload state (overrides the config file)
    #[arg(long)]
    pub state: Option<String>,

    /// Chunk transfers in flight at once (overrides the config file)
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the ingestion and delivery server
    Start {
        /// Host to bind to (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Upload a movie file in resumable chunks
    Upload {
        /// File to upload
        #[arg(required = true)]
        file: PathBuf,

        /// Display title (defaults to the file name without extension)
        #[arg(long)]
        title: Option<String>,

        /// Release year
        #[arg(long)]
        year: Option<i32>,

        /// Chunk size in bytes (server default if omitted)
        #[arg(long)]
        chunk_size: Option<u64>,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Resume an interrupted upload
    Resume {
        /// Upload id as shown by `uploads`
        #[arg(required = true)]
        upload_id: String,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Cancel an upload and discard its server-side chunks
    Cancel {
        /// Upload id as shown by `uploads`
        #[arg(required = true)]
        upload_id: String,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// List uploads recorded in the local state file
    Uploads {
        /// File recording resumable upload state (overrides the config file)
        #[arg(long)]
        state: Option<String>,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
