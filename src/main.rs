use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "g3")]
#[command(version, about = "Contract-first code generation engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Project directory holding `.g3/engine.toml` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API, the worker pool and the watchdog
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "3142")]
        port: u16,

        /// Database path (overrides engine.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Create the engine database without starting the server
    Init {
        /// Database path (overrides engine.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Show one job as JSON
    Status {
        job_id: String,

        /// Database path (overrides engine.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// List jobs (unfinished ones unless --all)
    Jobs {
        /// Database path (overrides engine.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Include finished jobs
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    g3::telemetry::init_tracing(cli.verbose, cli.json_logs);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = g3::config::EngineConfig::load(&project_dir)?;

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            let db_path = cmd::resolve_db_path(&project_dir, &config, db_path);
            cmd::cmd_serve(port, db_path, dev, config).await?;
        }
        Commands::Init { db_path } => {
            cmd::cmd_init(&cmd::resolve_db_path(&project_dir, &config, db_path))?;
        }
        Commands::Status { job_id, db_path } => {
            cmd::cmd_status(&cmd::resolve_db_path(&project_dir, &config, db_path), &job_id)?;
        }
        Commands::Jobs { db_path, all } => {
            cmd::cmd_jobs(&cmd::resolve_db_path(&project_dir, &config, db_path), all)?;
        }
    }

    Ok(())
}
