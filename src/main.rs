use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use shipwright::telemetry::{LogFormat, init_tracing};

mod cmd;

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(version, about = "Prompt-to-preview web app builder")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS for a separately served frontend)
        #[arg(long)]
        dev: bool,

        /// Open the server URL in a browser once it is listening
        #[arg(long)]
        open: bool,
    },
    /// Generate an app from a prompt and bring up a live preview
    Build {
        prompt: String,

        #[arg(long)]
        session_id: Option<String>,

        /// Also write the generated files to this zip
        #[arg(long)]
        archive: Option<PathBuf>,
    },
    /// Publish a zipped project to GitHub and deploy it on Vercel
    Deploy {
        #[arg(long)]
        archive: PathBuf,

        #[arg(long)]
        project_name: Option<String>,

        /// Commit message (at most 500 characters)
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Inspect or remove sandboxes
    Sandboxes {
        #[command(subcommand)]
        command: SandboxCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SandboxCommands {
    /// List sandbox ids
    List,
    /// Delete one sandbox
    Delete { id: String },
    /// Delete every sandbox
    Cleanup,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and credentials
    Validate,
    /// Write a default shipwright.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve {
            host,
            port,
            dev,
            open,
        } => {
            cmd::cmd_serve(&project_dir, host.clone(), *port, *dev, *open).await?;
        }
        Commands::Build {
            prompt,
            session_id,
            archive,
        } => {
            cmd::cmd_build(
                &project_dir,
                prompt,
                session_id.as_deref(),
                archive.as_deref(),
                cli.verbose,
            )
            .await?;
        }
        Commands::Deploy {
            archive,
            project_name,
            message,
        } => {
            cmd::cmd_deploy(&project_dir, archive, project_name.clone(), message.clone()).await?;
        }
        Commands::Sandboxes { command } => cmd::cmd_sandboxes(&project_dir, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
