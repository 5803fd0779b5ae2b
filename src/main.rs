use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pagewise::config::PagewiseConfig;
use pagewise::logging::init_tracing;

mod cmd;

#[derive(Parser)]
#[command(name = "pagewise")]
#[command(version, about = "Self-hosted e-book and documentation reader")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .pagewise directory, default configuration, and library database
    Init,
    /// Start the reader server
    Serve {
        /// Port to serve on (overrides pagewise.toml)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides pagewise.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (bind all interfaces, permissive CORS)
        #[arg(long)]
        dev: bool,

        /// Don't open a browser once the server is listening
        #[arg(long)]
        no_open: bool,

        /// Disable the Python sandbox
        #[arg(long)]
        no_sandbox: bool,
    },
    /// Print the library outline
    Library,
    /// Interactively manage books and chapters (admin only)
    Author {
        /// User id to sign in as
        #[arg(long = "as", visible_alias = "user", value_name = "UID", env = "PAGEWISE_USER")]
        user: String,
    },
    /// Manage user roles
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum AdminCommands {
    /// Grant the admin role to a user
    Grant { uid: String },
    /// Revoke the admin role from a user
    Revoke { uid: String },
    /// Show a user's stored role
    Show { uid: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default pagewise.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = PagewiseConfig::resolve(&project_dir)?;
    let _log_guard = init_tracing(cli.verbose, &config.logging)?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Serve {
            port,
            db_path,
            dev,
            no_open,
            no_sandbox,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(db_path) = db_path {
                config.server.db_path = db_path.clone();
            }
            config.server.dev_mode |= *dev;
            if *no_sandbox {
                config.sandbox.enabled = false;
            }
            cmd::cmd_serve(&project_dir, &config, !*no_open).await?;
        }
        Commands::Library => cmd::cmd_library(&project_dir, &config).await?,
        Commands::Author { user } => cmd::cmd_author(&project_dir, &config, user).await?,
        Commands::Admin { command } => {
            cmd::cmd_admin(&project_dir, &config, command.clone()).await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, &config, command.clone())?,
    }

    Ok(())
}
