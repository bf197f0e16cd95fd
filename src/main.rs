use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use webs::config::{CONFIG_FILE_NAME, WebsConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "webs")]
#[command(version, about = "Owner-scoped web analysis service with a workflow status bridge")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file (defaults to ./webs.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a local front-end dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and run migrations, then exit
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default webs.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config_path, command.clone());
    }

    let mut config = WebsConfig::load_or_default(&config_path)?;
    config.apply_env()?;
    let _log_guard = webs::logging::init(&config.log, cli.verbose)?;

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            cmd::cmd_serve(
                config,
                cmd::ServeOverrides {
                    port,
                    host,
                    db_path,
                    dev,
                },
            )
            .await?;
        }
        Commands::InitDb { db_path } => {
            let db_path = db_path.unwrap_or(config.database.path);
            cmd::cmd_init_db(&db_path)?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
