//! volmigrate CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// volmigrate - move PersistentVolumeClaim data between namespaces and clusters
#[derive(Parser, Debug)]
#[command(name = "volmigrate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.volmigrate.yaml)
    #[arg(long, global = true, env = "VOLMIGRATE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Migrate data from one PersistentVolumeClaim to another
    #[command(visible_alias = "m")]
    Migrate(commands::migrate::MigrateArgs),

    /// Run the transfer protocol (container entry point of rsync jobs)
    #[command(hide = true)]
    Rsync(commands::rsync::RsyncArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Migrate(args) => commands::migrate::run(args, self.config.as_deref()).await,
            Commands::Rsync(args) => commands::rsync::run(args).await,
        }
    }
}
