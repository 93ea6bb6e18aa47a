//! Stowage CLI - command line access to backup storage providers.
//!
//! Every command runs against the provider described by a JSON profile:
//! `{ "provider": "s3", "config": { ... } }`.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use stowage_common::{ByteRange, CancellationToken};
use stowage_storage::create_default_registry;

use crate::config::Profile;

#[derive(Parser)]
#[command(name = "stowage")]
#[command(about = "Stowage - Unified backup storage access")]
#[command(version)]
struct Cli {
    /// Provider profile (JSON).
    #[arg(short, long)]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the contents of a folder.
    Ls {
        /// Folder path (default: root).
        path: Option<String>,

        /// Only show names matching this wildcard pattern.
        #[arg(short, long)]
        pattern: Option<String>,
    },

    /// Show remote metadata of an entry.
    Info {
        path: String,

        /// The path names a folder.
        #[arg(short, long)]
        folder: bool,
    },

    /// Upload a local file.
    Put {
        /// Local source file.
        source: PathBuf,

        /// Remote destination path.
        dest: String,
    },

    /// Download a remote file.
    Get {
        /// Remote source path.
        source: String,

        /// Local destination file.
        dest: PathBuf,

        /// Inclusive byte range, e.g. `0-1023` or `1024-`.
        #[arg(short, long, value_parser = commands::parse_range)]
        range: Option<ByteRange>,
    },

    /// Delete a remote entry.
    Rm {
        path: String,

        /// The path names a folder; everything below it is removed.
        #[arg(short, long)]
        folder: bool,
    },

    /// Create a remote folder.
    Mkdir { path: String },

    /// Publish an entry and print its public URL.
    Publish {
        path: String,

        #[arg(short, long)]
        folder: bool,

        /// Link lifetime in seconds, where the provider supports expiry.
        #[arg(short, long)]
        expires: Option<u64>,
    },

    /// Revoke public access to an entry.
    Unpublish {
        path: String,

        #[arg(short, long)]
        folder: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let profile = Profile::load(&cli.config)?;
    info!("Using provider '{}'", profile.provider);
    let service = profile.connect(&create_default_registry())?;

    let token = CancellationToken::new();
    let on_interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let service = service.as_ref();
    let mut out = std::io::stdout();
    match cli.command {
        Commands::Ls { path, pattern } => {
            commands::list(service, path.as_deref(), pattern.as_deref(), &token, &mut out).await
        }

        Commands::Info { path, folder } => {
            commands::show_info(service, &path, folder, &token, &mut out).await
        }

        Commands::Put { source, dest } => {
            commands::put(service, &source, &dest, &token, &mut out).await
        }

        Commands::Get {
            source,
            dest,
            range,
        } => commands::get(service, &source, &dest, range, &token, &mut out).await,

        Commands::Rm { path, folder } => {
            commands::remove(service, &path, folder, &token, &mut out).await
        }

        Commands::Mkdir { path } => commands::mkdir(service, &path, &token, &mut out).await,

        Commands::Publish {
            path,
            folder,
            expires,
        } => {
            let expires_in = expires.map(Duration::from_secs);
            commands::publish(service, &path, folder, expires_in, &token, &mut out).await
        }

        Commands::Unpublish { path, folder } => {
            commands::unpublish(service, &path, folder, &token, &mut out).await
        }
    }
}
