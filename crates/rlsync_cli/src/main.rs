//! rlsync CLI
//!
//! Command-line tools for rlsync state files and servers.
//!
//! # Commands
//!
//! - `state show` - Print a persisted repository state file
//! - `state reset` - Clear resume keys (or everything) from a state file
//! - `fetch` - Stream a collection from a Sync 1.5 server
//! - `articles` - List Reading List articles

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use url::Url;

/// rlsync command-line tools.
#[derive(Parser)]
#[command(name = "rlsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or reset a repository state file
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Stream a collection from a Sync 1.5 server
    Fetch {
        /// Storage URL, e.g. https://host/1.5/<uid>/storage
        #[arg(long)]
        storage: Url,

        /// Collection name
        #[arg(short, long)]
        collection: String,

        /// Bearer token
        #[arg(long)]
        token: Option<String>,

        /// Only records modified after this time (ms since epoch)
        #[arg(long, default_value = "0")]
        since: i64,

        /// Records per page
        #[arg(long, default_value = "1000")]
        batch_size: u64,

        /// State file for resuming an interrupted fetch
        #[arg(long)]
        state: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List Reading List articles
    Articles {
        /// Service endpoint, e.g. https://host/v1
        #[arg(long)]
        endpoint: Url,

        /// Bearer token
        #[arg(long)]
        token: Option<String>,

        /// Only changes after this server time (ms)
        #[arg(long)]
        since: Option<i64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum StateAction {
    /// Print every committed entry
    Show {
        /// Path to the state file
        path: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Clear the resume keys so the next fetch starts over
    Reset {
        /// Path to the state file
        path: PathBuf,

        /// Clear every entry, not just the resume keys
        #[arg(short, long)]
        all: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::State { action } => match action {
            StateAction::Show { path, format } => commands::state::show(&path, &format)?,
            StateAction::Reset { path, all } => {
                let cleared = commands::state::reset(&path, all)?;
                println!("✓ Cleared {} entries from {}", cleared, path.display());
            }
        },
        Commands::Fetch {
            storage,
            collection,
            token,
            since,
            batch_size,
            state,
            format,
        } => {
            let options = commands::fetch::FetchOptions {
                storage_url: storage,
                collection,
                token,
                since,
                batch_size,
                state,
                format,
            };
            commands::fetch::run(&options)?;
        }
        Commands::Articles {
            endpoint,
            token,
            since,
            format,
        } => commands::articles::run(&endpoint, token.as_deref(), since, &format)?,
        Commands::Version => {
            println!("rlsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
