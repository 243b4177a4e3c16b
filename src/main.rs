//! # CMS Mirror CLI (`mirror`)
//!
//! The `mirror` binary reconciles the destination collection store with the
//! source content store, either once from the command line or on demand
//! through the HTTP surface.
//!
//! ## Usage
//!
//! ```bash
//! mirror --config ./config/mirror.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mirror init` | Create the local state database |
//! | `mirror collections` | Show how collections resolve on the destination site |
//! | `mirror sync` | Run a full, limited, or single-item sync |
//! | `mirror state show` | Print mapping and hash counts per collection |
//! | `mirror state reset` | Forget mappings and hashes (all or one collection) |
//! | `mirror serve` | Start the HTTP sync server |
//!
//! ## Examples
//!
//! ```bash
//! # Everything, in dependency order
//! mirror sync
//!
//! # Only works, rewriting each one regardless of content hashes
//! mirror sync --only work --force
//!
//! # One record after a webhook
//! mirror sync --only work --item 2b9c1c9e-7c55-4d0e-9b39-1f0f6e3b7f11
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`); logs and progress go
//! to stderr, reports to stdout.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use cms_mirror::models::CollectionKey;
use cms_mirror::progress::ProgressMode;
use cms_mirror::sync_cmd::SyncArgs;
use cms_mirror::{collections_cmd, config, server, state_cmd, sync_cmd};

/// CMS Mirror: keep a hosted collection store in line with a headless CMS.
#[derive(Parser)]
#[command(
    name = "mirror",
    about = "CMS Mirror — one-way reconciliation from a content store into a collection store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mirror.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local state database. Idempotent.
    Init,

    /// List collections and the destination collections they resolve to.
    Collections,

    /// Reconcile the destination with the source.
    ///
    /// Without flags every collection is reconciled in dependency order,
    /// orphans are deleted and back references are linked.
    Sync {
        /// Restrict the run to one collection.
        #[arg(long)]
        only: Option<CollectionKey>,

        /// Reconcile a single source record (requires --only).
        #[arg(long, requires = "only")]
        item: Option<String>,

        /// Reconcile at most N records per collection. Disables orphan deletion.
        #[arg(long)]
        limit: Option<usize>,

        /// Write every record even when its content hash is unchanged.
        #[arg(long)]
        force: bool,

        /// Skip publishing written items.
        #[arg(long)]
        no_publish: bool,

        /// Progress output on stderr. Defaults to human on a TTY, otherwise off.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Inspect or reset reconciliation state.
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Start the HTTP sync server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum StateAction {
    /// Print mapping and hash counts.
    Show,
    /// Forget identity mappings and content hashes.
    Reset {
        /// Reset only this collection.
        #[arg(long)]
        only: Option<CollectionKey>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            sync_cmd::run_init(&cfg).await?;
        }
        Commands::Collections => {
            collections_cmd::list_collections(&cfg).await?;
        }
        Commands::Sync {
            only,
            item,
            limit,
            force,
            no_publish,
            progress,
        } => {
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            let args = SyncArgs {
                only,
                item,
                limit,
                force,
                no_publish,
            };
            sync_cmd::run_sync(&cfg, args, mode).await?;
        }
        Commands::State { action } => match action {
            StateAction::Show => {
                state_cmd::run_state_show(&cfg).await?;
            }
            StateAction::Reset { only } => {
                state_cmd::run_state_reset(&cfg, only).await?;
            }
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
