//! # clones CLI
//!
//! The `clones` binary keeps a directory of git clones in step with a
//! portable registry and searches their READMEs.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `clones sync` | Import stars, adopt checkouts, clone and update managed repos |
//! | `clones search -q "<query>"` | Search indexed READMEs |
//! | `clones index rebuild` | Clear and rebuild the README index |
//! | `clones add <url>` | Add a repository to the registry |
//! | `clones rm <owner/repo>` | Remove a repository and tombstone it |
//! | `clones list` | List mirrored repositories |
//! | `clones doctor` | Repair the registry and local state files |
//! | `clones stars` | Compare GitHub stars with the registry |
//!
//! ## Environment
//!
//! - `CLONES_CONFIG_DIR`: where `config.json`, `local.json` and `clones.db` live
//! - `CLONES_CONTENT_DIR`: the clones root (also holds `registry.jsonl`)
//! - `CLONES_SYNC_CONCURRENCY`: default sync concurrency
//! - `RUST_LOG`: log filter for stderr diagnostics

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clones::config;
use clones::error::StoreError;
use clones::progress::ProgressMode;
use clones::search::{SearchOptions, DEFAULT_BLEND, DEFAULT_LIMIT};
use clones::sync::SyncOptions;
use clones::{ingest, manage, search, sync};

/// clones: keep a directory of git clones in sync and search their READMEs.
#[derive(Parser)]
#[command(
    name = "clones",
    about = "Keep a directory of git clones in sync and search their READMEs",
    version,
    long_about = "clones keeps every repository listed in a portable registry cloned and \
    fast-forwarded under one root, adopts checkouts it finds there, remembers removals with \
    tombstones, and indexes each README for keyword, semantic and hybrid search."
)]
struct Cli {
    /// Log debug diagnostics to stderr (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the registry with the clones root.
    ///
    /// Imports GitHub stars (when enabled), adopts untracked checkouts,
    /// deletes tombstoned checkouts, clones missing managed repositories and
    /// updates the rest. Afterwards the database mirror and README index are
    /// brought up to date.
    Sync {
        /// Show what would happen without running git or writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Re-fetch descriptions and topics from the host API.
        #[arg(long)]
        refresh: bool,

        /// Keep checkouts of tombstoned repositories on disk.
        #[arg(long)]
        keep: bool,

        /// Update or delete checkouts that have local changes.
        #[arg(long)]
        force: bool,

        /// Number of repositories to sync at once (1-10).
        #[arg(long, short = 'j')]
        concurrency: Option<String>,

        /// Progress output on stderr: `human`, `json` or `off`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long, value_parser = ["human", "json", "off"])]
        progress: Option<String>,
    },

    /// Search indexed READMEs.
    Search {
        /// The search query.
        #[arg(long, short)]
        query: String,

        /// Search mode: `bm25` (FTS5), `vector` (embeddings) or `hybrid` (RRF of both).
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Maximum number of results.
        #[arg(long, default_value_t = DEFAULT_LIMIT as i64, allow_negative_numbers = true)]
        limit: i64,

        /// Lexical weight in hybrid mode, from 0 (vector only) to 1 (BM25 only).
        #[arg(long, default_value_t = DEFAULT_BLEND, allow_negative_numbers = true)]
        blend: f64,

        /// Rerank the top N fused results.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        rerank_top: i64,

        /// Print per-signal ranks and scores.
        #[arg(long)]
        explain: bool,
    },

    /// Manage the README search index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Add a repository to the registry. It is cloned on the next sync.
    Add {
        /// Clone URL (https, ssh or scp-style).
        url: String,

        /// Tag to attach; repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Remove a repository from the registry and delete its checkout.
    ///
    /// The id is tombstoned so other machines delete their copy on their
    /// next sync and the checkout is never re-adopted.
    Rm {
        /// `owner/repo` or a full `host:owner/repo` id.
        target: String,

        /// Leave the checkout on disk.
        #[arg(long)]
        keep_disk: bool,

        /// Do not ask for confirmation.
        #[arg(long, short)]
        yes: bool,
    },

    /// List repositories known to the database mirror.
    List {
        /// Order by README relevance to this query.
        #[arg(long)]
        filter: Option<String>,
    },

    /// Create, normalize and (with confirmation) reset the registry and
    /// local state files, then re-mirror the database.
    Doctor {
        /// Reset corrupt files without asking. The originals are kept as backups.
        #[arg(long, short)]
        yes: bool,
    },

    /// Show which GitHub stars are in the registry and which are not.
    Stars,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Clear the index and re-chunk every README.
    Rebuild,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "clones=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn progress_mode(flag: Option<&str>) -> ProgressMode {
    match flag {
        Some("json") => ProgressMode::Json,
        Some("off") => ProgressMode::Off,
        Some(_) => ProgressMode::Human,
        None => ProgressMode::default_for_tty(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Validate search arguments before touching any state.
    let search_opts = match &cli.command {
        Commands::Search {
            mode,
            limit,
            blend,
            rerank_top,
            ..
        } => Some(SearchOptions::from_args(mode, *limit, *blend, *rerank_top)?),
        _ => None,
    };

    let (paths, cfg) = config::resolve()?;
    tracing::debug!(
        config_dir = %paths.config_dir.display(),
        clones_dir = %paths.clones_dir.display(),
        "resolved paths"
    );

    match cli.command {
        Commands::Sync {
            dry_run,
            refresh,
            keep,
            force,
            concurrency,
            progress,
        } => {
            let opts = SyncOptions {
                dry_run,
                refresh,
                keep,
                force,
                concurrency: config::get_sync_concurrency(&cfg, concurrency.as_deref()),
            };
            sync::run_sync_command(&paths, &cfg, &opts, progress_mode(progress.as_deref())).await?;
        }
        Commands::Search { query, explain, .. } => {
            let opts = search_opts.unwrap_or_default();
            search::run_search(&paths, &cfg, &query, &opts, explain).await?;
        }
        Commands::Index {
            action: IndexAction::Rebuild,
        } => {
            ingest::run_index_rebuild(&paths, &cfg, ProgressMode::default_for_tty()).await?;
        }
        Commands::Add { url, tags } => {
            manage::run_add(&paths, &url, &tags)?;
        }
        Commands::Rm {
            target,
            keep_disk,
            yes,
        } => {
            manage::run_remove(&paths, &target, keep_disk, yes).await?;
        }
        Commands::List { filter } => {
            manage::run_list(&paths, filter.as_deref()).await?;
        }
        Commands::Doctor { yes } => {
            manage::run_doctor(&paths, yes).await?;
        }
        Commands::Stars => {
            manage::run_stars(&paths, &cfg).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are not failures.
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("error: {:#}", e);
        if let Some(store) = e.downcast_ref::<StoreError>() {
            if store.is_corrupt() {
                eprintln!("hint: run `clones doctor` to repair or reset it");
            }
        }
        std::process::exit(1);
    }
}
