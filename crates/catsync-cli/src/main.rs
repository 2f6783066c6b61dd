use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use catsync_core::{EntryIdentity, SessionId, StatusFlag};
use catsync_reconcile::{
    render_history_markdown, CatalogBackend, ReconcileConfig, ReconcilePipeline, SourceRun,
};
use catsync_storage::{CatalogReader, ChangeFilter, EntryQuery};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LOG_TARGETS: [&str; 5] = [
    "catsync_cli",
    "catsync_core",
    "catsync_feed",
    "catsync_reconcile",
    "catsync_storage",
];

#[derive(Debug, Parser)]
#[command(name = "catsync")]
#[command(about = "Reconcile scraped vendor catalogs into a tracked product catalog")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a reconciliation session for one source, or every enabled source.
    Reconcile {
        #[arg(long)]
        source: Option<String>,
        /// Record feed to use instead of the registry's feed_path.
        #[arg(long, requires = "source")]
        input: Option<PathBuf>,
    },
    /// Past session summaries, newest first.
    History {
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        markdown: bool,
    },
    /// Change log entries.
    Changes {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        review_only: bool,
    },
    /// Paginated catalog view of one source, with status counts.
    Entries(EntriesArgs),
    /// Entries still waiting for downstream sync.
    Pending {
        #[arg(long)]
        source: String,
    },
    /// Clear the pending flag of one entry after downstream sync.
    MarkProcessed {
        #[arg(long)]
        source: String,
        #[arg(long, conflicts_with = "url", required_unless_present = "url")]
        sku: Option<String>,
        #[arg(long)]
        url: Option<String>,
    },
    Migrate,
}

#[derive(Debug, Args)]
struct EntriesArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    status: Option<StatusFlag>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    limit: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut filter = EnvFilter::from_default_env();
    for target in LOG_TARGETS {
        filter = filter.add_directive(format!("{target}=info").parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = ReconcileConfig::from_env();
    let backend = CatalogBackend::open(&config)
        .await
        .context("opening catalog store")?;

    match cli
        .command
        .unwrap_or(Commands::Reconcile { source: None, input: None })
    {
        Commands::Reconcile { source, input } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing the current session");
                    on_signal.cancel();
                }
            });

            let pipeline = ReconcilePipeline::new(config, &backend);
            let runs = match source {
                Some(source_id) => {
                    let registry = pipeline.load_registry()?;
                    let source = registry.find(&source_id)?;
                    let feed_path = match input {
                        Some(path) => path,
                        None => source.resolved_feed_path(&pipeline.config().workspace_root)?,
                    };
                    vec![pipeline.run_source(source, feed_path, cancel).await?]
                }
                None => pipeline.run_once(cancel).await?,
            };
            for run in &runs {
                print_run(run);
            }
        }
        Commands::History { source, markdown } => {
            let summaries = backend.reader().session_summaries(source.as_deref()).await?;
            if markdown {
                println!("{}", render_history_markdown(&summaries));
            } else {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            }
        }
        Commands::Changes {
            session,
            source,
            review_only,
        } => {
            let changes = backend
                .reader()
                .changes(&ChangeFilter {
                    session_id: session.map(SessionId::from),
                    source_id: source,
                    review_only,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&changes)?);
        }
        Commands::Entries(args) => {
            let reader = backend.reader();
            let counts = reader.status_counts(&args.source).await?;
            let page = reader
                .list_entries(&EntryQuery {
                    source_id: Some(args.source),
                    status: args.status,
                    search: args.search,
                    page: args.page,
                    limit: args.limit,
                })
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "status_counts": counts,
                    "page": page,
                }))?
            );
        }
        Commands::Pending { source } => {
            let pending = backend.reader().pending_entries(&source).await?;
            println!("{}", serde_json::to_string_pretty(&pending)?);
        }
        Commands::MarkProcessed { source, sku, url } => {
            let identity = match (sku, url) {
                (Some(sku), _) => EntryIdentity::Sku(sku),
                (None, Some(url)) => EntryIdentity::Url(url),
                (None, None) => bail!("either --sku or --url is required"),
            };
            let found = backend
                .reader()
                .mark_processed(&source, &identity, chrono::Utc::now())
                .await?;
            if !found {
                bail!("no entry {identity} for source {source}");
            }
            info!(%identity, source_id = %source, "marked processed");
        }
        Commands::Migrate => {
            backend.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn print_run(run: &SourceRun) {
    let c = &run.summary.counters;
    println!(
        "session {} source={} new={} updated={} unchanged={} deleted={} processed={} skipped={} rejected_lines={} report={}",
        run.summary.session_id,
        run.summary.source_id,
        c.new,
        c.updated,
        c.unchanged,
        c.deleted,
        c.processed,
        c.skipped,
        run.rejected_lines,
        run.report_dir
    );
}
