use algolia_content_sync::client::MemorySearchClient;
use algolia_content_sync::config::Config;
use algolia_content_sync::content::{ContentStore, EntityKind, MemoryContentStore};
use algolia_content_sync::index::{ReindexOptions, ReindexReport};
use algolia_content_sync::registry::{IndexFilter, SearchSync, SearchSyncBuilder};
use algolia_content_sync::telemetry::{init_telemetry, shutdown_telemetry};
use algolia_content_sync::utils::format_number;
use algolia_content_sync::watcher::ContentEvent;
use algolia_content_sync::web;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{info, warn, Level};

/// Algolia Content Sync - keep Algolia indices in step with site content
#[derive(Parser, Debug)]
#[command(name = "algolia_content_sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// JSON content snapshot to load into the content store
    #[arg(long, value_name = "FILE")]
    content: Option<PathBuf>,

    /// Use an in-memory search client instead of Algolia
    #[arg(long)]
    dry_run: bool,

    /// Additional index ids to keep in sync (can be repeated)
    #[arg(long = "sync", value_name = "INDEX")]
    sync_indices: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Generate a template configuration file and exit
    #[arg(long, value_name = "FILE")]
    init: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List indices
    Indices {
        /// Only enabled indices
        #[arg(long)]
        enabled: bool,
        /// Only indices holding exclusively this kind (posts, terms, users)
        #[arg(long, value_name = "KIND")]
        contains: Option<String>,
    },
    /// Rebuild one index, or every enabled index with --all
    Reindex {
        #[arg(value_name = "INDEX", required_unless_present = "all")]
        index: Option<String>,
        #[arg(long, conflicts_with = "index")]
        all: bool,
        /// Persist progress here and resume from it
        #[arg(long, value_name = "FILE", requires = "index")]
        checkpoint: Option<PathBuf>,
        /// Stop after this many pages
        #[arg(long, value_name = "N")]
        max_pages: Option<usize>,
        #[arg(long, default_value_t = 100)]
        page_size: usize,
    },
    /// Compare an index with local content without writing
    Verify {
        #[arg(value_name = "INDEX")]
        index: String,
    },
    /// Dispatch a JSON array of content events as one burst
    ApplyEvents {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Replay operations queued in the outbox
    DrainOutbox,
    /// Run the admin / ingest HTTP API (default)
    Serve {
        /// Listen address (overrides config file)
        #[arg(short, long, value_name = "ADDR")]
        address: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(init_path) = &args.init {
        return write_template(init_path);
    }

    let (config, config_path) = load_config(&args)?;
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    // The OTLP exporter and the HTTP server live on the runtime; sync work
    // uses blocking HTTP and stays on this thread.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(async { init_telemetry(&config.telemetry, log_level) })?;

    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("No config file found, using defaults"),
    }

    let result = run(&args, &config, &runtime);
    shutdown_telemetry(&config.telemetry);
    result
}

fn run(args: &Args, config: &Config, runtime: &Runtime) -> Result<()> {
    let sync = build_sync(args, config)?;
    if !sync.is_sync_enabled() {
        warn!("Algolia credentials missing; remote sync is disabled (use --dry-run to simulate)");
    }

    match args.command.as_ref().unwrap_or(&Command::Serve { address: None }) {
        Command::Indices { enabled, contains } => list_indices(&sync, *enabled, contains.as_deref()),
        Command::Reindex {
            index,
            all,
            checkpoint,
            max_pages,
            page_size,
        } => {
            let ids = if *all {
                sync.get_indices(&IndexFilter {
                    enabled: Some(true),
                    contains: None,
                })
                .iter()
                .map(|i| i.id().to_string())
                .collect()
            } else {
                index.iter().cloned().collect::<Vec<_>>()
            };
            if ids.is_empty() {
                anyhow::bail!("No enabled indices to reindex. Add ids to sync.synced_indices or pass --sync.");
            }
            let options = ReindexOptions {
                page_size: *page_size,
                cancel: Some(cancel_on_ctrl_c(runtime)),
                max_pages: *max_pages,
                checkpoint: checkpoint.clone(),
            };
            reindex(&sync, &ids, &options)
        }
        Command::Verify { index } => {
            let drift = sync.check_drift(index)?;
            println!(
                "{}: {} missing, {} stale, {} outdated",
                index,
                drift.missing.len(),
                drift.stale.len(),
                drift.outdated.len()
            );
            if drift.is_clean() {
                println!("✓ Index is consistent");
                Ok(())
            } else {
                let name = sync
                    .get_index(index)
                    .map(|i| i.remote_name())
                    .unwrap_or_else(|| index.clone());
                Err(drift.into_error(&name).into())
            }
        }
        Command::ApplyEvents { file } => {
            let data = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read events file: {}", file.display()))?;
            let events: Vec<ContentEvent> = serde_json::from_str(&data)
                .with_context(|| format!("Failed to parse events file: {}", file.display()))?;
            let report = sync.dispatch_burst(&events);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_ok() {
                anyhow::bail!("Some events could not be synced");
            }
            Ok(())
        }
        Command::DrainOutbox => {
            let report = sync.drain_outbox()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Serve { address } => {
            let address = address
                .clone()
                .unwrap_or_else(|| config.server.web_address.clone());
            // Keep a handle out here so the blocking HTTP client is dropped
            // outside the runtime
            let state = Arc::new(RwLock::new(sync));
            runtime.block_on(serve(state.clone(), address))
        }
    }
}

fn build_sync(args: &Args, config: &Config) -> Result<SearchSync> {
    let store: Arc<dyn ContentStore> = match &args.content {
        Some(path) => {
            let store = MemoryContentStore::from_file(path)
                .with_context(|| format!("Failed to load content snapshot: {}", path.display()))?;
            info!(path = %path.display(), "Content snapshot loaded");
            Arc::new(store)
        }
        None => {
            warn!("No --content snapshot given; the content store is empty");
            Arc::new(MemoryContentStore::new())
        }
    };

    let mut builder = SearchSyncBuilder::new(config, store);
    if args.dry_run {
        info!("Dry run: using the in-memory search client");
        builder = builder.with_client(Some(Arc::new(MemorySearchClient::new())));
    }
    Ok(builder.build()?)
}

fn list_indices(sync: &SearchSync, enabled: bool, contains: Option<&str>) -> Result<()> {
    let contains = contains.map(|s| s.parse::<EntityKind>()).transpose()?;
    let filter = IndexFilter {
        enabled: enabled.then_some(true),
        contains,
    };

    println!("{:<28} {:<8} {:<8} {:<14} REMOTE NAME", "ID", "ENABLED", "WATCHED", "KINDS");
    for index in sync.get_indices(&filter) {
        let summary = sync.summary(&index);
        let kinds: Vec<&str> = summary.kinds.iter().map(|k| k.as_str()).collect();
        println!(
            "{:<28} {:<8} {:<8} {:<14} {}",
            summary.id,
            summary.enabled,
            summary.watched,
            kinds.join(","),
            summary.remote_name
        );
    }
    Ok(())
}

fn reindex(sync: &SearchSync, ids: &[String], options: &ReindexOptions) -> Result<()> {
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    let mut failures = 0usize;

    for id in ids {
        let pb = ProgressBar::new_spinner();
        pb.set_style(style.clone());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("{}: starting", id));

        let result = sync.reindex(id, options, |p| {
            pb.set_message(format!(
                "{}: segment {}/{} {} pages - {} records, {} upserted, {} deleted",
                p.index_id,
                (p.segment + 1).min(p.segments),
                p.segments,
                p.pages,
                format_number(p.records_seen),
                format_number(p.upserted),
                format_number(p.deleted)
            ));
        });

        match result {
            Ok(report) => {
                pb.finish_with_message(summarize(&report));
                failures += report.failed.len();
                if !report.completed {
                    if let Some(path) = &report.checkpoint {
                        println!("  resume with --checkpoint {}", path.display());
                    }
                    break;
                }
            }
            Err(e) => {
                pb.abandon_with_message(format!("{}: failed: {}", id, e));
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} operation(s) failed during reindex", failures);
    }
    Ok(())
}

fn summarize(report: &ReindexReport) -> String {
    format!(
        "{}: {} - {} records, {} upserted, {} deleted, {} failed, {} remote calls in {}ms",
        report.index_id,
        if report.completed { "done" } else { "stopped" },
        format_number(report.records_seen),
        format_number(report.upserted),
        format_number(report.deleted),
        report.failed.len(),
        report.remote_calls,
        report.elapsed_ms
    )
}

/// Flag set on Ctrl-C; checked by reindex between pages
fn cancel_on_ctrl_c(runtime: &Runtime) -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current page");
            flag.store(true, Ordering::SeqCst);
        }
    });
    cancel
}

async fn serve(state: web::AppState, address: String) -> Result<()> {
    let router = web::create_router(state);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind HTTP API to {}", address))?;
    info!(address = %address, "HTTP API available at http://{}", address);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP API server failed")?;
    Ok(())
}

fn write_template(path: &Path) -> Result<()> {
    let path = if path.as_os_str().is_empty() {
        PathBuf::from("algolia_content_sync.toml")
    } else {
        path.to_path_buf()
    };

    if path.exists() {
        eprintln!("Error: Config file already exists: {}", path.display());
        eprintln!("Remove it first or choose a different path.");
        std::process::exit(1);
    }

    Config::write_template(&path)?;
    println!("✓ Generated config file: {}", path.display());
    println!("\nAdd your Algolia credentials and synced indices, then run:");
    println!("  algolia_content_sync --config {} indices", path.display());
    Ok(())
}

fn load_config(args: &Args) -> Result<(Config, Option<PathBuf>)> {
    let (base_config, path) = if let Some(ref config_path) = args.config {
        if !config_path.exists() {
            anyhow::bail!(
                "Config file not found: {}\nUse --init {} to generate a template.",
                config_path.display(),
                config_path.display()
            );
        }
        (Config::from_file(config_path)?, Some(config_path.clone()))
    } else {
        match Config::from_default_locations()? {
            Some((config, path)) => (config, Some(path)),
            None => (Config::default(), None),
        }
    };

    let config = base_config
        .with_env_overrides()
        .with_overrides(None, args.sync_indices.clone());
    Ok((config, path))
}
