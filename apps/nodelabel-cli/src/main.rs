//! # nodelabel
//!
//! Command-line front end for the disk-type node labeler.
//!
//! Nodes come from a JSON inventory file; the compatibility document comes
//! either from a file holding the document itself or from a ConfigMap
//! manifest (`--configmap-key`).
//!
//! ```text
//! nodelabel lookup  --compatibility compat.json e2-medium
//! nodelabel reconcile --nodes nodes.json --compatibility compat.json --dry-run
//! nodelabel run --nodes nodes.json --compatibility configmap.json \
//!     --configmap-key machine-pd-compatibility.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use colored::*;
use nodelabel_controller::{
    cancellation, Cancellation, CompatibilityRefresher, Controller, ControllerConfig,
    ControllerEvent, FileConfigSource, FileNodeStore, NodeId, NodeStore, ReconcileError,
    ReconcileOutcome, ReconcilePlan,
};
use nodelabel_core::labels::disk_type_label_key;
use nodelabel_core::{CompatibilityStore, MachineFamily};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "nodelabel")]
#[command(about = "Label nodes with the disk types their machine family supports")]
#[command(version)]
struct Cli {
    /// Log level
    #[arg(long, global = true, env = "NODELABEL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true, env = "NODELABEL_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the machine family and disk-type labels for an instance type
    Lookup {
        #[command(flatten)]
        source: SourceArgs,

        /// Instance type, e.g. `e2-medium`
        instance_type: String,
    },
    /// Reconcile nodes once and exit
    Reconcile {
        #[command(flatten)]
        source: SourceArgs,

        /// Node inventory file
        #[arg(long)]
        nodes: PathBuf,

        /// Only reconcile these nodes (default: all)
        #[arg(long = "node")]
        only: Vec<String>,

        /// Show what would change without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the controller until interrupted
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Node inventory file
        #[arg(long)]
        nodes: PathBuf,

        /// Controller configuration file (JSON)
        #[arg(short, long, env = "NODELABEL_CONFIG")]
        config: Option<PathBuf>,

        /// Override the number of workers
        #[arg(long)]
        workers: Option<usize>,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Compatibility document, or ConfigMap manifest with `--configmap-key`
    #[arg(long, env = "NODELABEL_COMPATIBILITY")]
    compatibility: PathBuf,

    /// Read the document from this data key of a ConfigMap manifest
    #[arg(long)]
    configmap_key: Option<String>,
}

impl SourceArgs {
    fn source(&self) -> FileConfigSource {
        match &self.configmap_key {
            Some(key) => FileConfigSource::config_map(&self.compatibility, key),
            None => FileConfigSource::new(&self.compatibility),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json);

    match cli.command {
        Commands::Lookup {
            source,
            instance_type,
        } => run_lookup(&source, &instance_type).await,
        Commands::Reconcile {
            source,
            nodes,
            only,
            dry_run,
        } => run_reconcile(&source, &nodes, only, dry_run).await,
        Commands::Run {
            source,
            nodes,
            config,
            workers,
        } => run_controller(&source, &nodes, config.as_deref(), workers).await,
    }
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

// ─── Output helpers ────────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(56);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn show_result(node: &NodeId, result: &Result<ReconcileOutcome, ReconcileError>) {
    match result {
        Ok(outcome @ ReconcileOutcome::Updated { labels_set, .. }) => {
            println!(
                "  {} {:<24} {}",
                "✓".bright_green(),
                node.to_string().bold(),
                outcome
            );
            for key in labels_set {
                println!("      {} {}", "+".bright_green(), key);
            }
        }
        Ok(outcome) => {
            println!(
                "  {} {:<24} {}",
                "·".dimmed(),
                node.to_string(),
                outcome.to_string().dimmed()
            );
        }
        Err(err) => {
            println!(
                "  {} {:<24} {}",
                "✗".bright_red().bold(),
                node.to_string().bold(),
                err.to_string().bright_red()
            );
        }
    }
}

// ─── Commands ──────────────────────────────────────────────────────────────

async fn load_compatibility(args: &SourceArgs) -> anyhow::Result<Arc<CompatibilityStore>> {
    let store = Arc::new(CompatibilityStore::new());
    let refresher = CompatibilityRefresher::new(Arc::new(args.source()), Arc::clone(&store));
    refresher
        .refresh()
        .await
        .with_context(|| format!("loading {}", args.compatibility.display()))?;
    Ok(store)
}

async fn run_lookup(args: &SourceArgs, instance_type: &str) -> anyhow::Result<()> {
    let store = load_compatibility(args).await?;

    let family = match MachineFamily::from_instance_type(instance_type) {
        Some(family) => family,
        None => bail!("`{}` has no recognizable machine family", instance_type),
    };

    header(&format!("{} → {}", instance_type, family));
    match store.lookup(family.as_str()) {
        None => step(&format!("{}", "family not in compatibility mapping".yellow())),
        Some(disk_types) if disk_types.is_empty() => {
            step(&format!("{}", "no compatible disk types".yellow()))
        }
        Some(disk_types) => {
            for disk_type in disk_types.iter() {
                step(&format!("{}: \"true\"", disk_type_label_key(disk_type)));
            }
        }
    }
    Ok(())
}

async fn run_reconcile(
    args: &SourceArgs,
    nodes: &Path,
    only: Vec<String>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let store = Arc::new(FileNodeStore::new(nodes));
    let controller = Controller::new(ControllerConfig::default(), store, Arc::new(args.source()))?;
    controller
        .refresh()
        .await
        .with_context(|| format!("loading {}", args.compatibility.display()))?;

    if dry_run {
        header("Planned label changes (dry run)");
        let ids: Vec<NodeId> = if only.is_empty() {
            controller.reconciler().node_store().list_nodes().await?
        } else {
            only.into_iter().map(NodeId::new).collect()
        };
        for id in ids {
            match controller.reconciler().plan(&id).await {
                Ok(ReconcilePlan::NoChange(outcome)) => show_result(&id, &Ok(outcome)),
                Ok(ReconcilePlan::Update { family, merge, .. }) => {
                    println!(
                        "  {} {:<24} {} label(s) for {}",
                        "~".bright_yellow(),
                        id.to_string().bold(),
                        merge.updated_keys().len(),
                        family
                    );
                    for key in merge.updated_keys() {
                        println!("      {} {}", "+".bright_yellow(), key);
                    }
                }
                Err(err) => show_result(&id, &Err(err)),
            }
        }
        return Ok(());
    }

    header("Reconciling nodes");
    let results = if only.is_empty() {
        controller.reconcile_all(&Cancellation::never()).await?.results
    } else {
        let mut results = Vec::with_capacity(only.len());
        for id in only.into_iter().map(NodeId::new) {
            let result = controller.reconciler().reconcile(&id).await;
            results.push((id, result));
        }
        results
    };

    let mut failed = 0;
    for (id, result) in &results {
        show_result(id, result);
        if result.is_err() {
            failed += 1;
        }
    }
    println!();
    if failed > 0 {
        bail!("{} of {} node(s) failed", failed, results.len());
    }
    Ok(())
}

async fn run_controller(
    args: &SourceArgs,
    nodes: &Path,
    config_path: Option<&Path>,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(workers) = workers {
        config.workers = workers;
    }

    let store = Arc::new(FileNodeStore::new(nodes));
    let controller = Arc::new(Controller::new(config, store, Arc::new(args.source()))?);

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                ControllerEvent::Reconciled { node, outcome } if outcome.changed() => {
                    show_result(&node, &Ok(outcome))
                }
                ControllerEvent::ReconcileFailed {
                    node,
                    error,
                    retry_in: None,
                    ..
                } => show_result(&node, &Err(error)),
                _ => {}
            }
        }
    });

    let (handle, shutdown) = cancellation();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("interrupt received, shutting down");
        handle.cancel();
    });

    header("nodelabel controller");
    controller.run(shutdown).await?;
    Ok(())
}
