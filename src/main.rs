mod probe;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::AppConfig;
use weft_core::event::EventBus;
use weft_core::graph::Graph;
use weft_core::marker::{self, env};
use weft_core::traits::{IdempotencyRegistry, RunQueue, RunStore};
use weft_core::types::{Run, RunEvent, RunId};
use weft_dispatch::ExecutionRouter;
use weft_graph::{ChannelQueue, DispatchTable, EchoCompute, Scheduler, Worker};
use weft_store::{MemoryStore, SqliteStore};

#[derive(Parser)]
#[command(name = "weft", version, about = "Graph run scheduler with fallback-safe dispatch")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml", env = "WEFT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a run of a graph file and drive it to completion
    Run {
        /// Graph definition (.toml or .json)
        graph: PathBuf,
        /// How many cycle-to-start generations to drive
        #[arg(long, default_value = "1")]
        generations: usize,
    },
    /// Show a stored run and its node runs
    Inspect {
        run_id: String,
    },
    /// Check which execution backends are reachable
    Probe,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Entrypoint for remote units: print the startup marker and a result
    UnitEntry,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Unit output is parsed line by line; keep logs off stdout there.
    if let Commands::UnitEntry = cli.command {
        return unit_entry();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .init();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run { graph, generations } => run(&config, &graph, generations).await?,
        Commands::Inspect { run_id } => inspect(&config, &RunId::from_str(&run_id)).await?,
        Commands::Probe => {
            println!("Weft Probe");
            println!("==========");
            probe::run_probe(&config).await;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } | Commands::UnitEntry => unreachable!("handled before config load"),
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = dirs_home().map(|h| h.join(".weft").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn load_graph(path: &Path) -> anyhow::Result<Graph> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read graph file {}", path.display()))?;
    let graph: Graph = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        Some("toml") => toml::from_str(&content)?,
        _ => bail!("unsupported graph file {} (expected .toml or .json)", path.display()),
    };
    Ok(graph)
}

type Stores = (Arc<dyn RunStore>, Arc<dyn IdempotencyRegistry>);

fn open_store(config: &AppConfig) -> anyhow::Result<Stores> {
    let stores: Stores = match config.storage_path() {
        Some(path) => {
            let store = Arc::new(SqliteStore::open(&path)?);
            (store.clone() as Arc<dyn RunStore>, store as Arc<dyn IdempotencyRegistry>)
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            (store.clone() as Arc<dyn RunStore>, store as Arc<dyn IdempotencyRegistry>)
        }
    };
    Ok(stores)
}

async fn run(config: &AppConfig, graph_path: &Path, generations: usize) -> anyhow::Result<()> {
    let graph = load_graph(graph_path)?;
    let (store, idempotency) = open_store(config)?;
    let router = Arc::new(ExecutionRouter::from_config(config, idempotency)?);
    let events = Arc::new(EventBus::new(config.storage.event_capacity));
    let (queue, jobs) = ChannelQueue::new();

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        router,
        Arc::new(DispatchTable::uniform(Arc::new(EchoCompute))),
        Arc::new(queue.clone()),
        events.clone(),
        config.scheduler.clone(),
    ));

    store.put_graph(&graph).await?;
    let first = Run::queued(&graph.id);
    store.create_run(&first).await?;
    queue.enqueue_run(&graph.id, &first.id).await?;

    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let RunEvent::NodeUpdated {
                node_id,
                status,
                execution_index,
                ..
            } = event
            {
                info!(node_id = %node_id, execution_index, status = %status, "Node updated");
            }
        }
    });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let handled = Worker::new(scheduler, jobs, cancel)
        .with_limit(generations.max(1))
        .exit_when_idle()
        .run()
        .await;
    info!(handled, "Worker finished");

    let mut lineage = vec![first.id.clone()];
    for run in store.list_runs(&graph.id).await? {
        let ours = run.id == first.id
            || run.parent_run_id.as_ref().is_some_and(|p| lineage.contains(p));
        if ours {
            if run.id != first.id {
                lineage.push(run.id.clone());
            }
            print_run(store.as_ref(), &run).await?;
        }
    }
    Ok(())
}

async fn inspect(config: &AppConfig, run_id: &RunId) -> anyhow::Result<()> {
    let Some(path) = config.storage_path() else {
        bail!("inspect needs a persistent store (set storage.path)");
    };
    let store = SqliteStore::open(&path)?;
    let run = store.get_run(run_id).await?;
    print_run(&store, &run).await
}

async fn print_run(store: &dyn RunStore, run: &Run) -> anyhow::Result<()> {
    println!(
        "Run {} (graph {}, generation {}): {}",
        run.id, run.graph_id, run.generation, run.status
    );
    if let Some(parent) = &run.parent_run_id {
        println!("  parent: {}", parent);
    }
    if let Some(message) = &run.failure_message {
        println!("  failure: {}", message);
    }
    for node_run in store.list_node_runs(&run.id).await? {
        let provider = node_run
            .dispatch
            .as_ref()
            .map(|d| {
                let last = d.final_provider.unwrap_or(d.selected_provider);
                if d.fallback_attempted {
                    format!("{} -> {}", d.selected_provider, last)
                } else {
                    last.to_string()
                }
            })
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<20} #{:<3} {:<10} {}",
            node_run.node_id,
            node_run.execution_index,
            node_run.status.as_str(),
            provider
        );
        if let Some(error) = &node_run.error {
            println!("      {}", truncate(error, 200));
        }
    }
    Ok(())
}

/// Remote side of the marker protocol.
fn unit_entry() -> anyhow::Result<()> {
    let vars = marker::read_env();
    let Some(dispatch_id) = vars.get(env::DISPATCH_ID) else {
        bail!("{} is not set", env::DISPATCH_ID);
    };
    println!("{}", marker::started_line(dispatch_id));

    let input: Value = match vars.get(env::INPUT) {
        Some(raw) => serde_json::from_str(raw).context("WEFT_INPUT is not valid JSON")?,
        None => Value::Null,
    };
    let payload = json!({
        "run_id": vars.get(env::RUN_ID),
        "node_id": vars.get(env::NODE_ID),
        "nodeType": vars.get(env::NODE_TYPE),
        "execution_index": vars
            .get(env::EXECUTION_INDEX)
            .and_then(|i| i.parse::<u32>().ok()),
        "workspace_identity": vars.get(env::WORKSPACE_ID),
        "input": input,
    });
    println!("{}", marker::result_line(&payload));
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
