//! StackBrowser command line.
//!
//! Runs a workflow file, runs the stale-execution sweeper, or reports store
//! health.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stackbrowser_coordinator::{
    engine::load_file,
    events::BroadcasterConfig,
    result_ext::ResultExt,
    state::StateManagerConfig,
    store, CoordinatorConfig, EngineConfig, EventBroadcaster, ExecutionEngine, StateStore,
    WorkflowStateManager,
};

#[derive(Parser)]
#[command(name = "stackbrowser")]
#[command(version, about = "StackBrowser workflow coordinator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one workflow definition and print the final execution record
    Run {
        /// Workflow definition (.yaml, .yml or .json)
        file: PathBuf,

        /// Set a variable: --set key=value (value parsed as JSON when possible)
        #[arg(long = "set", value_parser = parse_key_val)]
        set: Vec<(String, Value)>,

        /// Execution id (generated when omitted)
        #[arg(long)]
        execution_id: Option<String>,
    },

    /// Periodically fail stale executions and heartbeat subscribers until Ctrl+C
    Sweep,

    /// Print the state store health check
    Health,
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=value: no '=' in '{}'", s))?;
    if key.is_empty() {
        return Err(format!("invalid KEY=value: empty key in '{}'", s));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,stackbrowser_coordinator=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let loaded = CoordinatorConfig::from_env();
    init_tracing(loaded.as_ref().map(|c| c.log_json).unwrap_or(false));

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid STACKBROWSER_ configuration, using defaults");
            CoordinatorConfig::default()
        }
    };
    tracing::debug!(
        worker_id = %config.worker_id,
        nats = config.nats_url.is_some(),
        "Configuration loaded"
    );

    match cli.command {
        Commands::Run {
            file,
            set,
            execution_id,
        } => run_workflow(&config, file, set, execution_id).await,
        Commands::Sweep => sweep(&config).await,
        Commands::Health => health(&config).await,
    }
}

async fn run_workflow(
    config: &CoordinatorConfig,
    file: PathBuf,
    set: Vec<(String, Value)>,
    execution_id: Option<String>,
) -> Result<()> {
    let definition = load_file(&file)
        .await
        .with_context(|| format!("loading {}", file.display()))?;

    let store = store::open(config).await;
    let (registry, pool) =
        stackbrowser_tools::default_registry(config.browser_pool_size, config.pool_checkout_timeout());
    let engine = ExecutionEngine::new(EngineConfig::from(config), store, Arc::new(registry))
        .with_state_config(StateManagerConfig::from(config))
        .with_broadcaster(EventBroadcaster::new(BroadcasterConfig::from(config)));

    let variables: Map<String, Value> = set.into_iter().collect();
    let execution_id = execution_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info!(
        workflow_id = %definition.id,
        execution_id = %execution_id,
        steps = definition.total_steps(),
        "Running workflow"
    );

    let result = engine.run(&definition, Some(execution_id.clone()), variables).await;
    let status = pool.status();
    tracing::debug!(created = status.created, idle = status.idle, "Browser pool at exit");
    pool.close();

    match result {
        Ok(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Err(e) => {
            // A failed run still has an explanatory record.
            let fetched = engine.states().fetch(&execution_id).await;
            if let Ok(Some(record)) = fetched.log("fetching failed record") {
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            let status = e.http_status();
            Err(anyhow::Error::new(e)
                .context(format!("execution {} ended with status {}", execution_id, status)))
        }
    }
}

async fn sweep(config: &CoordinatorConfig) -> Result<()> {
    let store = store::open(config).await;
    let states = WorkflowStateManager::new(Arc::clone(&store), StateManagerConfig::from(config));
    let broadcaster = EventBroadcaster::new(BroadcasterConfig::from(config));
    let heartbeat = broadcaster.start_heartbeat();

    tracing::info!(
        interval_seconds = config.cleanup_interval_seconds,
        stale_after_seconds = config.stale_after_seconds,
        "Starting stale execution sweeper"
    );

    let stale_after = config.stale_after();
    let mut ticker = tokio::time::interval(config.cleanup_interval());
    let sweeper = async {
        loop {
            ticker.tick().await;
            sweep_once(store.as_ref(), &states, stale_after).await;
            if let Ok(stats) = states.statistics().await.log("collecting execution statistics") {
                tracing::info!(
                    total_tracked = stats.total_tracked,
                    avg_duration_ms = stats.avg_duration_ms,
                    by_status = ?stats.by_status,
                    "Execution statistics"
                );
            }
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        _ = sweeper => {}
        _ = shutdown => {
            tracing::info!("Shutting down sweeper");
        }
    }

    heartbeat.abort();
    Ok(())
}

/// Fail stale executions, then drop expired keys (dead locks, cancel markers).
async fn sweep_once(store: &dyn StateStore, states: &WorkflowStateManager, stale_after: Duration) {
    let _ = states
        .cleanup_stale(stale_after)
        .await
        .log("sweeping stale executions");
    if let Ok(purged) = store.purge_expired().await.log("purging expired keys") {
        if purged > 0 {
            tracing::debug!(purged, "Purged expired keys");
        }
    }
}

async fn health(config: &CoordinatorConfig) -> Result<()> {
    let store = store::open(config).await;
    let health = store.health_check().await;
    println!("{}", serde_json::to_string_pretty(&health)?);
    if !health.is_up() {
        anyhow::bail!("state store is {}", health.status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(parse_key_val("n=3").unwrap(), ("n".to_string(), Value::from(3)));
        assert_eq!(
            parse_key_val("site=https://x.io").unwrap(),
            ("site".to_string(), Value::String("https://x.io".into()))
        );
        assert_eq!(
            parse_key_val("q=a=b").unwrap(),
            ("q".to_string(), Value::String("a=b".into()))
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[tokio::test]
    async fn test_sweep_once_fails_stale_and_purges_expired() {
        let store: Arc<dyn StateStore> = Arc::new(stackbrowser_coordinator::store::MemoryStore::new());
        let states = WorkflowStateManager::new(Arc::clone(&store), StateManagerConfig::default());
        states.start_tracking("E1", "wf", 2, None).await.unwrap();
        store
            .set("lock:execution:dead", serde_json::json!("crashed"), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        sweep_once(store.as_ref(), &states, Duration::from_millis(10)).await;

        let record = states.fetch("E1").await.unwrap().unwrap();
        assert_eq!(record.status, stackbrowser_coordinator::ExecutionStatus::Failed);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }
}
