use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use pdca_runtime::api::{self, AppState};
use pdca_runtime::definitions::builtin::ACTION_RUN_SLICE;
use pdca_runtime::definitions::{control_plane_definition, StateTableDefinition};
use pdca_runtime::engine::{
    ActionHandler, ActionRegistry, Dispatcher, FnAction, SignalBus, StateTable, WebhookAction,
};
use pdca_runtime::scheduler::{get_metrics, QueueRunner, SliceRequest};
use pdca_runtime::storage::{InMemoryTaskStore, PostgresTaskStore, TaskStore};
use pdca_runtime::{Config, Signal, State};

#[derive(Parser)]
#[command(name = "pdca-runtime")]
#[command(about = "Signal-driven dispatcher and PDCA task scheduler", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML config file (defaults to $PDCA_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher, the queue runner and the admin API
    Run,
    /// Print queue metrics as JSON
    Metrics {
        #[arg(long, default_value_t = 15)]
        lookback_minutes: u32,
    },
    /// Apply the database schema
    Migrate,
    /// Print the state table that would be loaded
    States,
}

/// Where the task store lives, with the Postgres handle kept for schema and state-table access.
struct Stores {
    store: Arc<dyn TaskStore>,
    postgres: Option<Arc<PostgresTaskStore>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pdca_runtime=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Metrics { lookback_minutes } => print_metrics(&config, lookback_minutes).await?,
        Commands::Migrate => migrate(&config).await?,
        Commands::States => print_states(&config).await?,
    }

    Ok(())
}

async fn open_stores(config: &Config) -> Result<Stores> {
    match &config.database_url {
        Some(url) => {
            let postgres = Arc::new(
                PostgresTaskStore::new(url)
                    .await
                    .context("failed to connect to database")?,
            );
            log::info!("using PostgreSQL task store");
            Ok(Stores {
                store: postgres.clone(),
                postgres: Some(postgres),
            })
        }
        None => {
            log::warn!("DATABASE_URL not set, using in-memory task store");
            Ok(Stores {
                store: Arc::new(InMemoryTaskStore::new()),
                postgres: None,
            })
        }
    }
}

/// File first, then the database tables, then the built-in control plane.
async fn load_state_table(config: &Config, stores: &Stores) -> Result<StateTableDefinition> {
    if let Some(path) = &config.state_table_path {
        log::info!("loading state table from {}", path.display());
        return Ok(StateTableDefinition::from_yaml_file(path)?);
    }

    if let Some(postgres) = &stores.postgres {
        let def = postgres.load_state_table().await?;
        if !def.states.is_empty() {
            log::info!("loaded {} states from database", def.states.len());
            return Ok(def);
        }
    }

    log::info!("using built-in control plane state table");
    Ok(control_plane_definition())
}

fn build_registry(config: &Config) -> Result<ActionRegistry> {
    let run_slice: Arc<dyn ActionHandler> = match &config.actions.slice_webhook_url {
        Some(url) => {
            log::info!("run_slice forwards to {}", url);
            Arc::new(WebhookAction::new(
                url.clone(),
                config.actions.webhook_timeout_secs,
            )?)
        }
        None => {
            log::warn!("no slice webhook configured, slice requests are acknowledged only");
            Arc::new(FnAction::new(|signal: &Signal, state: &State| {
                let request = SliceRequest::from_signal(signal)
                    .with_context(|| format!("not a slice request: {}", signal.signal_type()))?;
                log::info!(
                    "slice requested task_id={} owner_id={} state={}",
                    request.task_id,
                    request.owner_id,
                    state.key
                );
                Ok(json!({ "acknowledged": request }))
            }))
        }
    };

    Ok(ActionRegistry::new().with(ACTION_RUN_SLICE, run_slice))
}

async fn run(config: Config) -> Result<()> {
    let stores = open_stores(&config).await?;
    if let Some(postgres) = &stores.postgres {
        postgres.run_migrations().await?;
    }

    let table = Arc::new(StateTable::from_definition(
        load_state_table(&config, &stores).await?,
    )?);
    let registry = build_registry(&config)?;
    let (bus, receiver) = SignalBus::new(Some(stores.store.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut dispatcher = Dispatcher::new(table, registry, bus.clone(), config.dispatcher.clone())?;
    let mut runner = QueueRunner::new(stores.store.clone(), bus, config.runner.clone());

    let dispatcher_shutdown = shutdown_rx.clone();
    let dispatcher_handle =
        tokio::spawn(async move { dispatcher.run(receiver, dispatcher_shutdown).await });
    let runner_shutdown = shutdown_rx.clone();
    let runner_handle = tokio::spawn(async move { runner.run(runner_shutdown).await });

    let api_handle = if config.api.enabled {
        let state = AppState {
            store: stores.store.clone(),
        };
        let api_shutdown = shutdown_rx.clone();
        let port = config.api.port;
        Some(tokio::spawn(async move {
            api::serve(state, port, api_shutdown).await
        }))
    } else {
        None
    };

    log::info!(
        "pdca-runtime running as worker {}, press Ctrl+C to stop",
        config.runner.worker_id
    );
    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    shutdown_tx.send(true)?;

    dispatcher_handle.await??;
    runner_handle.await??;
    if let Some(handle) = api_handle {
        handle.await??;
    }
    Ok(())
}

async fn print_metrics(config: &Config, lookback_minutes: u32) -> Result<()> {
    let stores = open_stores(config).await?;
    let metrics = get_metrics(stores.store.as_ref(), Utc::now(), lookback_minutes).await?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

async fn migrate(config: &Config) -> Result<()> {
    let stores = open_stores(config).await?;
    let postgres = stores
        .postgres
        .context("migrate requires DATABASE_URL")?;
    postgres.run_migrations().await?;
    println!("Schema applied");
    Ok(())
}

async fn print_states(config: &Config) -> Result<()> {
    let stores = open_stores(config).await?;
    let def = load_state_table(config, &stores).await?;
    let table = StateTable::from_definition(def.clone())?;

    println!(
        "{} states, {} transitions, initial state {}",
        table.states().len(),
        table.transition_count(),
        table.initial_state().key
    );
    print!("{}", def.to_yaml_string()?);
    Ok(())
}
