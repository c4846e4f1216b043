//! `rusty-flow` entry-point.
//!
//! Available sub-commands:
//! - `serve`    start the HTTP API and the execution worker pool.
//! - `migrate`  run pending database migrations.
//! - `validate` check a workflow or plan JSON file.
//! - `run`      execute a workflow or plan file in memory and print the result.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use db::models::TriggerKind;
use db::{DefinitionStore, ExecutionStore, MemoryStore};
use engine::{
    ExecutionService, ExecutorConfig, Plan, Program, ServiceConfig, TriggerOptions, WebhookNotifier,
    Workflow, WorkflowExecutor,
};
use nodes::collaborators::NoGenerator;
use nodes::http::{OpenAiCompatibleGenerator, ReqwestHttpClient};
use nodes::{HttpClient, StepRegistry, TextGenerator};
use queue::PoolConfig;

#[derive(Parser)]
#[command(name = "rusty-flow", about = "Workflow and agent plan execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API and the worker pool.
    Serve {
        #[arg(long, env = "RUSTY_FLOW_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
        /// Keep all state in memory instead of Postgres.
        #[arg(long)]
        memory: bool,
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Validate a workflow or plan definition file.
    Validate {
        path: PathBuf,
    },
    /// Execute a definition file against an in-memory store.
    Run {
        path: PathBuf,
        /// Trigger payload as inline JSON.
        #[arg(long, default_value = "{}")]
        input: String,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
}

#[derive(Args, Clone)]
struct RuntimeArgs {
    #[arg(long, env = "RUSTY_FLOW_WORKERS", default_value_t = 4)]
    workers: usize,
    /// Steps dispatched concurrently within one execution.
    #[arg(long, env = "RUSTY_FLOW_MAX_PARALLEL", default_value_t = 4)]
    max_parallel: usize,
    /// Seconds a synchronous trigger blocks before returning.
    #[arg(long, env = "RUSTY_FLOW_SYNC_WAIT", default_value_t = 30)]
    sync_wait_seconds: u64,
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    #[arg(long, env = "GENERATION_URL")]
    generation_url: Option<String>,
    #[arg(long, env = "GENERATION_API_KEY", hide_env_values = true)]
    generation_api_key: Option<String>,
    #[arg(long, env = "GENERATION_MODEL", default_value = "gpt-4o-mini")]
    generation_model: String,
}

/// A definition file holds either a workflow or a plan.
enum Definition {
    Workflow(Workflow),
    Plan(Plan),
}

fn load_definition(path: &Path) -> Result<Definition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let raw: Value = serde_json::from_str(&content).context("invalid JSON")?;
    if raw.get("goal").is_some() {
        Ok(Definition::Plan(serde_json::from_value(raw).context("invalid plan")?))
    } else {
        Ok(Definition::Workflow(serde_json::from_value(raw).context("invalid workflow")?))
    }
}

fn build_service(store: Arc<MemoryStore>, runtime: &RuntimeArgs) -> Result<ExecutionService> {
    build_service_with(store.clone(), store, runtime)
}

fn build_service_with(
    executions: Arc<dyn ExecutionStore>,
    definitions: Arc<dyn DefinitionStore>,
    runtime: &RuntimeArgs,
) -> Result<ExecutionService> {
    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(Duration::from_secs(30))?);
    let generator: Arc<dyn TextGenerator> = match &runtime.generation_url {
        Some(url) => Arc::new(OpenAiCompatibleGenerator::new(
            url.clone(),
            runtime.generation_api_key.clone(),
            runtime.generation_model.clone(),
        )),
        None => {
            warn!("GENERATION_URL not set; ai_response steps will fail");
            Arc::new(NoGenerator)
        }
    };

    let registry = StepRegistry::builtin(generator, http.clone()).build();
    let config = ExecutorConfig { max_parallel: runtime.max_parallel.max(1), ..ExecutorConfig::default() };
    let executor = WorkflowExecutor::new(executions, Arc::new(registry), config)
        .with_notifier(Arc::new(WebhookNotifier::new(http)));

    let service_config = ServiceConfig {
        sync_wait_budget: Duration::from_secs(runtime.sync_wait_seconds),
        pool: PoolConfig { workers: runtime.workers.max(1), ..PoolConfig::default() },
    };
    Ok(ExecutionService::new(Arc::new(executor), definitions, service_config))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutdown requested");
}

async fn serve(
    bind: SocketAddr,
    memory: bool,
    database_url: Option<String>,
    runtime: RuntimeArgs,
) -> Result<()> {
    let service = if memory {
        info!("using in-memory store");
        build_service(Arc::new(MemoryStore::new()), &runtime)?
    } else {
        let Some(url) = database_url else {
            bail!("DATABASE_URL is required unless --memory is set");
        };
        let store = Arc::new(db::pool::connect_store(&url, 10).await?);
        build_service_with(store.clone(), store, &runtime)?
    };

    let service = Arc::new(service);
    let recovered = service.recover().await?;
    if recovered > 0 {
        info!(recovered, "resubmitted unfinished executions");
    }

    api::serve(bind, api::AppState::new(service.clone()), shutdown_signal()).await?;
    service.shutdown().await;
    Ok(())
}

async fn run(path: &Path, input: &str, runtime: RuntimeArgs) -> Result<()> {
    let input: Value = serde_json::from_str(input).context("--input is not valid JSON")?;
    let service = build_service(Arc::new(MemoryStore::new()), &runtime)?;
    let options = TriggerOptions::new(TriggerKind::Manual).by("cli").waiting();

    let record = match load_definition(path)? {
        Definition::Workflow(wf) => {
            let wf = service.register_workflow(wf).await?;
            service.trigger_workflow(wf.id, input, options).await?
        }
        Definition::Plan(plan) => {
            let plan = service.register_plan(plan).await?;
            service.start_plan(plan.id, input, options).await?
        }
    };

    let view = service.status(record.id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    service.shutdown().await;
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    match load_definition(path)? {
        Definition::Workflow(wf) => {
            let order = engine::validate_dag(&wf)?;
            Program::from_workflow(&wf)?;
            println!("workflow is valid; execution order: {order:?}");
        }
        Definition::Plan(plan) => {
            let program = Program::from_plan(&plan)?;
            println!("plan is valid; {} steps", program.steps.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rusty_flow=info,engine=info,api=info,warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { bind, memory, database_url, runtime } => {
            serve(bind, memory, database_url, runtime).await
        }
        Command::Migrate { database_url } => {
            info!("running migrations");
            let pool = db::pool::create_pool(&database_url, 2).await?;
            db::pool::run_migrations(&pool).await?;
            info!("migrations applied");
            Ok(())
        }
        Command::Validate { path } => validate(&path),
        Command::Run { path, input, runtime } => run(&path, &input, runtime).await,
    }
}
