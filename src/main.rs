// src/main.rs
//! Tenant Pool
//!
//! `tenant-pool worker …` is the entry point the pool spawns for each worker.
//! `tenant-pool query …` runs one query through a fresh pool and prints the
//! session events as JSON lines.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tenant_pool::observability::{init_metrics, init_tracing};
use tenant_pool::protocol::DEFAULT_MAX_FRAME_BYTES;
use tenant_pool::runtime::WorkspaceResolver;
use tenant_pool::worker::{run_worker, ScriptedHandler, WorkerOptions};
use tenant_pool::{
    DirectoryResolver, Identity, PoolConfig, PoolError, QueryRequest, SessionEvent,
    StaticResolver, WorkerPool,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tenant-pool")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as a pool worker (spawned by the pool, not by hand)
    Worker(WorkerArgs),

    /// Run one query and print its events as JSON lines
    Query(QueryArgs),
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Pool socket to connect to
    #[arg(long)]
    socket: PathBuf,

    #[arg(long, default_value = "unknown")]
    handle_id: String,

    /// Expected user id
    #[arg(long)]
    uid: u32,

    /// Expected group id
    #[arg(long)]
    gid: u32,

    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,

    /// Connect but never send ready
    #[arg(long)]
    stall_before_ready: bool,

    /// Delay before sending ready
    #[arg(long)]
    ready_delay_ms: Option<u64>,

    /// Never answer healthcheck probes
    #[arg(long)]
    ignore_healthchecks: bool,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// TOML config file; TENANT_POOL__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace key, e.g. `site:acme`
    #[arg(short, long)]
    workspace: String,

    /// Prompt text sent as the query input
    #[arg(short, long, conflicts_with = "input")]
    prompt: Option<String>,

    /// Raw JSON query input
    #[arg(long)]
    input: Option<String>,

    /// Query timeout override
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Run the worker as the current user in the current directory
    #[arg(long)]
    as_current_user: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Worker(args) => worker(args).await,
        Commands::Query(args) => query(args).await,
    }
}

async fn worker(args: WorkerArgs) -> Result<()> {
    let options = WorkerOptions {
        socket: args.socket,
        handle_id: args.handle_id,
        uid: args.uid,
        gid: args.gid,
        max_frame_bytes: args.max_frame_bytes,
        stall_before_ready: args.stall_before_ready,
        ready_delay: args.ready_delay_ms.map(Duration::from_millis),
        ignore_healthchecks: args.ignore_healthchecks,
    };

    run_worker(options, ScriptedHandler::new())
        .await
        .context("worker failed")
}

async fn query(args: QueryArgs) -> Result<()> {
    init_metrics(args.metrics_addr)?;

    let config = PoolConfig::load(args.config.as_deref())?;
    info!(
        "Starting tenant-pool v{} ({})",
        tenant_pool::VERSION,
        tenant_pool::GIT_HASH
    );

    let resolver: Arc<dyn WorkspaceResolver> = if args.as_current_user {
        let cwd = std::env::current_dir()?;
        Arc::new(StaticResolver::new().with(args.workspace.as_str(), Identity::current(cwd)))
    } else {
        let root = config
            .sites_root
            .clone()
            .context("sites_root is not configured; pass --as-current-user to run locally")?;
        Arc::new(DirectoryResolver::new(root))
    };

    let input = match (&args.prompt, &args.input) {
        (Some(prompt), _) => serde_json::Value::String(prompt.clone()),
        (None, Some(raw)) => serde_json::from_str(raw).context("--input is not valid JSON")?,
        (None, None) => serde_json::Value::Null,
    };
    let mut request = QueryRequest::new(input);
    if let Some(ms) = args.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }

    let pool = WorkerPool::start(config, resolver)?;
    let outcome = run_query(&pool, &args.workspace, request).await;
    pool.shutdown().await;
    outcome
}

async fn run_query(pool: &WorkerPool, workspace: &str, request: QueryRequest) -> Result<()> {
    let mut session = pool.query(workspace, request).await?;

    loop {
        tokio::select! {
            event = session.next_event() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                match event {
                    SessionEvent::Message(_) => continue,
                    SessionEvent::Complete(_) => return Ok(()),
                    SessionEvent::Failed(failure) => {
                        error!("Query failed: {}", failure);
                        let handle_id = session.handle_id().to_string();
                        return Err(failure.into_error(&handle_id).into());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling query {}", session.request_id());
                session.cancel();
                let outcome = session.cancel_outcome().await;
                return Err(PoolError::Cancelled)
                    .with_context(|| format!("query interrupted ({:?})", outcome));
            }
        }
    }

    Ok(())
}
