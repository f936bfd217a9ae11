//! # Nimbus CLI Entry Point
//!
//! Main binary for the nimbus cloud-resource helper. Runs the background
//! daemon or talks to a running one over the line protocol.
//!
//! ## Usage
//!
//! ```bash
//! # Start the daemon (second invocation exits cleanly)
//! nimbus server
//!
//! # Send one command (outputs raw JSON, pipeable to jq)
//! nimbus call QUERY_REGION eu-west-1
//!
//! # Dump the cached state, whole or per region
//! nimbus state
//! nimbus state eu-west-1
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use tokio::sync::watch;

use nimbus_client::BlockingClient;
use nimbus_common::{Command, NimbusError};
use nimbus_server::{
    Dispatcher, NullProvider, PidLock, RefreshScheduler, RequestServer, ResourceProvider,
    SchedulerConfig, SharedCache, DEFAULT_PORT,
};

fn default_addr() -> String {
    format!("127.0.0.1:{}", DEFAULT_PORT)
}

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// Nimbus - cached cloud-resource helper
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
///
/// - **Server**: run the caching daemon in the foreground
/// - **Call**: send one protocol command to a running daemon
/// - **State**: dump the daemon's cached state
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Server(ServerArgs),
    Call(CallArgs),
    State(StateArgs),
}

/// Arguments for running the nimbus daemon.
///
/// The daemon owns the resource cache: it answers client commands on a
/// localhost TCP port and refreshes stale record categories in the
/// background. Only one instance runs per user; a second invocation
/// detects the running one and exits cleanly.
#[derive(FromArgs)]
#[argh(subcommand, name = "server")]
/// run the nimbus daemon
struct ServerArgs {
    /// address to listen on for client commands
    ///
    /// Defaults to localhost on the fixed nimbus port. The daemon is a
    /// per-user helper; binding beyond loopback is not recommended.
    #[argh(option, short = 'b', default = "default_addr()")]
    bind: String,

    /// seconds between staleness checks of the background refresher
    ///
    /// Each record category still honors its own staleness interval; this
    /// only controls how often those intervals are evaluated.
    #[argh(option, long = "tick", default = "5")]
    tick_secs: u64,
}

/// Arguments for sending one command to a running daemon.
///
/// Outputs the raw JSON result to stdout (no pretty-printing), making it
/// suitable for scripting and piping into `jq`. A failed command prints
/// the daemon's error text to stderr and exits non-zero.
///
/// # Examples
///
/// ```bash
/// nimbus call QUERY_REGION eu-west-1
/// nimbus call START_INSTANCE eu-west-1 i-0abc123
/// nimbus call GET_CURRENT_COMPLETE_STATE | jq '.regions | keys'
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// send one command to the daemon
struct CallArgs {
    /// wire name of the command, e.g. QUERY_REGION
    #[argh(positional)]
    command: String,

    /// positional command arguments
    #[argh(positional)]
    args: Vec<String>,

    /// daemon address to connect to
    #[argh(option, long = "addr", default = "default_addr()")]
    addr: String,
}

/// Arguments for dumping the daemon's cached state.
///
/// With a region, asks for that region's record; without one, dumps the
/// complete cache. Output is pretty-printed for human reading; use
/// `call GET_CURRENT_COMPLETE_STATE` for machine-readable output.
#[derive(FromArgs)]
#[argh(subcommand, name = "state")]
/// dump cached state
struct StateArgs {
    /// region to dump; omit for the complete state
    #[argh(positional)]
    region: Option<String>,

    /// daemon address to connect to
    #[argh(option, long = "addr", default = "default_addr()")]
    addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Initialize tracing only for the server: call and state keep their
    // output clean for unix tool usage (piping to jq, etc.).
    if matches!(cli.command, Commands::Server(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::State(args) => run_state(args).await,
    }
}

/// Runs the daemon in the foreground until ctrl-c.
///
/// Wiring order matters: the pid lock is taken before anything else so a
/// second instance exits without touching the cache, and shutdown flows
/// ctrl-c -> scheduler -> request server so the final cache flush happens
/// before the listener goes away.
async fn run_server(args: ServerArgs) -> Result<()> {
    let _pid_lock = match PidLock::acquire_default() {
        Ok(lock) => lock,
        Err(NimbusError::AlreadyRunning(_)) => {
            println!("Daemon is already running");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let cache = SharedCache::at_default_path();
    cache.load()?;
    tracing::info!("cache loaded from {}", cache.path().display());

    let provider: Arc<dyn ResourceProvider> = Arc::new(NullProvider);
    let dispatcher = Arc::new(Dispatcher::new(cache.clone(), provider.clone()));

    // ctrl-c flips `shutdown`; the scheduler flips `server_stop` on exit.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (server_stop_tx, server_stop_rx) = watch::channel(false);

    let server = RequestServer::bind(&args.bind, dispatcher, server_stop_rx).await?;

    let mut config = SchedulerConfig::default();
    config.tick = Duration::from_secs(args.tick_secs);
    let scheduler =
        RefreshScheduler::new(cache, provider, config, shutdown_rx, server_stop_tx).spawn();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run().await?;
    scheduler.await?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Executes the `call` subcommand: one request, raw JSON out.
async fn run_call(args: CallArgs) -> Result<()> {
    let command = Command::from_str(&args.command)?;
    let (ok, value) = send(args.addr, command, args.args).await?;

    if !ok {
        anyhow::bail!("{}", value.as_str().unwrap_or("command failed"));
    }
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}

/// Executes the `state` subcommand: cached state, pretty-printed.
async fn run_state(args: StateArgs) -> Result<()> {
    let (command, call_args) = match args.region {
        Some(region) => (Command::GetCurrentRegionState, vec![region]),
        None => (Command::GetCurrentCompleteState, vec![]),
    };
    let (ok, value) = send(args.addr, command, call_args).await?;

    if !ok {
        anyhow::bail!("{}", value.as_str().unwrap_or("state query failed"));
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Runs one blocking exchange off the async runtime's worker threads.
async fn send(
    addr: String,
    command: Command,
    args: Vec<String>,
) -> Result<(bool, serde_json::Value)> {
    let result = tokio::task::spawn_blocking(move || {
        let client = BlockingClient::new(addr);
        client.send_blocking(command, args)
    })
    .await?;
    Ok(result?)
}
