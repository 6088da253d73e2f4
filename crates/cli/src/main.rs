mod config;
mod error;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Utc};
use clap::{Parser, Subcommand};
use runtime::{
    ExecutionRequest, RuntimeConfig, ServerConnectionManager, ToolDiscoveryCache, ToolExecutor,
    ToolSource,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use error::Result;

#[derive(Parser)]
#[command(name = "steward")]
#[command(about = "Connect to tool servers and run their tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "STEWARD_CONFIG", default_value = config::CONFIG_FILE)]
    config: PathBuf,

    /// Log lifecycle details to stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every enabled server and report its health
    Servers,
    /// List the tools exposed by connected servers
    Tools {
        /// Rebuild the catalog instead of using a cached one
        #[arg(long)]
        refresh: bool,
    },
    /// Run one tool and print its result
    Call {
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
        /// Run on this server instead of the catalog's owner
        #[arg(short, long)]
        server: Option<String>,
        /// Document the call counts against
        #[arg(short, long)]
        document: Option<String>,
        /// Timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Validate the configuration and ping every server once
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "info,runtime=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::load(&cli.config)?;

    match cli.command {
        Commands::Check => cmd_check(&config).await,
        Commands::Servers => cmd_servers(&config).await,
        Commands::Tools { refresh } => cmd_tools(&config, refresh).await,
        Commands::Call {
            tool,
            args,
            server,
            document,
            timeout,
        } => {
            let params = args.as_deref().map(serde_json::from_str).transpose()?;
            let mut request = ExecutionRequest::new(tool, params);
            if let Some(server) = server {
                request = request.with_server(server);
            }
            if let Some(document) = document {
                request = request.with_document(document);
            }
            if let Some(secs) = timeout {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            cmd_call(&config, request).await
        }
    }
}

/// Connect every enabled server and wire discovery to lifecycle events.
async fn connect(config: &RuntimeConfig) -> Result<(ServerConnectionManager, ToolDiscoveryCache)> {
    let manager = ServerConnectionManager::new(config.manager.clone());
    manager.initialize(config.servers.clone()).await?;

    let source: Arc<dyn ToolSource> = Arc::new(manager.clone());
    let discovery = ToolDiscoveryCache::new(source, config.discovery.list_tools_timeout());
    discovery.attach(manager.subscribe());
    Ok((manager, discovery))
}

async fn cmd_check(config: &RuntimeConfig) -> Result<()> {
    println!("Configuration OK: {} server(s)", config.servers.len());
    println!(
        "Limits: {} concurrent, {} per document session\n",
        config.executor.concurrent_limit, config.executor.session_limit
    );

    let (manager, _) = connect(config).await?;
    let outcomes = manager.perform_health_check().await;
    let pinged: Vec<_> = outcomes.iter().map(|o| o.server_id.as_str()).collect();

    for outcome in &outcomes {
        match &outcome.result {
            Ok(rtt) => println!("  {:<20}  ok ({} ms)", outcome.server_id, rtt.as_millis()),
            Err(e) => println!("  {:<20}  FAILED {e}", outcome.server_id),
        }
    }
    for descriptor in manager.descriptors() {
        if pinged.contains(&descriptor.id.as_str()) {
            continue;
        }
        let health = manager.health_status(&descriptor.id)?;
        let reason = if !descriptor.enabled {
            "disabled".to_string()
        } else {
            format!("not connected ({})", health.connection_state)
        };
        println!("  {:<20}  {reason}", descriptor.id);
    }

    manager.shutdown().await;
    Ok(())
}

async fn cmd_servers(config: &RuntimeConfig) -> Result<()> {
    let (manager, _) = connect(config).await?;

    println!(
        "{:<16}  {:<20}  {:<13}  {:<5}  {:<16}  LAST ERROR",
        "ID", "NAME", "STATE", "FAILS", "CONNECTED"
    );
    println!("{}", "-".repeat(96));

    for descriptor in manager.descriptors() {
        let health = manager.health_status(&descriptor.id)?;
        let state = if health.auto_disabled_at.is_some() {
            "auto-disabled".to_string()
        } else {
            health.connection_state.to_string()
        };
        let connected = descriptor
            .last_connected_at
            .map(local_time)
            .unwrap_or_else(|| "-".into());
        let last_error = health.retry_state.last_error.as_deref().unwrap_or("");
        println!(
            "{:<16}  {:<20}  {:<13}  {:<5}  {:<16}  {last_error}",
            descriptor.id,
            descriptor.display_name(),
            state,
            health.consecutive_failures,
            connected
        );
    }

    manager.shutdown().await;
    Ok(())
}

async fn cmd_tools(config: &RuntimeConfig, refresh: bool) -> Result<()> {
    let (manager, discovery) = connect(config).await?;
    let snapshot = discovery.get_snapshot(refresh).await;

    if snapshot.tool_count() == 0 {
        println!("No tools available.");
    } else {
        println!("{:<28}  {:<20}  DESCRIPTION", "TOOL", "SERVER");
        println!("{}", "-".repeat(80));
        for (server, tool) in snapshot.tools() {
            let description = tool.description.lines().next().unwrap_or("");
            println!(
                "{:<28}  {:<20}  {description}",
                tool.name, server.server_name
            );
        }
    }

    let metrics = discovery.metrics();
    println!(
        "\n{} tool(s) from {} server(s); built in {} ms",
        metrics.last_tool_count,
        metrics.last_server_count,
        metrics.last_build_duration.map_or(0, |d| d.as_millis())
    );
    if let Some(error) = &metrics.last_error {
        println!("last discovery error: {error}");
    }

    manager.shutdown().await;
    Ok(())
}

async fn cmd_call(config: &RuntimeConfig, request: ExecutionRequest) -> Result<()> {
    let (manager, discovery) = connect(config).await?;
    let source: Arc<dyn ToolSource> = Arc::new(manager.clone());
    let executor = ToolExecutor::new(&config.executor, source, discovery);

    let cancel = CancellationToken::new();
    let request = request.with_cancel(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = executor.execute_tool(request).await;
    manager.shutdown().await;

    for record in executor.history() {
        eprintln!(
            "[{}] {} {} on {}: {:?} ({} ms){}",
            local_time(record.timestamp),
            record.request_id,
            record.tool_name,
            record.server_id.as_deref().unwrap_or("-"),
            record.status,
            record.duration.map_or(0, |d| d.as_millis()),
            if record.cached { ", cached" } else { "" }
        );
    }

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn local_time(at: DateTime<Utc>) -> String {
    Local
        .from_utc_datetime(&at.naive_utc())
        .format("%Y-%m-%d %H:%M")
        .to_string()
}
