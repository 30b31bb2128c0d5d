//! Tether daemon - management channel of an S3 gateway instance

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tether_agent::{HttpControlApi, HttpStatsSource, ManagementAgent};
use tether_common::settings::{
    ManagementMode, ManagementSettings, RelaySettings, StatsSettings, TunnelTarget,
    DEFAULT_PUSH_ENDPOINT, DEFAULT_RELAY_PORT, DEFAULT_S3_PORT,
};
use tether_common::store::{FileStore, MemoryStore};
use tether_common::telemetry::{init_telemetry, TelemetryConfig};
use tether_common::SharedStore;
use tether_relay::AgentRelay;

/// API path appended to the management endpoint root
const INSTANCE_API_PATH: &str = "/api/v1/instance";

/// Tether - keeps an S3 gateway instance in sync with its control service
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap the instance and run the management transport
    Run(AgentArgs),

    /// Run the management transport and relay applied overlays to local workers
    ///
    /// Workers connect to `ws://{bind}:{port}/watch` and receive every
    /// overlay the agent applies.
    Relay(RelayArgs),
}

/// Management channel arguments
#[derive(Args, Debug, Clone)]
struct AgentArgs {
    /// Control-service root; `/api/v1/instance` is appended
    #[arg(long, env = "MANAGEMENT_ENDPOINT", default_value = "https://api.zenko.io")]
    management_endpoint: String,

    /// Push-service root; sessions open `{root}/{instanceId}/ws`
    #[arg(long, env = "PUSH_ENDPOINT", default_value = DEFAULT_PUSH_ENDPOINT)]
    push_endpoint: String,

    /// Full push URL replacing the derived one
    #[arg(long, env = "CI_ORBIT_PUSH_ENDPOINT")]
    push_url: Option<String>,

    /// Transport: push, poll or none
    #[arg(long, env = "MANAGEMENT_MODE", default_value = "push", value_parser = parse_mode)]
    mode: ManagementMode,

    /// Any value other than "0" disables remote management
    #[arg(long, env = "REMOTE_MANAGEMENT_DISABLE")]
    remote_management_disable: Option<String>,

    /// Token of the local stats endpoint; random when unset
    #[arg(long, env = "REPORT_TOKEN")]
    report_token: Option<String>,

    /// "false" stops stats pushes in push mode
    #[arg(long, env = "PUSH_STATS")]
    push_stats: Option<String>,

    /// Full URL of the local stats report
    #[arg(long, env = "CI_STAT_REPORT_URL")]
    stats_report_url: Option<String>,

    /// Delay before reopening a closed push session, in milliseconds
    #[arg(long, env = "CI_ORBIT_CONNECTION_TIMEOUT_MS", default_value_t = 10_000)]
    reconnect_delay_ms: u64,

    /// Host tunneled connections are forwarded to
    #[arg(long, env = "SECURE_CHANNEL_DEFAULT_FORWARD_TO_HOST", default_value = "localhost")]
    forward_to_host: String,

    /// Port tunneled connections are forwarded to; defaults to the S3 port
    #[arg(long, env = "SECURE_CHANNEL_DEFAULT_FORWARD_TO_PORT")]
    forward_to_port: Option<u16>,

    /// Port of the local S3 listener
    #[arg(long, env = "S3_PORT", default_value_t = DEFAULT_S3_PORT)]
    s3_port: u16,

    /// Timeout of control-service requests in seconds
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,

    /// Metadata store: `memory` or `file:<dir>`
    #[arg(long, env = "TETHER_STORE", default_value = "memory")]
    store: StoreBackend,
}

/// Relay arguments
#[derive(Args, Debug, Clone)]
struct RelayArgs {
    #[command(flatten)]
    agent: AgentArgs,

    /// Relay listen address
    #[arg(long, env = "RELAY_BIND_HOST", default_value = "0.0.0.0")]
    bind_host: String,

    /// Relay listen port
    #[arg(long, env = "RELAY_PORT", default_value_t = DEFAULT_RELAY_PORT)]
    port: u16,
}

/// Metadata store backend
#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreBackend {
    Memory,
    File(PathBuf),
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "memory" => Ok(StoreBackend::Memory),
            Some(("file", dir)) if !dir.is_empty() => Ok(StoreBackend::File(PathBuf::from(dir))),
            _ => Err(format!("unknown store '{}' (expected memory or file:<dir>)", s)),
        }
    }
}

impl StoreBackend {
    fn open(&self) -> SharedStore {
        match self {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::File(dir) => Arc::new(FileStore::new(dir.clone())),
        }
    }
}

fn parse_mode(s: &str) -> Result<ManagementMode, String> {
    s.parse().map_err(|e: tether_common::Error| e.to_string())
}

impl AgentArgs {
    fn effective_mode(&self) -> ManagementMode {
        match self.remote_management_disable.as_deref() {
            Some(flag) if !flag.is_empty() && flag != "0" => ManagementMode::Disabled,
            _ => self.mode,
        }
    }

    fn settings(&self) -> ManagementSettings {
        let report_token = self
            .report_token
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut stats = StatsSettings::for_port(self.s3_port, report_token);
        if let Some(url) = &self.stats_report_url {
            stats.report_url = url.clone();
        }
        stats.enabled = self.push_stats.as_deref() != Some("false");

        ManagementSettings {
            mode: self.effective_mode(),
            management_endpoint: format!(
                "{}{}",
                self.management_endpoint.trim_end_matches('/'),
                INSTANCE_API_PATH
            ),
            push_endpoint: self.push_endpoint.clone(),
            push_url_override: self.push_url.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            stats,
            tunnel: TunnelTarget {
                host: self.forward_to_host.clone(),
                port: self.forward_to_port.unwrap_or(self.s3_port),
            },
            ..Default::default()
        }
    }

    fn build_agent(&self) -> anyhow::Result<ManagementAgent> {
        let settings = self.settings();
        settings.validate()?;

        let api = HttpControlApi::new(settings.management_endpoint.clone(), settings.request_timeout)?;
        let stats = HttpStatsSource::new(settings.stats.clone(), settings.request_timeout)?;
        Ok(ManagementAgent::new(
            self.store.open(),
            settings,
            Arc::new(api),
            Arc::new(stats),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs, shared by reqwest
    // and the WebSocket client
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}. \
             The management channel cannot open TLS connections without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let service_name = match &cli.command {
        Commands::Run(_) => "tether-agent",
        Commands::Relay(_) => "tether-relay",
    };
    init_telemetry(TelemetryConfig::from_env(service_name))
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    match cli.command {
        Commands::Run(args) => run_agent(args, shutdown).await,
        Commands::Relay(args) => run_relay(args, shutdown).await,
    }
}

/// Bootstrap and run the transport until shutdown
async fn run_agent(args: AgentArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let agent = args.build_agent()?;
    info!(mode = %agent.mode(), "Starting management agent");
    agent.run(shutdown).await;
    info!("Management agent stopped");
    Ok(())
}

/// Bootstrap, then run the transport next to the relay server
async fn run_relay(args: RelayArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let agent = Arc::new(args.agent.build_agent()?);
    let Some(outcome) = agent.bootstrap(&shutdown).await else {
        info!("Shutdown before bootstrap completed");
        return Ok(());
    };

    let relay_settings = RelaySettings {
        bind_host: args.bind_host.clone(),
        port: args.port,
        ..Default::default()
    };
    // Subscribe before the transport can apply anything
    let relay = AgentRelay::new(
        relay_settings,
        agent.reconciler().clone(),
        outcome.loaded_overlay.clone(),
    );
    let listener = relay.bind().await?;

    let transport = {
        let agent = agent.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run_transport(&outcome, shutdown).await })
    };

    let served = relay.serve(listener, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = transport.await {
        error!(error = %e, "Management transport task failed");
    }
    served?;
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => warn!("ctrl-c received, shutting down"),
                    _ = term.recv() => warn!("SIGTERM received, shutting down"),
                }
            }
            Err(e) => {
                error!(error = %e, "Could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                warn!("ctrl-c received, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        warn!("ctrl-c received, shutting down");
    }
    shutdown.cancel();
}
