use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use storage_agent::metrics;
use storage_agent::{
    Agent, AgentCapability, AgentConfig, Isolation, OfferEvent, Resources, spawn_master,
};

#[derive(Parser, Debug)]
#[command(name = "storage-agent")]
#[command(about = "Cluster agent that attaches CSI storage resource providers at runtime")]
struct Args {
    /// Control API listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:5051")]
    listen: String,

    /// Agent id reported to the master (defaults to the host name)
    #[arg(long, env = "AGENT_ID")]
    agent_id: Option<String>,

    /// Agent work directory; the other directories default to it
    #[arg(long, env = "WORK_DIR", default_value = "/var/lib/storage-agent")]
    work_dir: PathBuf,

    /// Resource provider config directory
    #[arg(long, env = "RP_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// CSI plugin container root
    #[arg(long, env = "CSI_ROOT_DIR")]
    csi_root: Option<PathBuf>,

    /// Base directory for plugin endpoint sockets (keep the path short)
    #[arg(long, env = "CSI_ENDPOINT_DIR")]
    endpoint_dir: Option<PathBuf>,

    /// The agent's own resources, e.g. "cpus:4;mem:2048"
    #[arg(long, env = "AGENT_RESOURCES", default_value = "")]
    resources: String,

    /// Agent capabilities (comma separated)
    #[arg(
        long,
        env = "AGENT_CAPABILITIES",
        value_delimiter = ',',
        default_value = "RESOURCE_PROVIDER"
    )]
    capabilities: Vec<String>,

    /// Isolation mode (posix, filesystem/linux)
    #[arg(long, env = "ISOLATION", default_value = "posix")]
    isolation: String,

    /// Seconds to wait for a plugin endpoint to become ready
    #[arg(long, env = "PLUGIN_READY_TIMEOUT", default_value = "10")]
    plugin_ready_timeout: u64,

    /// Seconds between SIGTERM and SIGKILL when stopping a plugin
    #[arg(long, env = "PLUGIN_STOP_TIMEOUT", default_value = "5")]
    plugin_stop_timeout: u64,

    /// Seconds between plugin health checks (0 disables)
    #[arg(long, env = "HEALTH_CHECK_INTERVAL", default_value = "5")]
    health_check_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

impl Args {
    fn agent_config(&self) -> Result<AgentConfig, Box<dyn std::error::Error>> {
        let agent_id = match &self.agent_id {
            Some(id) => id.clone(),
            None => hostname::get()?.to_string_lossy().into_owned(),
        };

        let mut config = AgentConfig::new(agent_id, &self.work_dir);
        if let Some(dir) = &self.config_dir {
            config.config_dir = dir.clone();
        }
        if let Some(dir) = &self.csi_root {
            config.csi_root = dir.clone();
        }
        if let Some(dir) = &self.endpoint_dir {
            config.endpoint_tmp_dir = dir.clone();
        }

        config.capabilities = self
            .capabilities
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| c.parse::<AgentCapability>())
            .collect::<Result<HashSet<_>, _>>()?;
        config.isolation = self.isolation.parse::<Isolation>()?;
        config.default_resources = if self.resources.trim().is_empty() {
            Resources::new()
        } else {
            self.resources.parse()?
        };
        config.plugin_ready_timeout = Duration::from_secs(self.plugin_ready_timeout);
        config.plugin_stop_timeout = Duration::from_secs(self.plugin_stop_timeout);
        config.health_check_interval =
            (self.health_check_interval > 0).then(|| Duration::from_secs(self.health_check_interval));
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let config = args.agent_config()?;
    info!("Starting storage-agent {} on {}", config.agent_id, args.listen);
    info!("Log level: {}", args.log_level);
    info!("Config directory: {}", config.config_dir.display());
    info!("CSI root: {}", config.csi_root.display());
    info!("Isolation: {}", config.isolation);
    info!("Default resources: {}", config.default_resources);

    // The master runs in process; offers are only logged.
    let master = spawn_master();
    let mut events = master.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(OfferEvent::Offered(offer)) => {
                    info!(offer_id = %offer.id, resources = %offer.resources, "Offer made")
                }
                Ok(OfferEvent::Rescinded { offer_id, .. }) => {
                    info!(%offer_id, "Offer rescinded")
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Offer log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let agent = Agent::start(config, master)
        .await
        .map_err(|e| format!("Startup failed: {}", e))?;

    let listener = TcpListener::bind(&args.listen).await?;
    agent
        .server()
        .serve(listener, async {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping plugins...");
        })
        .await?;

    agent.shutdown().await;
    info!("storage-agent shutdown complete");
    Ok(())
}

/// Wait for SIGTERM, SIGINT or SIGHUP.
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    tokio::select! {
        Some(_) = async { sigterm.as_mut()?.recv().await } => {
            info!("Received SIGTERM");
        }
        Some(_) = async { sigint.as_mut()?.recv().await } => {
            info!("Received SIGINT");
        }
        Some(_) = async { sighup.as_mut()?.recv().await } => {
            info!("Received SIGHUP (config reload not implemented, shutting down)");
        }
        else => std::future::pending::<()>().await,
    }
}
