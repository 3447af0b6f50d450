use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use kube::Client;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use capacity_compensator::config::{
    CompensationConfig, LockScopeMode, LockSettings, NodeLabel, PlacementKeys,
    DEFAULT_CAPACITY_NODE_LABEL_KEY, DEFAULT_HIGH_WATER_LEVEL_ANNOTATION, DEFAULT_LOCK_SUFFIX,
    DEFAULT_LOW_WATER_LEVEL_ANNOTATION, DEFAULT_ON_DEMAND_NODE_LABEL_VALUE,
    DEFAULT_SCHEDULE_COMPENSATION_ANNOTATION, DEFAULT_SPOT_NODE_LABEL_VALUE,
    DEFAULT_SPOT_PREFERENCE_WEIGHT,
};
use capacity_compensator::server::{serve, ServerConfig, WebhookState};
use capacity_compensator::Compensator;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Mutating admission webhook that keeps a water level of Deployment replicas
/// on on-demand capacity and leans the rest towards spot nodes.
///
/// A Deployment opts in with the annotations
///   webhook-demo.com/schedule-compensation: "true"
///   webhook-demo.com/low-water-level: "<n>"
///   webhook-demo.com/high-water-level: "<m>"
/// While at most n replicas are pinned to on-demand nodes, a new replica is
/// pinned too; past that it only prefers spot nodes.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// the IP address on which to listen
    #[arg(long, env = "BIND_ADDRESS", default_value_t = IpAddr::from([0, 0, 0, 0]))]
    bind_address: IpAddr,

    /// the secure port on which to serve HTTPS
    #[arg(long, env = "SECURE_PORT", default_value_t = 8443)]
    secure_port: u16,

    /// the directory holding the serving certificate and key
    #[arg(long, default_value = "/tmp/k8s-webhook-server/serving-certs")]
    cert_dir: PathBuf,

    /// the serving certificate file name inside cert-dir
    #[arg(long, default_value_t = String::from("tls.crt"))]
    cert_name: String,

    /// the serving key file name inside cert-dir
    #[arg(long, default_value_t = String::from("tls.key"))]
    key_name: String,

    /// the deployment annotation holding the low water level
    #[arg(long, default_value_t = String::from(DEFAULT_LOW_WATER_LEVEL_ANNOTATION))]
    low_water_level_annotation: String,

    /// the deployment annotation holding the high water level
    #[arg(long, default_value_t = String::from(DEFAULT_HIGH_WATER_LEVEL_ANNOTATION))]
    high_water_level_annotation: String,

    /// the deployment annotation switching compensation on
    #[arg(long, default_value_t = String::from(DEFAULT_SCHEDULE_COMPENSATION_ANNOTATION))]
    schedule_compensation_annotation: String,

    /// the node label key marking on-demand capacity
    #[arg(long, default_value_t = String::from(DEFAULT_CAPACITY_NODE_LABEL_KEY))]
    on_demand_label_key: String,

    /// the node label value marking on-demand capacity
    #[arg(long, default_value_t = String::from(DEFAULT_ON_DEMAND_NODE_LABEL_VALUE))]
    on_demand_label_value: String,

    /// the node label key marking spot capacity
    #[arg(long, default_value_t = String::from(DEFAULT_CAPACITY_NODE_LABEL_KEY))]
    spot_label_key: String,

    /// the node label value marking spot capacity
    #[arg(long, default_value_t = String::from(DEFAULT_SPOT_NODE_LABEL_VALUE))]
    spot_label_value: String,

    /// the weight of the spot preference, 1-100
    #[arg(long, default_value_t = DEFAULT_SPOT_PREFERENCE_WEIGHT,
          value_parser = clap::value_parser!(i32).range(1..=100))]
    spot_weight: i32,

    /// how lock records are named, (generate-name, deployment)
    #[arg(long, default_value_t = LockScopeMode::GenerateName)]
    lock_scope: LockScopeMode,

    /// the suffix appended to lock record names
    #[arg(long, default_value_t = String::from(DEFAULT_LOCK_SUFFIX))]
    lock_suffix: String,

    /// the interval between lock attempts, in milliseconds
    #[arg(long, default_value_t = 3000, value_parser = clap::value_parser!(u64).range(1..))]
    lock_retry_interval_ms: u64,

    /// how long a request waits for the lock before it is rejected, in milliseconds,
    /// capped by the timeout the API server sends with the request
    #[arg(long, default_value_t = 8000)]
    lock_deadline_ms: u64,

    /// the log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn compensation_config(&self) -> CompensationConfig {
        CompensationConfig {
            keys: PlacementKeys {
                low_water_level: self.low_water_level_annotation.clone(),
                high_water_level: self.high_water_level_annotation.clone(),
                schedule_compensation: self.schedule_compensation_annotation.clone(),
                on_demand: NodeLabel::new(&self.on_demand_label_key, &self.on_demand_label_value),
                spot: NodeLabel::new(&self.spot_label_key, &self.spot_label_value),
                spot_weight: self.spot_weight,
            },
            lock: LockSettings {
                suffix: self.lock_suffix.clone(),
                retry_interval: Duration::from_millis(self.lock_retry_interval_ms),
                deadline: Duration::from_millis(self.lock_deadline_ms),
                scope_mode: self.lock_scope,
            },
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: SocketAddr::new(self.bind_address, self.secure_port),
            cert_path: self.cert_dir.join(&self.cert_name),
            key_path: self.cert_dir.join(&self.key_name),
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "capacity-compensator starting");

    let config = args.compensation_config();
    info!(
        lock_scope = %config.lock.scope_mode,
        lock_deadline = ?config.lock.deadline,
        on_demand = %format!("{}={}", config.keys.on_demand.key, config.keys.on_demand.value),
        spot = %format!("{}={}", config.keys.spot.key, config.keys.spot.value),
        "compensation configured"
    );

    let client = Client::try_default().await?;
    let state = Arc::new(WebhookState::new(Compensator::with_client(client, config)));

    serve(args.server_config(), state).await?;

    Ok(())
}
