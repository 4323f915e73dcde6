use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use localization_types::{AnchorConfig, Vec3};
use uwb_localization_core::config::{BinnerConfig, IngressConfig, SolverConfig};
use uwb_localization_core::ingress::run_ingress;
use uwb_localization_core::publisher::{log_diagnostics, PublishedPosition};
use uwb_localization_core::{pgo, Binner, PositionPublisher};

/// Ingests per-anchor UWB vectors over MQTT and publishes the solved phone
/// position at roughly 1 Hz.
#[derive(Parser, Debug)]
#[command(name = "uwb-localization-server")]
struct Cli {
    /// MQTT broker host.
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port.
    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,

    /// Path to a JSON file mapping anchor_id -> {x,y,z} (centimeters).
    /// Defaults to the canonical four-corner layout when omitted.
    #[arg(long)]
    anchor_config: Option<PathBuf>,

    /// Sliding-window size in seconds.
    #[arg(long, default_value_t = 1.0)]
    window_seconds: f64,

    /// Bind address for the optional health/position HTTP surface. Omit to
    /// run ingestion-only.
    #[arg(long)]
    http_addr: Option<SocketAddr>,
}

fn load_anchor_config(path: &Option<PathBuf>) -> anyhow::Result<AnchorConfig> {
    match path {
        Some(path) => {
            let data = std::fs::read_to_string(path)?;
            let positions: HashMap<u8, Vec3> = serde_json::from_str(&data)?;
            Ok(AnchorConfig::new(positions))
        }
        None => Ok(AnchorConfig::canonical()),
    }
}

fn receive_time_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

struct HttpState {
    publisher: Arc<PositionPublisher>,
}

async fn health() -> &'static str {
    "ok"
}

async fn position(State(state): State<Arc<HttpState>>) -> Json<Option<PositionResponse>> {
    Json(state.publisher.current().map(PositionResponse::from))
}

#[derive(serde::Serialize)]
struct PositionResponse {
    phone_id: u8,
    position: [f64; 3],
    error: f64,
    n_edges: usize,
    n_phone_edges: usize,
    n_anchor_edges: usize,
}

impl From<PublishedPosition> for PositionResponse {
    fn from(p: PublishedPosition) -> Self {
        Self {
            phone_id: p.phone_id,
            position: [p.position.x, p.position.y, p.position.z],
            error: p.residual_cost,
            n_edges: p.n_edges,
            n_phone_edges: p.n_phone_edges,
            n_anchor_edges: p.n_anchor_edges,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "uwb_localization_server=info,uwb_localization_core=info".into()
        }))
        .init();

    let cli = Cli::parse();
    let anchor_config = Arc::new(load_anchor_config(&cli.anchor_config)?);

    let binner_config = BinnerConfig {
        window_size_seconds: cli.window_seconds,
        ..BinnerConfig::from_env()
    };
    let solver_config = SolverConfig::default();
    let ingress_config = IngressConfig {
        broker_host: cli.mqtt_host.clone(),
        broker_port: cli.mqtt_port,
        ..IngressConfig::default()
    };

    const PHONE_ID: u8 = 0;
    let binner = Arc::new(Mutex::new(Binner::new(PHONE_ID, binner_config)));
    let publisher = Arc::new(PositionPublisher::new());
    let stop = Arc::new(AtomicBool::new(false));

    let ingress_binner = Arc::clone(&binner);
    let ingress_stop = Arc::clone(&stop);
    let ingress_handle = thread::spawn(move || {
        run_ingress(
            ingress_config,
            move |measurement| {
                let now = receive_time_seconds();
                let mut binner = ingress_binner.lock().expect("binner mutex poisoned");
                if let Err(reason) = binner.add_measurement(measurement, now) {
                    tracing::debug!(%reason, "measurement rejected");
                }
            },
            ingress_stop,
        );
    });

    let processor_binner = Arc::clone(&binner);
    let processor_publisher = Arc::clone(&publisher);
    let processor_stop = Arc::clone(&stop);
    let processor_anchors = Arc::clone(&anchor_config);
    let processor_handle = thread::spawn(move || {
        let mut last_reported_total = 0u64;
        loop {
            if processor_stop.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(Duration::from_millis(10));

            let bin = {
                let binner = processor_binner.lock().expect("binner mutex poisoned");
                binner.create_binned_data(PHONE_ID)
            };

            if let Some(bin) = bin {
                let n_phone_edges = bin.measurements.values().filter(|v| !v.is_empty()).count();
                let n = processor_anchors.len();
                let n_anchor_edges = n.saturating_sub(1) * n;

                match pgo::solve_bin(&bin, &processor_anchors, solver_config) {
                    Ok(result) => {
                        processor_publisher.publish(PHONE_ID, &result, n_phone_edges, n_anchor_edges);
                    }
                    Err(e) => warn!("bin skipped: {e}"),
                }
            }

            let total = processor_binner
                .lock()
                .expect("binner mutex poisoned")
                .metrics()
                .total_measurements;
            if total > 0 && total / 100 != last_reported_total / 100 {
                let metrics = processor_binner
                    .lock()
                    .expect("binner mutex poisoned")
                    .metrics()
                    .clone();
                log_diagnostics(PHONE_ID, &metrics);
            }
            last_reported_total = total;
        }
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_until_shutdown(cli.http_addr, Arc::clone(&publisher)))?;

    stop.store(true, Ordering::Relaxed);
    ingress_handle.join().ok();
    processor_handle.join().ok();

    Ok(())
}

async fn run_until_shutdown(
    http_addr: Option<SocketAddr>,
    publisher: Arc<PositionPublisher>,
) -> anyhow::Result<()> {
    match http_addr {
        Some(addr) => {
            let state = Arc::new(HttpState { publisher });
            let app = Router::new()
                .route("/health", get(health))
                .route("/position", get(position))
                .with_state(state);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("ops http surface listening on {addr}");
            tokio::select! {
                result = axum::serve(listener, app) => { result?; }
                _ = tokio::signal::ctrl_c() => { info!("shutdown signal received"); }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received");
        }
    }
    Ok(())
}
