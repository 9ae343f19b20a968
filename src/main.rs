//! zkVRF Orchestrator
//!
//! Off-chain service that monitors EVM chains for randomness requests and
//! automatically fulfills them with verified zero-knowledge proofs. Runs
//! these concurrent subsystems per chain:
//!
//! - **Watcher** — log polling for on-chain request events + startup
//!   catch-up scan.
//! - **Coordinator** — drives each request through entropy mixing, proof
//!   generation, verification and fulfillment.
//! - **Expiry sweeper** — background pass marking overdue requests.
//!
//! Plus a process-wide HTTP server for liveness (`/health`) and
//! readiness (`/status`) probes.

use actix_web::{web, App, HttpResponse, HttpServer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use zkvrf_backend::config::AppConfig;
use zkvrf_backend::coordinator::{Coordinator, CoordinatorOptions};
use zkvrf_backend::entropy::EntropyMixer;
use zkvrf_backend::ledger::{self, EvmConnector, LedgerConnector};
use zkvrf_backend::metrics::Metrics;
use zkvrf_backend::prover::HttpProver;
use zkvrf_backend::store::MemoryStore;
use zkvrf_backend::verifier::HttpVerificationClient;

/// Shared application state accessible from HTTP handlers.
struct AppState {
    metrics: Arc<Metrics>,
    /// Per chain: connector (for health) and in-flight pipeline counter.
    chains: Vec<(Arc<EvmConnector>, Arc<AtomicU64>)>,
}

/// Liveness probe — returns 200 if the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Readiness / status probe — per-chain health, in-flight pipelines and
/// rolling counters.
async fn status(data: web::Data<AppState>) -> HttpResponse {
    let mut chains = serde_json::Map::new();
    for (connector, pending) in &data.chains {
        chains.insert(
            connector.chain_id().to_string(),
            serde_json::json!({
                "healthy": connector.is_healthy(),
                "pending_pipelines": pending.load(Ordering::Relaxed),
            }),
        );
    }
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "chains": chains,
        "metrics": data.metrics.to_json(),
    }))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().expect("invalid configuration");

    info!(
        chains = config.chains.len(),
        oracle = %config.oracle_address,
        "Starting zkVRF orchestrator"
    );
    info!(prover = %config.prover_url, verifier = %config.verifier_url, "External services configured");

    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::new(config.chains.iter().map(|c| c.chain_id)));
    let prover = Arc::new(HttpProver::new(&config.prover_url));
    let verification = Arc::new(HttpVerificationClient::new(
        &config.verifier_url,
        &config.verification_key_id,
    ));

    let mut chain_state = Vec::with_capacity(config.chains.len());

    for chain_config in &config.chains {
        let chain_id = chain_config.chain_id;
        let connector = Arc::new(EvmConnector::new(
            chain_config.clone(),
            &config.oracle_address,
        ));

        let coordinator = Coordinator::new(
            connector.clone(),
            prover.clone(),
            verification.clone(),
            store.clone(),
            EntropyMixer::new(config.mixer_secret.clone()),
            metrics.clone(),
            CoordinatorOptions {
                monitor: config.monitor.clone(),
                submit_retry: config.submit_retry.clone(),
                request_ttl_ms: config.request_ttl_ms,
                concurrency: config.fulfillment_concurrency,
            },
        );

        chain_state.push((connector.clone(), coordinator.pending_count()));

        let (tx, rx) = mpsc::channel(256);

        // Recover persisted in-progress work before touching the chain.
        coordinator.recover().await;

        // Scan for requests that arrived while the backend was offline.
        match connector.scan_backlog().await {
            Ok(events) => {
                info!(chain_id, count = events.len(), "Backlog scan finished");
                for event in events {
                    if tx.send(event).await.is_err() {
                        error!(chain_id, "Event channel closed during backlog scan");
                        break;
                    }
                }
            }
            Err(e) => {
                error!(chain_id, error = %e, "Backlog scan failed, relying on live watch");
            }
        }

        // Background: stream request events into the coordinator.
        let watcher_connector = connector.clone();
        tokio::spawn(async move {
            ledger::run_watcher(watcher_connector, tx).await;
        });

        // Background: consume events and run request pipelines.
        tokio::spawn(coordinator.clone().run(rx));

        // Background: expire overdue requests.
        tokio::spawn(coordinator.run_sweeper(config.expiry_sweep_interval));

        info!(chain_id, "Chain subsystems started");
    }

    let state = web::Data::new(AppState {
        metrics,
        chains: chain_state,
    });

    let bind_addr = ("0.0.0.0", config.http_port);
    info!(addr = %format!("{}:{}", bind_addr.0, bind_addr.1), "Starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health))
            .route("/status", web::get().to(status))
    })
    .bind(bind_addr)?
    .run()
    .await
}
