//! Application configuration loaded from environment variables.
//!
//! Required: `MIXER_SECRET`, `ORACLE_ADDRESS`, `PROVER_URL`, `VERIFIER_URL`,
//!           `CHAIN_IDS`, and per chain `RPC_URL_<id>`, `COORDINATOR_ADDRESS_<id>`
//! Optional: `VERIFICATION_KEY_ID`, `HTTP_PORT`, `FULFILLMENT_CONCURRENCY`,
//!           `REQUEST_TTL_MS`, `EXPIRY_SWEEP_INTERVAL_MS`,
//!           `MONITOR_INITIAL_DELAY_MS`, `MONITOR_POLL_INTERVAL_MS`,
//!           `MONITOR_MAX_ATTEMPTS`, `SUBMIT_MAX_ATTEMPTS`,
//!           `SUBMIT_BASE_DELAY_MS`, `SUBMIT_MAX_DELAY_MS`, and per chain
//!           `CONFIRMATIONS_<id>`, `BLOCK_TIME_MS_<id>`, `BACKLOG_BLOCKS_<id>`

use anyhow::{Context, Result};
use std::time::Duration;

use crate::verifier::{MonitorConfig, SubmitRetryPolicy};

/// Static configuration for one supported chain.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// JSON-RPC endpoint (HTTP).
    pub rpc_url: String,
    /// Address of the on-chain VRF coordinator contract.
    pub coordinator_address: String,
    /// Confirmation depth required before a fulfillment counts.
    pub confirmations: u64,
    /// Expected block time; drives the watcher and confirmation polls.
    pub block_time_ms: u64,
    /// How far back the startup catch-up scan looks.
    pub backlog_blocks: u64,
}

/// Application configuration for the zkVRF orchestrator.
#[derive(Clone)]
pub struct AppConfig {
    pub chains: Vec<ChainConfig>,
    /// Oracle account (held by the node) that pays for fulfillments.
    pub oracle_address: String,
    /// Secret key for the entropy mixer's HMAC derivation.
    pub mixer_secret: Vec<u8>,
    /// Base URL of the proof generation service.
    pub prover_url: String,
    /// Base URL of the proof verification service.
    pub verifier_url: String,
    /// Verification key registered with the verification service.
    pub verification_key_id: String,
    /// HTTP server port.
    pub http_port: u16,
    /// Maximum concurrent request pipelines per chain.
    pub fulfillment_concurrency: usize,
    /// Lifetime granted to a request when the event carries no deadline.
    pub request_ttl_ms: u64,
    /// Cadence of the background expiry sweep.
    pub expiry_sweep_interval: Duration,
    pub monitor: MonitorConfig,
    pub submit_retry: SubmitRetryPolicy,
}

fn optional<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mixer_secret = std::env::var("MIXER_SECRET")
            .context("MIXER_SECRET env var must be set")?
            .into_bytes();

        let oracle_address =
            std::env::var("ORACLE_ADDRESS").context("ORACLE_ADDRESS env var must be set")?;

        let prover_url = std::env::var("PROVER_URL").context("PROVER_URL env var must be set")?;
        let verifier_url =
            std::env::var("VERIFIER_URL").context("VERIFIER_URL env var must be set")?;
        let verification_key_id =
            std::env::var("VERIFICATION_KEY_ID").unwrap_or_else(|_| "zkvrf-groth16-v1".into());

        let chain_ids = std::env::var("CHAIN_IDS").context("CHAIN_IDS env var must be set")?;
        let mut chains = Vec::new();
        for raw in chain_ids.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let chain_id: u64 = raw
                .parse()
                .with_context(|| format!("invalid chain id in CHAIN_IDS: {raw:?}"))?;
            chains.push(ChainConfig {
                chain_id,
                rpc_url: std::env::var(format!("RPC_URL_{chain_id}"))
                    .with_context(|| format!("RPC_URL_{chain_id} env var must be set"))?,
                coordinator_address: std::env::var(format!("COORDINATOR_ADDRESS_{chain_id}"))
                    .with_context(|| {
                        format!("COORDINATOR_ADDRESS_{chain_id} env var must be set")
                    })?,
                confirmations: optional(&format!("CONFIRMATIONS_{chain_id}"), 3),
                block_time_ms: optional(&format!("BLOCK_TIME_MS_{chain_id}"), 2_000),
                backlog_blocks: optional(&format!("BACKLOG_BLOCKS_{chain_id}"), 5_000),
            });
        }
        anyhow::ensure!(!chains.is_empty(), "CHAIN_IDS must name at least one chain");

        let monitor = MonitorConfig {
            initial_delay: Duration::from_millis(optional("MONITOR_INITIAL_DELAY_MS", 5_000)),
            poll_interval: Duration::from_millis(optional("MONITOR_POLL_INTERVAL_MS", 10_000)),
            max_attempts: optional("MONITOR_MAX_ATTEMPTS", 60),
        };

        let submit_retry = SubmitRetryPolicy {
            max_attempts: optional("SUBMIT_MAX_ATTEMPTS", 3),
            base_delay: Duration::from_millis(optional("SUBMIT_BASE_DELAY_MS", 1_000)),
            max_delay: Duration::from_millis(optional("SUBMIT_MAX_DELAY_MS", 10_000)),
        };

        Ok(Self {
            chains,
            oracle_address,
            mixer_secret,
            prover_url,
            verifier_url,
            verification_key_id,
            http_port: optional("HTTP_PORT", 8080),
            fulfillment_concurrency: optional("FULFILLMENT_CONCURRENCY", 4),
            request_ttl_ms: optional("REQUEST_TTL_MS", 3_600_000),
            expiry_sweep_interval: Duration::from_millis(optional(
                "EXPIRY_SWEEP_INTERVAL_MS",
                30_000,
            )),
            monitor,
            submit_retry,
        })
    }
}
