//! Ledger connector — one read/write EVM JSON-RPC connection per chain.
//!
//! Two complementary strategies ensure no requests are missed:
//!
//! 1. **Catch-up scan** ([`EvmConnector::scan_backlog`]) — on startup,
//!    queries `eth_getLogs` over a recent block window for request events
//!    that arrived while the backend was offline.
//!
//! 2. **Live watch** ([`run_watcher`]) — polls `eth_getLogs` over a moving
//!    block cursor at the chain's block-time cadence and forwards decoded
//!    events to the coordinator. RPC failures flip the chain's health flag
//!    and back off; they never escape the loop, so one broken chain cannot
//!    take the others down.

use anyhow::{Context, Result};
use async_trait::async_trait;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tiny_keccak::{Hasher, Keccak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ChainConfig;
use crate::entropy::ChainEntropy;
use crate::prover::SolidityProof;

/// Solidity event emitted by the on-chain coordinator for each request.
const REQUEST_EVENT_SIGNATURE: &str = "RandomnessRequested(uint256,address,bytes32,uint256)";

/// Emitted by the coordinator when the consumer callback reverted. The
/// fulfillment itself still stands.
const CALLBACK_FAILED_SIGNATURE: &str = "CallbackFailed(uint256)";

/// Fulfillment entrypoint: request id, Groth16 points, two public inputs.
const FULFILL_FN_SIGNATURE: &str =
    "fulfillRandomness(uint256,uint256[2],uint256[2][2],uint256[2],uint256[2])";

/// View used to guard against double fulfillment after a restart.
const IS_FULFILLED_FN_SIGNATURE: &str = "isFulfilled(uint256)";

/// Gas safety margin applied on top of the provider's estimate, percent.
const GAS_MARGIN_PERCENT: u64 = 20;

/// Receipt polls before giving up on a submitted transaction.
const RECEIPT_MAX_POLLS: u32 = 60;

/// Confirmation polls before giving up.
const CONFIRMATION_MAX_POLLS: u32 = 120;

/// A randomness request event observed on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    pub chain_id: u64,
    pub on_chain_id: u64,
    /// `0x`-prefixed 20-byte requester address.
    pub requester: String,
    /// `0x`-prefixed 32-byte seed.
    pub seed: String,
    /// Fee paid, in wei.
    pub fee: u128,
    pub block_number: u64,
}

/// Block header fields the mixer and the watcher care about.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: String,
    pub timestamp: u64,
}

/// Best-effort consumer callback result. Never affects the request's
/// terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Delivered,
    Failed(String),
}

/// Confirmed fulfillment transaction.
#[derive(Debug, Clone)]
pub struct FulfillmentReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    pub gas_used: u64,
    /// `None` when the request carried no callback.
    pub callback: Option<CallbackOutcome>,
}

/// Read/write boundary to one ledger.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn latest_block(&self) -> Result<BlockInfo>;

    /// Entropy inputs from the chain head. Callers fall back to a local
    /// pseudo-block when this fails.
    async fn chain_entropy(&self) -> Result<ChainEntropy> {
        let block = self.latest_block().await?;
        Ok(ChainEntropy {
            block_hash: block.hash,
            block_number: block.number,
            timestamp: block.timestamp,
            fallback: false,
        })
    }

    /// Whether the on-chain contract already recorded a fulfillment for
    /// this request. Checked before submitting, so a restart after a
    /// partially observed fulfillment cannot submit twice.
    async fn request_fulfilled(&self, on_chain_id: u64) -> Result<bool>;

    /// Build, submit and confirm the fulfillment transaction.
    async fn submit_fulfillment(
        &self,
        on_chain_id: u64,
        proof: &SolidityProof,
        public_inputs: &[String],
        has_callback: bool,
    ) -> Result<FulfillmentReceipt>;

    /// Suspend until `latest - block_number >= confirmations`.
    async fn wait_for_confirmations(&self, block_number: u64, confirmations: u64) -> Result<()>;

    fn is_healthy(&self) -> bool;
}

// ---------------------------------------------------------------------------
// ABI helpers
// ---------------------------------------------------------------------------

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

/// `0x`-prefixed keccak topic for an event signature.
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

/// 4-byte function selector for a function signature.
fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Parse a `0x`-prefixed hex quantity into u64.
fn parse_quantity(s: &str) -> Result<u64> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(trimmed, 16).with_context(|| format!("invalid hex quantity {s:?}"))
}

/// Parse a 32-byte hex word into u64 (low 8 bytes).
fn word_to_u64(word: &str) -> Result<u64> {
    let bytes = word_bytes(word)?;
    Ok(u64::from_be_bytes(bytes[24..32].try_into().unwrap()))
}

/// Parse a 32-byte hex word into u128 (low 16 bytes).
fn word_to_u128(word: &str) -> Result<u128> {
    let bytes = word_bytes(word)?;
    Ok(u128::from_be_bytes(bytes[16..32].try_into().unwrap()))
}

fn word_bytes(word: &str) -> Result<[u8; 32]> {
    let trimmed = word.strip_prefix("0x").unwrap_or(word);
    anyhow::ensure!(trimmed.len() == 64, "expected a 32-byte word, got {word:?}");
    let decoded = hex::decode(trimmed).with_context(|| format!("invalid hex word {word:?}"))?;
    Ok(decoded.try_into().expect("length checked above"))
}

/// Last 20 bytes of a topic word, as a checksummed-free address string.
fn word_to_address(word: &str) -> Result<String> {
    let bytes = word_bytes(word)?;
    Ok(format!("0x{}", hex::encode(&bytes[12..32])))
}

/// Encode a decimal field element into a 32-byte ABI word.
fn encode_decimal_word(value: &str) -> Result<[u8; 32]> {
    let parsed = BigUint::parse_bytes(value.as_bytes(), 10)
        .with_context(|| format!("not a decimal value: {value:?}"))?;
    let bytes = parsed.to_bytes_be();
    anyhow::ensure!(bytes.len() <= 32, "value does not fit a 256-bit word");
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(word)
}

/// Build the `fulfillRandomness` calldata: selector + 11 static words
/// (request id, a[2], b[2][2], c[2], publicInputs[2]).
pub fn encode_fulfillment_calldata(
    on_chain_id: u64,
    proof: &SolidityProof,
    public_inputs: &[String],
) -> Result<Vec<u8>> {
    anyhow::ensure!(
        public_inputs.len() >= 2,
        "fulfillment needs the random value and the auxiliary commitment, got {} signals",
        public_inputs.len()
    );

    let mut data = Vec::with_capacity(4 + 11 * 32);
    data.extend_from_slice(&selector(FULFILL_FN_SIGNATURE));

    let mut id_word = [0u8; 32];
    id_word[24..].copy_from_slice(&on_chain_id.to_be_bytes());
    data.extend_from_slice(&id_word);

    for coord in proof.a.iter() {
        data.extend_from_slice(&encode_decimal_word(coord)?);
    }
    for row in proof.b.iter() {
        for coord in row {
            data.extend_from_slice(&encode_decimal_word(coord)?);
        }
    }
    for coord in proof.c.iter() {
        data.extend_from_slice(&encode_decimal_word(coord)?);
    }
    for signal in &public_inputs[..2] {
        data.extend_from_slice(&encode_decimal_word(signal)?);
    }
    Ok(data)
}

/// Apply the fixed safety margin to a gas estimate.
fn with_gas_margin(estimate: u64) -> u64 {
    estimate.saturating_mul(100 + GAS_MARGIN_PERCENT) / 100
}

// ---------------------------------------------------------------------------
// JSON-RPC types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
struct RpcBlock {
    number: String,
    hash: String,
    timestamp: String,
}

#[derive(Deserialize, Debug, Clone)]
struct RpcLog {
    topics: Vec<String>,
    data: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
}

#[derive(Deserialize, Debug)]
struct RpcReceipt {
    status: Option<String>,
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(rename = "gasUsed")]
    gas_used: String,
    logs: Vec<RpcLog>,
}

// ---------------------------------------------------------------------------
// EVM connector
// ---------------------------------------------------------------------------

/// JSON-RPC connector for one EVM chain.
pub struct EvmConnector {
    config: ChainConfig,
    /// Oracle account held by the node; `from` for fulfillment txs.
    oracle_address: String,
    http: reqwest::Client,
    healthy: AtomicBool,
}

impl EvmConnector {
    pub fn new(config: ChainConfig, oracle_address: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            config,
            oracle_address: oracle_address.to_string(),
            http,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn block_time(&self) -> Duration {
        Duration::from_millis(self.config.block_time_ms)
    }

    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        self.rpc_optional(method, params)
            .await?
            .with_context(|| format!("{method} returned null result without error"))
    }

    /// Like [`Self::rpc`], but a null result is a legal answer
    /// (`eth_getTransactionReceipt` before the transaction is mined).
    async fn rpc_optional<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let send_result = self
            .http
            .post(&self.config.rpc_url)
            .json(&req)
            .send()
            .await;

        let resp = match send_result {
            Ok(r) => r,
            Err(e) => {
                self.healthy.store(false, Ordering::Relaxed);
                return Err(e).with_context(|| format!("{method} request failed"));
            }
        };

        let parsed: JsonRpcResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {method} response"))?;

        if let Some(err) = parsed.error {
            anyhow::bail!("{method} rejected by provider ({}): {}", err.code, err.message);
        }

        self.healthy.store(true, Ordering::Relaxed);
        Ok(parsed.result)
    }

    async fn block_number(&self) -> Result<u64> {
        let raw: String = self.rpc("eth_blockNumber", json!([])).await?;
        parse_quantity(&raw)
    }

    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<RequestEvent>> {
        let topic = event_topic(REQUEST_EVENT_SIGNATURE);
        let params = json!([{
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
            "address": self.config.coordinator_address,
            "topics": [topic],
        }]);
        let logs: Vec<RpcLog> = self.rpc("eth_getLogs", params).await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_request_log(self.config.chain_id, log) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    chain_id = self.config.chain_id,
                    error = %e,
                    "Failed to decode request log, skipping"
                ),
            }
        }
        Ok(events)
    }

    /// Scan a recent block window for request events that arrived while
    /// the backend was offline.
    pub async fn scan_backlog(&self) -> Result<Vec<RequestEvent>> {
        let latest = self.block_number().await?;
        let from = latest.saturating_sub(self.config.backlog_blocks);
        info!(
            chain_id = self.config.chain_id,
            from, to = latest,
            "Scanning backlog for unprocessed requests"
        );
        self.get_logs(from, latest).await
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<RpcReceipt>> {
        self.rpc_optional("eth_getTransactionReceipt", json!([tx_hash]))
            .await
    }
}

/// Decode one `RandomnessRequested` log into a [`RequestEvent`].
///
/// Topic layout: `[signature, requestId, requester]`; data carries two
/// words, the 32-byte seed and the fee.
fn decode_request_log(chain_id: u64, log: &RpcLog) -> Result<RequestEvent> {
    anyhow::ensure!(
        log.topics.len() == 3,
        "expected 3 topics, got {}",
        log.topics.len()
    );

    let on_chain_id = word_to_u64(&log.topics[1])?;
    let requester = word_to_address(&log.topics[2])?;

    let data = log.data.strip_prefix("0x").unwrap_or(&log.data);
    anyhow::ensure!(
        data.len() == 128,
        "expected 2 data words, got {} hex chars",
        data.len()
    );
    let seed = format!("0x{}", &data[..64]);
    let fee = word_to_u128(&data[64..128])?;

    Ok(RequestEvent {
        chain_id,
        on_chain_id,
        requester,
        seed,
        fee,
        block_number: parse_quantity(&log.block_number)?,
    })
}

#[async_trait]
impl LedgerConnector for EvmConnector {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn latest_block(&self) -> Result<BlockInfo> {
        let block: RpcBlock = self
            .rpc("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        Ok(BlockInfo {
            number: parse_quantity(&block.number)?,
            hash: block.hash,
            timestamp: parse_quantity(&block.timestamp)?,
        })
    }

    async fn request_fulfilled(&self, on_chain_id: u64) -> Result<bool> {
        let mut data = Vec::with_capacity(4 + 32);
        data.extend_from_slice(&selector(IS_FULFILLED_FN_SIGNATURE));
        let mut word = [0u8; 32];
        word[24..].copy_from_slice(&on_chain_id.to_be_bytes());
        data.extend_from_slice(&word);

        let result: String = self
            .rpc(
                "eth_call",
                json!([{
                    "to": self.config.coordinator_address,
                    "data": format!("0x{}", hex::encode(&data)),
                }, "latest"]),
            )
            .await?;
        Ok(word_to_u64(&result).unwrap_or(0) != 0)
    }

    async fn submit_fulfillment(
        &self,
        on_chain_id: u64,
        proof: &SolidityProof,
        public_inputs: &[String],
        has_callback: bool,
    ) -> Result<FulfillmentReceipt> {
        let calldata = encode_fulfillment_calldata(on_chain_id, proof, public_inputs)?;
        let data_hex = format!("0x{}", hex::encode(&calldata));

        let tx = json!({
            "from": self.oracle_address,
            "to": self.config.coordinator_address,
            "data": data_hex,
        });

        let estimate_raw: String = self
            .rpc("eth_estimateGas", json!([tx]))
            .await
            .context("gas estimation rejected")?;
        let gas_limit = with_gas_margin(parse_quantity(&estimate_raw)?);

        let tx_with_gas = json!({
            "from": self.oracle_address,
            "to": self.config.coordinator_address,
            "data": data_hex,
            "gas": format!("0x{gas_limit:x}"),
        });

        let tx_hash: String = self
            .rpc("eth_sendTransaction", json!([tx_with_gas]))
            .await
            .context("fulfillment transaction rejected by provider")?;

        info!(
            chain_id = self.config.chain_id,
            on_chain_id,
            tx = %tx_hash,
            gas_limit,
            "Fulfillment transaction submitted"
        );

        // Poll for the receipt at block-time cadence.
        let mut receipt = None;
        for _ in 0..RECEIPT_MAX_POLLS {
            if let Some(r) = self.transaction_receipt(&tx_hash).await? {
                receipt = Some(r);
                break;
            }
            tokio::time::sleep(self.block_time()).await;
        }
        let receipt = receipt
            .with_context(|| format!("no receipt for {tx_hash} after {RECEIPT_MAX_POLLS} polls"))?;

        let status = receipt.status.as_deref().unwrap_or("0x0");
        anyhow::ensure!(
            status == "0x1",
            "fulfillment transaction {tx_hash} reverted"
        );

        let block_number = parse_quantity(&receipt.block_number)?;
        self.wait_for_confirmations(block_number, self.config.confirmations)
            .await?;

        // Best-effort callback result: the coordinator contract emits
        // CallbackFailed when the consumer reverted.
        let callback = if has_callback {
            let failed_topic = event_topic(CALLBACK_FAILED_SIGNATURE);
            let failed = receipt
                .logs
                .iter()
                .any(|l| l.topics.first().map(String::as_str) == Some(failed_topic.as_str()));
            Some(if failed {
                CallbackOutcome::Failed("consumer callback reverted".into())
            } else {
                CallbackOutcome::Delivered
            })
        } else {
            None
        };

        Ok(FulfillmentReceipt {
            transaction_hash: tx_hash,
            block_number,
            gas_used: parse_quantity(&receipt.gas_used)?,
            callback,
        })
    }

    async fn wait_for_confirmations(&self, block_number: u64, confirmations: u64) -> Result<()> {
        for _ in 0..CONFIRMATION_MAX_POLLS {
            let latest = self.block_number().await?;
            if latest >= block_number + confirmations {
                return Ok(());
            }
            tokio::time::sleep(self.block_time()).await;
        }
        anyhow::bail!(
            "block {block_number} not confirmed to depth {confirmations} after {CONFIRMATION_MAX_POLLS} polls"
        )
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// Watch one chain for request events and forward them to the
/// coordinator. Never returns; RPC failures back off and resume.
pub async fn run_watcher(connector: Arc<EvmConnector>, tx: mpsc::Sender<RequestEvent>) {
    let chain_id = connector.chain_id();
    let poll = connector.block_time();

    let mut cursor = loop {
        match connector.block_number().await {
            Ok(n) => break n.saturating_add(1),
            Err(e) => {
                error!(chain_id, error = %e, "Cannot reach RPC endpoint, retrying");
                tokio::time::sleep(poll.max(Duration::from_secs(5))).await;
            }
        }
    };

    info!(chain_id, from_block = cursor, "Watching for request events");

    loop {
        match connector.block_number().await {
            Ok(latest) if latest >= cursor => {
                match connector.get_logs(cursor, latest).await {
                    Ok(events) => {
                        for event in events {
                            debug!(
                                chain_id,
                                on_chain_id = event.on_chain_id,
                                block = event.block_number,
                                "Observed request event"
                            );
                            if tx.send(event).await.is_err() {
                                error!(chain_id, "Event channel closed, stopping watcher");
                                return;
                            }
                        }
                        cursor = latest + 1;
                    }
                    Err(e) => {
                        warn!(chain_id, error = %e, "Log query failed, will retry");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(chain_id, error = %e, "Block number query failed, chain marked unhealthy");
            }
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prover::sample_proof;

    #[test]
    fn parses_hex_quantities() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn gas_margin_is_twenty_percent() {
        assert_eq!(with_gas_margin(100_000), 120_000);
        assert_eq!(with_gas_margin(0), 0);
    }

    #[test]
    fn decodes_a_request_log() {
        let log = RpcLog {
            topics: vec![
                event_topic(REQUEST_EVENT_SIGNATURE),
                format!("0x{:064x}", 42u64),
                format!("0x{}{}", "00".repeat(12), "11".repeat(20)),
            ],
            data: format!("0x{}{:064x}", "aa".repeat(32), 5_000u64),
            block_number: "0x10".into(),
        };
        let event = decode_request_log(84532, &log).unwrap();
        assert_eq!(event.chain_id, 84532);
        assert_eq!(event.on_chain_id, 42);
        assert_eq!(event.requester, format!("0x{}", "11".repeat(20)));
        assert_eq!(event.seed, format!("0x{}", "aa".repeat(32)));
        assert_eq!(event.fee, 5_000);
        assert_eq!(event.block_number, 16);
    }

    #[test]
    fn rejects_malformed_logs() {
        let log = RpcLog {
            topics: vec![event_topic(REQUEST_EVENT_SIGNATURE)],
            data: "0x".into(),
            block_number: "0x10".into(),
        };
        assert!(decode_request_log(1, &log).is_err());
    }

    #[test]
    fn fulfillment_calldata_has_fixed_layout() {
        let proof = sample_proof("4").to_calldata();
        let signals = vec!["12345".to_string(), "67890".to_string()];
        let data = encode_fulfillment_calldata(7, &proof, &signals).unwrap();
        // selector + 11 static words
        assert_eq!(data.len(), 4 + 11 * 32);
        assert_eq!(&data[..4], &selector(FULFILL_FN_SIGNATURE));
        // request id lands in the first word
        assert_eq!(data[4 + 31], 7);
        // random value 12345 = 0x3039 lands in the 10th word
        let word10 = &data[4 + 9 * 32..4 + 10 * 32];
        assert_eq!(&word10[30..], &[0x30, 0x39]);
    }

    #[test]
    fn fulfillment_needs_two_public_inputs() {
        let proof = sample_proof("4").to_calldata();
        let one = vec!["12345".to_string()];
        assert!(encode_fulfillment_calldata(7, &proof, &one).is_err());
    }

    #[test]
    fn encodes_large_field_elements() {
        let word = encode_decimal_word(
            "21888242871839275222246405745257275088548364400416034343698204186575808495616",
        )
        .unwrap();
        assert_eq!(word.len(), 32);
        assert!(encode_decimal_word("not-a-number").is_err());
    }
}
