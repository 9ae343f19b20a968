//! Verification service client — proof submission with bounded backoff,
//! and the job monitor that polls a submitted job to a terminal state.
//!
//! A definitive rejection (4xx-equivalent) is never retried; transient
//! network failures are, up to a small fixed attempt budget.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{Stage, StageError};
use crate::prover::Groth16Proof;

/// HTTP timeout for verification service calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Job states reported by the verification service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Submitted,
    Aggregated,
    Finalized,
    Failed,
    /// Anything the service adds later; treated as still-in-progress.
    Other(String),
}

impl JobState {
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => JobState::Pending,
            "submitted" => JobState::Submitted,
            "aggregated" => JobState::Aggregated,
            "finalized" => JobState::Finalized,
            "failed" => JobState::Failed,
            other => JobState::Other(other.to_string()),
        }
    }

    /// `aggregated` and `finalized` are both terminal success.
    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Aggregated | JobState::Finalized)
    }
}

/// One poll result for a verification job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: JobState,
    pub transaction_hash: Option<String>,
    pub error: Option<String>,
}

/// Submission failure split the way the retry loop needs it.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Definitive rejection; the proof will never be accepted.
    #[error("verification service rejected the proof: {0}")]
    Rejected(String),
    /// Network-level or 5xx failure; worth another attempt.
    #[error("transient verification service failure: {0}")]
    Transient(String),
}

/// Verification service boundary.
#[async_trait]
pub trait VerificationApi: Send + Sync {
    /// Submit a proof for verification on `chain_id`; returns the job id.
    async fn submit(
        &self,
        proof: &Groth16Proof,
        public_signals: &[String],
        chain_id: u64,
    ) -> Result<String, SubmitError>;

    /// Query the current state of a job.
    async fn job_status(&self, job_id: &str) -> Result<JobStatus>;
}

/// Retry tuning for proof submission.
#[derive(Debug, Clone)]
pub struct SubmitRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for SubmitRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Validate the proof shape, then submit with exponential backoff on
/// transient failures. Rejections are returned immediately.
pub async fn submit_with_retries(
    api: &dyn VerificationApi,
    proof: &Groth16Proof,
    public_signals: &[String],
    chain_id: u64,
    policy: &SubmitRetryPolicy,
) -> Result<String, StageError> {
    proof
        .validate()
        .and_then(|_| {
            anyhow::ensure!(!public_signals.is_empty(), "public-signal list is empty");
            Ok(())
        })
        .map_err(|e| StageError::Validation {
            stage: Stage::Submission,
            message: e.to_string(),
        })?;

    let mut delay = policy.base_delay;
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        match api.submit(proof, public_signals, chain_id).await {
            Ok(job_id) => {
                info!(chain_id, job_id = %job_id, attempt, "Proof submitted for verification");
                return Ok(job_id);
            }
            Err(SubmitError::Rejected(reason)) => {
                return Err(StageError::ProofRejected { message: reason });
            }
            Err(SubmitError::Transient(reason)) => {
                warn!(chain_id, attempt, error = %reason, "Submission failed, will retry");
                last_error = reason;
                if attempt < policy.max_attempts {
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2).min(policy.max_delay);
                }
            }
        }
    }

    Err(StageError::RetriesExhausted {
        stage: Stage::Submission,
        attempts: policy.max_attempts,
        message: last_error,
    })
}

/// Polling cadence for the job monitor. Injectable so tests can run the
/// whole budget in milliseconds.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay before the first poll, so a just-created job is not hammered.
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            max_attempts: 60,
        }
    }
}

/// Terminal outcome of watching one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Verified {
        transaction_hash: Option<String>,
        polls: u32,
    },
    Failed {
        reason: String,
        polls: u32,
    },
    /// Attempt budget exhausted without a terminal state. Ends in the
    /// same `failed` request status as an explicit failure but with a
    /// distinct error code.
    TimedOut {
        attempts: u32,
    },
}

/// Poll a job until it terminates or the attempt budget runs out.
///
/// Transient polling errors consume an attempt and retry, exactly like a
/// non-terminal state.
pub async fn watch_job(
    api: &dyn VerificationApi,
    job_id: &str,
    config: &MonitorConfig,
) -> JobOutcome {
    tokio::time::sleep(config.initial_delay).await;

    for attempt in 1..=config.max_attempts {
        match api.job_status(job_id).await {
            Ok(status) if status.state.is_success() => {
                info!(job_id, polls = attempt, "Verification job succeeded");
                return JobOutcome::Verified {
                    transaction_hash: status.transaction_hash,
                    polls: attempt,
                };
            }
            Ok(status) if status.state == JobState::Failed => {
                let reason = status
                    .error
                    .unwrap_or_else(|| "verification service reported failure".into());
                warn!(job_id, polls = attempt, reason = %reason, "Verification job failed");
                return JobOutcome::Failed {
                    reason,
                    polls: attempt,
                };
            }
            Ok(status) => {
                debug!(job_id, attempt, state = ?status.state, "Job not terminal yet");
            }
            Err(e) => {
                warn!(job_id, attempt, error = %e, "Job status poll failed");
            }
        }

        if attempt < config.max_attempts {
            tokio::time::sleep(config.poll_interval).await;
        }
    }

    JobOutcome::TimedOut {
        attempts: config.max_attempts,
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SubmitRequest<'a> {
    proof: &'a Groth16Proof,
    #[serde(rename = "publicSignals")]
    public_signals: &'a [String],
    #[serde(rename = "chainId")]
    chain_id: u64,
    #[serde(rename = "verificationKeyId")]
    verification_key_id: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(rename = "jobId")]
    job_id: String,
    #[allow(dead_code)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct JobResponse {
    state: String,
    #[serde(rename = "transactionHash")]
    transaction_hash: Option<String>,
    error: Option<String>,
}

/// HTTP client for the proof verification service.
#[derive(Clone)]
pub struct HttpVerificationClient {
    base_url: String,
    verification_key_id: String,
    http: reqwest::Client,
}

impl HttpVerificationClient {
    pub fn new(base_url: &str, verification_key_id: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            verification_key_id: verification_key_id.to_string(),
            http,
        }
    }
}

#[async_trait]
impl VerificationApi for HttpVerificationClient {
    async fn submit(
        &self,
        proof: &Groth16Proof,
        public_signals: &[String],
        chain_id: u64,
    ) -> Result<String, SubmitError> {
        let body = SubmitRequest {
            proof,
            public_signals,
            chain_id,
            verification_key_id: &self.verification_key_id,
        };

        let resp = self
            .http
            .post(format!("{}/submit", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_client_error() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(SubmitError::Rejected(format!("HTTP {status}: {detail}")));
        }
        if !status.is_success() {
            return Err(SubmitError::Transient(format!("HTTP {status}")));
        }

        let parsed: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| SubmitError::Transient(format!("malformed submit response: {e}")))?;
        Ok(parsed.job_id)
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        let resp = self
            .http
            .get(format!("{}/job/{}", self.base_url, job_id))
            .send()
            .await
            .context("job status request failed")?;

        anyhow::ensure!(
            resp.status().is_success(),
            "job status returned HTTP {}",
            resp.status()
        );

        let parsed: JobResponse = resp
            .json()
            .await
            .context("failed to parse job status response")?;
        Ok(JobStatus {
            state: JobState::parse(&parsed.state),
            transaction_hash: parsed.transaction_hash,
            error: parsed.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prover::sample_proof;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted verification service double.
    struct ScriptedApi {
        submit_results: Mutex<Vec<Result<String, SubmitError>>>,
        poll_states: Mutex<Vec<Result<JobStatus, String>>>,
        polls: AtomicU32,
        submits: AtomicU32,
    }

    impl ScriptedApi {
        fn new(
            submit_results: Vec<Result<String, SubmitError>>,
            poll_states: Vec<Result<JobStatus, String>>,
        ) -> Self {
            Self {
                submit_results: Mutex::new(submit_results),
                poll_states: Mutex::new(poll_states),
                polls: AtomicU32::new(0),
                submits: AtomicU32::new(0),
            }
        }

        fn status(state: JobState) -> JobStatus {
            JobStatus {
                state,
                transaction_hash: None,
                error: None,
            }
        }
    }

    #[async_trait]
    impl VerificationApi for ScriptedApi {
        async fn submit(
            &self,
            _proof: &Groth16Proof,
            _signals: &[String],
            _chain_id: u64,
        ) -> Result<String, SubmitError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            let mut results = self.submit_results.lock().unwrap();
            if results.is_empty() {
                Ok("job-1".into())
            } else {
                results.remove(0)
            }
        }

        async fn job_status(&self, _job_id: &str) -> Result<JobStatus> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut states = self.poll_states.lock().unwrap();
            let next = if states.is_empty() {
                Ok(Self::status(JobState::Submitted))
            } else {
                states.remove(0)
            };
            next.map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn fast_policy() -> SubmitRetryPolicy {
        SubmitRetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn fast_monitor(max_attempts: u32) -> MonitorConfig {
        MonitorConfig {
            initial_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(10),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn submit_retries_transient_failures_then_succeeds() {
        let api = ScriptedApi::new(
            vec![
                Err(SubmitError::Transient("connection reset".into())),
                Err(SubmitError::Transient("timeout".into())),
                Ok("job-7".into()),
            ],
            vec![],
        );
        let signals = vec!["1".into()];
        let job = submit_with_retries(&api, &sample_proof("1"), &signals, 84532, &fast_policy())
            .await
            .unwrap();
        assert_eq!(job, "job-7");
        assert_eq!(api.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn submit_does_not_retry_definitive_rejection() {
        let api = ScriptedApi::new(
            vec![Err(SubmitError::Rejected("HTTP 422: bad pairing".into()))],
            vec![],
        );
        let signals = vec!["1".into()];
        let err = submit_with_retries(&api, &sample_proof("1"), &signals, 84532, &fast_policy())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "proof_rejected");
        assert_eq!(api.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submit_exhaustion_converts_to_terminal_failure() {
        let api = ScriptedApi::new(
            vec![
                Err(SubmitError::Transient("a".into())),
                Err(SubmitError::Transient("b".into())),
                Err(SubmitError::Transient("c".into())),
            ],
            vec![],
        );
        let signals = vec!["1".into()];
        let err = submit_with_retries(&api, &sample_proof("1"), &signals, 84532, &fast_policy())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "retries_exhausted");
        assert_eq!(api.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn malformed_proof_is_refused_before_any_submission() {
        let api = ScriptedApi::new(vec![], vec![]);
        let mut proof = sample_proof("1");
        proof.a.pop();
        let signals = vec!["1".into()];
        let err = submit_with_retries(&api, &proof, &signals, 84532, &fast_policy())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
        assert_eq!(api.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn monitor_times_out_after_exactly_the_attempt_budget() {
        // Always `submitted`: terminal timeout after exactly 3 polls.
        let api = ScriptedApi::new(vec![], vec![]);
        let outcome = watch_job(&api, "job-1", &fast_monitor(3)).await;
        assert_eq!(outcome, JobOutcome::TimedOut { attempts: 3 });
        assert_eq!(api.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn monitor_resolves_success_on_finalized_and_aggregated() {
        for terminal in [JobState::Finalized, JobState::Aggregated] {
            let api = ScriptedApi::new(
                vec![],
                vec![
                    Ok(ScriptedApi::status(JobState::Submitted)),
                    Ok(ScriptedApi::status(terminal)),
                ],
            );
            let outcome = watch_job(&api, "job-1", &fast_monitor(10)).await;
            assert!(matches!(outcome, JobOutcome::Verified { polls: 2, .. }));
            assert_eq!(api.polls.load(Ordering::SeqCst), 2);
        }
    }

    #[tokio::test]
    async fn monitor_reports_explicit_failure_with_reason() {
        let api = ScriptedApi::new(
            vec![],
            vec![Ok(JobStatus {
                state: JobState::Failed,
                transaction_hash: None,
                error: Some("constraint unsatisfied".into()),
            })],
        );
        let outcome = watch_job(&api, "job-1", &fast_monitor(10)).await;
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                reason: "constraint unsatisfied".into(),
                polls: 1
            }
        );
    }

    #[tokio::test]
    async fn transient_poll_errors_consume_attempts_like_non_terminal_states() {
        let api = ScriptedApi::new(
            vec![],
            vec![
                Err("network down".into()),
                Err("network down".into()),
                Ok(ScriptedApi::status(JobState::Finalized)),
            ],
        );
        let outcome = watch_job(&api, "job-1", &fast_monitor(3)).await;
        assert!(matches!(outcome, JobOutcome::Verified { polls: 3, .. }));
    }

    #[tokio::test]
    async fn unknown_states_keep_polling() {
        let api = ScriptedApi::new(
            vec![],
            vec![
                Ok(ScriptedApi::status(JobState::Other("queued".into()))),
                Ok(ScriptedApi::status(JobState::Finalized)),
            ],
        );
        let outcome = watch_job(&api, "job-1", &fast_monitor(5)).await;
        assert!(matches!(outcome, JobOutcome::Verified { polls: 2, .. }));
    }
}
