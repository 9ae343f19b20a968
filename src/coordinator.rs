//! Request coordinator — owns the per-request state machine and drives
//! each request through entropy mixing, proof generation, verification
//! submission, job monitoring and on-chain fulfillment.
//!
//! One coordinator runs per chain. Within a chain, request pipelines run
//! concurrently up to a semaphore-bounded limit; within one request the
//! stages are strictly sequential and each status change is persisted
//! before the next stage starts. The in-flight set is the only shared
//! mutable state and the sole defense against duplicate events or
//! overlapping backlog scans claiming the same request twice.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::entropy::{ChainEntropy, EntropyMixer};
use crate::error::{Stage, StageError};
use crate::ledger::{CallbackOutcome, LedgerConnector, RequestEvent};
use crate::metrics::Metrics;
use crate::model::{
    now_ms, ProofRecord, RequestKey, RequestRecord, RequestStatus, TransitionResult,
    VerificationStatus,
};
use crate::prover::{proof_hash, Prover};
use crate::store::Store;
use crate::verifier::{
    submit_with_retries, watch_job, JobOutcome, MonitorConfig, SubmitRetryPolicy, VerificationApi,
};

/// Concurrency-safe set of requests currently being processed.
///
/// A claim is released when the handle drops, so every exit path of a
/// pipeline — success, failure, panic unwind — frees the key.
#[derive(Clone, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<RequestKey>>>,
}

/// RAII claim on one request key.
pub struct Claim {
    keys: Arc<Mutex<HashSet<RequestKey>>>,
    key: RequestKey,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the key, or `None` if another pipeline already holds it.
    pub fn try_claim(&self, key: RequestKey) -> Option<Claim> {
        let mut keys = self.keys.lock().expect("in-flight lock poisoned");
        if keys.insert(key) {
            Some(Claim {
                keys: self.keys.clone(),
                key,
            })
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().expect("in-flight lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.keys
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&self.key);
    }
}

/// How a completed pipeline ended.
#[derive(Debug)]
enum PipelineOutcome {
    Fulfilled(RequestRecord),
    Expired,
}

/// Tuning for one coordinator instance.
#[derive(Clone)]
pub struct CoordinatorOptions {
    pub monitor: MonitorConfig,
    pub submit_retry: SubmitRetryPolicy,
    /// Lifetime granted to a newly observed request.
    pub request_ttl_ms: u64,
    /// Maximum concurrent pipelines for this chain.
    pub concurrency: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            submit_retry: SubmitRetryPolicy::default(),
            request_ttl_ms: 3_600_000,
            concurrency: 4,
        }
    }
}

/// Per-chain orchestrator.
pub struct Coordinator {
    ledger: Arc<dyn LedgerConnector>,
    prover: Arc<dyn Prover>,
    verifier: Arc<dyn VerificationApi>,
    store: Arc<dyn Store>,
    mixer: EntropyMixer,
    metrics: Arc<Metrics>,
    in_flight: InFlight,
    options: CoordinatorOptions,
    /// Pipelines currently running, surfaced on `/status`.
    pending_count: Arc<AtomicU64>,
}

impl Coordinator {
    pub fn new(
        ledger: Arc<dyn LedgerConnector>,
        prover: Arc<dyn Prover>,
        verifier: Arc<dyn VerificationApi>,
        store: Arc<dyn Store>,
        mixer: EntropyMixer,
        metrics: Arc<Metrics>,
        options: CoordinatorOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            prover,
            verifier,
            store,
            mixer,
            metrics,
            in_flight: InFlight::new(),
            options,
            pending_count: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.ledger.chain_id()
    }

    pub fn pending_count(&self) -> Arc<AtomicU64> {
        self.pending_count.clone()
    }

    /// Consume request events until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<RequestEvent>) {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));

        while let Some(event) = rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    error!("Semaphore closed, stopping coordinator");
                    break;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                this.handle_event(event).await;
            });
        }

        info!(chain_id = self.chain_id(), "Event channel closed, coordinator shutting down");
    }

    /// Process one observed request event end to end. Never propagates an
    /// error: every failure is persisted onto the request record so an
    /// unhandled error can never kill the chain's subscription.
    pub async fn handle_event(&self, event: RequestEvent) {
        let key = RequestKey::new(event.chain_id, event.on_chain_id);

        let Some(claim) = self.in_flight.try_claim(key) else {
            debug!(request_id = %key, "Request already in flight, skipping duplicate");
            return;
        };

        let now = now_ms();
        let fresh = RequestRecord::new(
            key,
            event.seed.clone(),
            event.requester.clone(),
            None,
            event.fee,
            now,
            now + self.options.request_ttl_ms,
        );

        let record = match self.store.create_request(fresh.clone()).await {
            Ok(stored) => {
                if stored == fresh {
                    self.metrics.record_request(key.chain_id);
                }
                stored
            }
            Err(e) => {
                error!(request_id = %key, error = %e, "Failed to persist request");
                return;
            }
        };

        self.drive(record, claim).await;
    }

    /// Re-drive a request from its persisted record. Used by the startup
    /// recovery pass; resumes from whatever stage the record reached.
    pub async fn handle_recovered(&self, key: RequestKey) {
        let Some(claim) = self.in_flight.try_claim(key) else {
            debug!(request_id = %key, "Request already in flight, skipping recovery");
            return;
        };
        match self.store.get_request(&key).await {
            Ok(Some(record)) => self.drive(record, claim).await,
            Ok(None) => warn!(request_id = %key, "Recovery found no record"),
            Err(e) => error!(request_id = %key, error = %e, "Failed to load record for recovery"),
        }
    }

    async fn drive(&self, record: RequestRecord, claim: Claim) {
        let _claim = claim;
        let key = record.key;

        if record.status.is_terminal() {
            debug!(request_id = %key, status = %record.status, "Request already terminal");
            return;
        }

        if record.is_past_expiry(now_ms()) {
            self.mark_expired(&record).await;
            return;
        }

        self.pending_count.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = self.process(record).await;
        self.pending_count.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(PipelineOutcome::Fulfilled(done)) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.metrics
                    .record_fulfillment(key.chain_id, done.processing_time_ms.unwrap_or(0));
                info!(
                    request_id = %key,
                    random_value = done.random_value.as_deref().unwrap_or(""),
                    latency_ms,
                    "Request fulfilled"
                );
            }
            Ok(PipelineOutcome::Expired) => {
                info!(request_id = %key, "Request expired before fulfillment");
            }
            Err(e) => self.mark_failed(key, e).await,
        }
    }

    /// The staged pipeline. Each stage persists its status change before
    /// the next stage runs, so a crash resumes at the right place.
    async fn process(&self, record: RequestRecord) -> Result<PipelineOutcome, StageError> {
        let key = record.key;

        let record = self.advance(record, RequestStatus::Processing).await?;

        // Resume from an existing proof artifact if one was persisted.
        let existing_proof = self
            .store
            .get_proof(&key)
            .await
            .map_err(|e| store_err(Stage::Generation, e))?;

        let proof_record = match existing_proof {
            Some(p) => {
                debug!(request_id = %key, "Resuming with persisted proof");
                p
            }
            None => self.generate_proof(&record).await?,
        };

        let (record, proof_record, job_id) = match proof_record.job_id.clone() {
            Some(job_id) => {
                debug!(request_id = %key, job_id = %job_id, "Resuming with persisted verification job");
                (
                    self.advance(record, RequestStatus::Verifying).await?,
                    proof_record,
                    job_id,
                )
            }
            None => self.submit_proof(record, proof_record).await?,
        };

        let proof_record = self.monitor_job(&job_id, proof_record).await?;

        self.fulfill(record, proof_record).await
    }

    /// Entropy + proof generation + uniqueness guard.
    async fn generate_proof(&self, record: &RequestRecord) -> Result<ProofRecord, StageError> {
        let key = record.key;

        // The request proceeds on locally generated pseudo-block entropy
        // rather than stalling when the chain is unreachable.
        let chain_entropy = match self.ledger.chain_entropy().await {
            Ok(e) => e,
            Err(e) => {
                warn!(request_id = %key, error = %e, "Chain entropy unavailable, using local fallback");
                ChainEntropy::fallback(now_ms() / 1_000)
            }
        };

        let mixed = self.mixer.mix_fresh(&record.seed, &chain_entropy)?;

        let generation_started = Instant::now();
        let output = self
            .prover
            .generate(&mixed)
            .await
            .map_err(|e| StageError::ProverFailed {
                message: format!("{e:#}"),
            })?;
        output.validate().map_err(|e| StageError::Validation {
            stage: Stage::Generation,
            message: e.to_string(),
        })?;
        let generation_ms = generation_started.elapsed().as_millis() as u64;

        let hash = proof_hash(&output.proof, &output.public_signals);
        match self
            .store
            .proof_hash_owner(&hash)
            .await
            .map_err(|e| store_err(Stage::Generation, e))?
        {
            Some(owner) if owner != key => {
                return Err(StageError::DuplicateProof { proof_hash: hash });
            }
            _ => {}
        }

        match self.prover.verify_locally(&output.proof, &output.public_signals).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(StageError::ProverFailed {
                    message: "local proof self-check failed".into(),
                })
            }
            // The self-check is best effort; a broken checker must not
            // block an otherwise valid proof.
            Err(e) => warn!(request_id = %key, error = %e, "Local proof self-check errored"),
        }

        let proof_record = ProofRecord {
            key,
            proof: output.proof,
            public_signals: output.public_signals,
            proof_hash: hash,
            verification_status: VerificationStatus::Pending,
            job_id: None,
            submitted_at: None,
            verified_at: None,
            generation_ms,
            verification_ms: None,
        };
        self.store
            .create_proof(proof_record.clone())
            .await
            .map_err(|e| store_err(Stage::Generation, e))
    }

    /// Submit to the verification service and persist the job handle.
    async fn submit_proof(
        &self,
        record: RequestRecord,
        mut proof_record: ProofRecord,
    ) -> Result<(RequestRecord, ProofRecord, String), StageError> {
        let job_id = submit_with_retries(
            self.verifier.as_ref(),
            &proof_record.proof,
            &proof_record.public_signals,
            record.key.chain_id,
            &self.options.submit_retry,
        )
        .await?;

        proof_record.job_id = Some(job_id.clone());
        proof_record.submitted_at = Some(now_ms());
        self.store
            .update_proof(proof_record.clone())
            .await
            .map_err(|e| store_err(Stage::Submission, e))?;

        let record = self.advance(record, RequestStatus::ProofSubmitted).await?;
        let record = self.advance(record, RequestStatus::Verifying).await?;
        Ok((record, proof_record, job_id))
    }

    /// Watch the verification job to a terminal outcome.
    async fn monitor_job(
        &self,
        job_id: &str,
        mut proof_record: ProofRecord,
    ) -> Result<ProofRecord, StageError> {
        let monitor_started = Instant::now();
        match watch_job(self.verifier.as_ref(), job_id, &self.options.monitor).await {
            JobOutcome::Verified { .. } => {
                proof_record.verification_status = VerificationStatus::Verified;
                proof_record.verified_at = Some(now_ms());
                proof_record.verification_ms =
                    Some(monitor_started.elapsed().as_millis() as u64);
                self.store
                    .update_proof(proof_record.clone())
                    .await
                    .map_err(|e| store_err(Stage::Verification, e))?;
                Ok(proof_record)
            }
            JobOutcome::Failed { reason, .. } => {
                proof_record.verification_status = VerificationStatus::Failed;
                let _ = self.store.update_proof(proof_record).await;
                Err(StageError::JobFailed {
                    job_id: job_id.to_string(),
                    reason,
                })
            }
            JobOutcome::TimedOut { attempts } => {
                proof_record.verification_status = VerificationStatus::Failed;
                let _ = self.store.update_proof(proof_record).await;
                Err(StageError::JobTimedOut {
                    job_id: job_id.to_string(),
                    attempts,
                })
            }
        }
    }

    /// Submit the on-chain fulfillment and close out the record.
    async fn fulfill(
        &self,
        record: RequestRecord,
        proof_record: ProofRecord,
    ) -> Result<PipelineOutcome, StageError> {
        let key = record.key;

        // A restart between verification and fulfillment re-enters here;
        // the contract is the source of truth for whether the
        // fulfillment transaction already landed.
        let already_fulfilled = self
            .ledger
            .request_fulfilled(key.on_chain_id)
            .await
            .unwrap_or(false);

        if !already_fulfilled {
            let receipt = self
                .ledger
                .submit_fulfillment(
                    key.on_chain_id,
                    &proof_record.proof.to_calldata(),
                    &proof_record.public_signals,
                    record.callback_address.is_some(),
                )
                .await
                .map_err(|e| StageError::FulfillmentFailed {
                    message: format!("{e:#}"),
                })?;

            // Best effort only: a reverted consumer callback never rolls
            // back the fulfillment.
            if let Some(CallbackOutcome::Failed(reason)) = &receipt.callback {
                warn!(request_id = %key, reason = %reason, "Consumer callback failed");
            }

            info!(
                request_id = %key,
                tx = %receipt.transaction_hash,
                block = receipt.block_number,
                gas_used = receipt.gas_used,
                "Fulfillment confirmed"
            );
        } else {
            info!(request_id = %key, "Fulfillment already recorded on chain, skipping resubmission");
        }

        let random_value = proof_record
            .public_signals
            .first()
            .cloned()
            .ok_or_else(|| StageError::Validation {
                stage: Stage::Fulfillment,
                message: "persisted proof has no public signals".into(),
            })?;
        match record.fulfilled(random_value, proof_record.proof_hash.clone(), now_ms()) {
            TransitionResult::Applied(done) => {
                self.store
                    .update_request(done.clone())
                    .await
                    .map_err(|e| store_err(Stage::Fulfillment, e))?;
                Ok(PipelineOutcome::Fulfilled(done))
            }
            TransitionResult::PastExpiry => {
                self.mark_expired(&record).await;
                Ok(PipelineOutcome::Expired)
            }
            TransitionResult::AlreadyTerminal(status) => {
                debug!(request_id = %key, status = %status, "Record became terminal during fulfillment");
                Ok(PipelineOutcome::Expired)
            }
            TransitionResult::Invalid { from, to } => Err(StageError::FulfillmentFailed {
                message: format!("illegal transition {from} -> {to}"),
            }),
        }
    }

    /// Persist a forward status transition. A record already at (or past)
    /// the target status is left as is, which makes resumption idempotent.
    async fn advance(
        &self,
        record: RequestRecord,
        next: RequestStatus,
    ) -> Result<RequestRecord, StageError> {
        if stage_rank(record.status) >= stage_rank(next) {
            return Ok(record);
        }
        match record.transition(next) {
            TransitionResult::Applied(updated) => {
                self.store
                    .update_request(updated.clone())
                    .await
                    .map_err(|e| store_err(Stage::Generation, e))?;
                Ok(updated)
            }
            other => Err(StageError::Store {
                stage: Stage::Generation,
                message: format!("cannot advance {} to {next}: {other:?}", record.status),
            }),
        }
    }

    async fn mark_failed(&self, key: RequestKey, error: StageError) {
        warn!(
            request_id = %key,
            stage = %error.stage(),
            code = error.code(),
            error = %error,
            "Request failed"
        );

        let record = match self.store.get_request(&key).await {
            Ok(Some(r)) => r,
            _ => {
                error!(request_id = %key, "Cannot load record to persist failure");
                return;
            }
        };
        match record.failed(error.info()) {
            TransitionResult::Applied(failed) => {
                if let Err(e) = self.store.update_request(failed).await {
                    error!(request_id = %key, error = %e, "Failed to persist failure");
                }
                self.metrics.record_failure(key.chain_id);
            }
            TransitionResult::AlreadyTerminal(status) => {
                debug!(request_id = %key, status = %status, "Record already terminal, failure not recorded");
            }
            other => {
                error!(request_id = %key, outcome = ?other, "Unexpected transition while failing record");
            }
        }
    }

    async fn mark_expired(&self, record: &RequestRecord) {
        let key = record.key;
        match record.expired() {
            TransitionResult::Applied(expired) => {
                if let Err(e) = self.store.update_request(expired).await {
                    error!(request_id = %key, error = %e, "Failed to persist expiry");
                    return;
                }
                self.metrics.record_expiry(key.chain_id);
                info!(request_id = %key, "Request marked expired");
            }
            TransitionResult::AlreadyTerminal(_) => {}
            other => {
                error!(request_id = %key, outcome = ?other, "Unexpected transition while expiring record");
            }
        }
    }

    /// Re-enqueue persisted non-terminal work. Runs once at startup,
    /// before the live watcher takes over.
    pub async fn recover(&self) {
        let records = match self.store.find_pending(Some(self.chain_id())).await {
            Ok(r) => r,
            Err(e) => {
                error!(chain_id = self.chain_id(), error = %e, "Recovery scan failed");
                return;
            }
        };
        if !records.is_empty() {
            info!(
                chain_id = self.chain_id(),
                count = records.len(),
                "Recovering persisted in-progress requests"
            );
        }
        for record in records {
            self.handle_recovered(record.key).await;
        }
    }

    /// One pass of the background expiry sweep. Respects the in-flight
    /// guard, so it never races an active pipeline for the same request.
    pub async fn sweep_expired_once(&self) -> usize {
        let expired = match self.store.find_expired(now_ms()).await {
            Ok(r) => r,
            Err(e) => {
                error!(chain_id = self.chain_id(), error = %e, "Expiry sweep query failed");
                return 0;
            }
        };

        let mut swept = 0;
        for record in expired {
            if record.key.chain_id != self.chain_id() {
                continue;
            }
            let Some(_claim) = self.in_flight.try_claim(record.key) else {
                continue;
            };
            // Re-read under the claim; the record may have progressed.
            match self.store.get_request(&record.key).await {
                Ok(Some(current))
                    if !current.status.is_terminal() && current.is_past_expiry(now_ms()) =>
                {
                    self.mark_expired(&current).await;
                    swept += 1;
                }
                _ => {}
            }
        }
        swept
    }

    /// Periodic expiry sweep, independent of event-driven processing.
    pub async fn run_sweeper(self: Arc<Self>, interval: std::time::Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let swept = self.sweep_expired_once().await;
            if swept > 0 {
                info!(chain_id = self.chain_id(), swept, "Expiry sweep finished");
            }
        }
    }
}

fn stage_rank(status: RequestStatus) -> u8 {
    match status {
        RequestStatus::Pending => 0,
        RequestStatus::Processing => 1,
        RequestStatus::ProofSubmitted => 2,
        RequestStatus::Verifying => 3,
        RequestStatus::Fulfilled | RequestStatus::Failed | RequestStatus::Expired => 4,
    }
}

fn store_err(stage: Stage, e: anyhow::Error) -> StageError {
    StageError::Store {
        stage,
        message: format!("{e:#}"),
    }
}
