//! Typed failure taxonomy for the request pipeline.
//!
//! Every stage failure is caught at the coordinator, converted to a
//! [`FailureInfo`] triple and persisted onto the request record. Nothing
//! propagates past the coordinator into the ledger watch loop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Entropy,
    Generation,
    Submission,
    Verification,
    Fulfillment,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Entropy => "entropy",
            Stage::Generation => "generation",
            Stage::Submission => "submission",
            Stage::Verification => "verification",
            Stage::Fulfillment => "fulfillment",
        };
        f.write_str(s)
    }
}

/// A failure of one pipeline stage for one request.
#[derive(Debug, Error)]
pub enum StageError {
    /// Malformed input detected before any external call (bad seed, bad
    /// mixed-input field, bad proof shape). Never retried.
    #[error("validation failed at {stage}: {message}")]
    Validation { stage: Stage, message: String },

    /// Transient I/O retries were exhausted without success.
    #[error("{stage} gave up after {attempts} attempts: {message}")]
    RetriesExhausted {
        stage: Stage,
        attempts: u32,
        message: String,
    },

    /// The verification service rejected the proof definitively
    /// (4xx-equivalent). Never retried.
    #[error("proof rejected by verification service: {message}")]
    ProofRejected { message: String },

    /// A proof with the same content hash already exists for a different
    /// request. Replays are refused before submission.
    #[error("proof hash {proof_hash} already used by another request")]
    DuplicateProof { proof_hash: String },

    /// The prover failed outright. Regenerating with the same input would
    /// fail identically, so this is terminal for the attempt.
    #[error("proof generation failed: {message}")]
    ProverFailed { message: String },

    /// The verification job reached an explicit `failed` state.
    #[error("verification job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    /// The job monitor exhausted its polling budget without observing a
    /// terminal state. Distinct from an explicit job failure.
    #[error("verification job {job_id} still not terminal after {attempts} polls")]
    JobTimedOut { job_id: String, attempts: u32 },

    /// The on-chain fulfillment transaction could not be submitted or
    /// confirmed.
    #[error("fulfillment transaction failed: {message}")]
    FulfillmentFailed { message: String },

    /// Persistent store operation failed.
    #[error("store error at {stage}: {message}")]
    Store { stage: Stage, message: String },
}

impl StageError {
    /// Stable machine-readable code, persisted on the request record.
    pub fn code(&self) -> &'static str {
        match self {
            StageError::Validation { .. } => "validation",
            StageError::RetriesExhausted { .. } => "retries_exhausted",
            StageError::ProofRejected { .. } => "proof_rejected",
            StageError::DuplicateProof { .. } => "duplicate_proof",
            StageError::ProverFailed { .. } => "proof_generation",
            StageError::JobFailed { .. } => "verification_failed",
            StageError::JobTimedOut { .. } => "verification_timeout",
            StageError::FulfillmentFailed { .. } => "fulfillment_failed",
            StageError::Store { .. } => "store_error",
        }
    }

    /// Stage attributed to this failure.
    pub fn stage(&self) -> Stage {
        match self {
            StageError::Validation { stage, .. } => *stage,
            StageError::RetriesExhausted { stage, .. } => *stage,
            StageError::ProofRejected { .. } => Stage::Submission,
            StageError::DuplicateProof { .. } => Stage::Generation,
            StageError::ProverFailed { .. } => Stage::Generation,
            StageError::JobFailed { .. } => Stage::Verification,
            StageError::JobTimedOut { .. } => Stage::Verification,
            StageError::FulfillmentFailed { .. } => Stage::Fulfillment,
            StageError::Store { stage, .. } => *stage,
        }
    }

    /// Convert into the persistable triple.
    pub fn info(&self) -> FailureInfo {
        FailureInfo {
            code: self.code().to_string(),
            stage: self.stage(),
            message: self.to_string(),
        }
    }
}

/// The `(code, stage, message)` triple recorded on a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub code: String,
    pub stage: Stage,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_explicit_failure_have_distinct_codes() {
        let timeout = StageError::JobTimedOut {
            job_id: "j1".into(),
            attempts: 60,
        };
        let failed = StageError::JobFailed {
            job_id: "j1".into(),
            reason: "invalid pairing".into(),
        };
        assert_ne!(timeout.code(), failed.code());
        assert_eq!(timeout.stage(), Stage::Verification);
        assert_eq!(failed.stage(), Stage::Verification);
    }

    #[test]
    fn failure_info_carries_stage_and_code() {
        let err = StageError::Validation {
            stage: Stage::Generation,
            message: "seed must be 32 bytes".into(),
        };
        let info = err.info();
        assert_eq!(info.code, "validation");
        assert_eq!(info.stage, Stage::Generation);
        assert!(info.message.contains("seed must be 32 bytes"));
    }
}
