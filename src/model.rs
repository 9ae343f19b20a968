//! Domain records for randomness requests and their proofs.
//!
//! Status changes go through pure transition functions that return a new
//! record plus an explicit outcome, so the legal transition graph can be
//! tested exhaustively and terminal states can never regress.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::FailureInfo;

/// Composite identity of one randomness request: the chain it lives on
/// plus the request counter assigned by the on-chain coordinator.
///
/// Rendered as a single opaque id `"<chainId>:<onChainRequestId>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub chain_id: u64,
    pub on_chain_id: u64,
}

impl RequestKey {
    pub fn new(chain_id: u64, on_chain_id: u64) -> Self {
        Self {
            chain_id,
            on_chain_id,
        }
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.on_chain_id)
    }
}

/// Request lifecycle status.
///
/// `Fulfilled`, `Failed` and `Expired` are terminal; nothing transitions
/// out of them (an administrative reset is the admin surface's job and
/// bypasses this machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    ProofSubmitted,
    Verifying,
    Fulfilled,
    Failed,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Fulfilled | RequestStatus::Failed | RequestStatus::Expired
        )
    }

    /// Whether `self -> next` is a legal edge of the lifecycle graph.
    pub fn allows(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            // Failure and expiry absorb from any non-terminal state.
            (_, Failed) | (_, Expired) => true,
            (Pending, Processing) => true,
            (Processing, ProofSubmitted) => true,
            (ProofSubmitted, Verifying) => true,
            (Verifying, Fulfilled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::ProofSubmitted => "proof_submitted",
            RequestStatus::Verifying => "verifying",
            RequestStatus::Fulfilled => "fulfilled",
            RequestStatus::Failed => "failed",
            RequestStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Outcome of attempting a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// The transition is legal; here is the updated record.
    Applied(RequestRecord),
    /// The record is already in a terminal state; nothing changed.
    AlreadyTerminal(RequestStatus),
    /// The requested edge does not exist in the lifecycle graph.
    Invalid {
        from: RequestStatus,
        to: RequestStatus,
    },
    /// Fulfillment attempted after the request's deadline.
    PastExpiry,
}

impl TransitionResult {
    pub fn applied(self) -> Option<RequestRecord> {
        match self {
            TransitionResult::Applied(r) => Some(r),
            _ => None,
        }
    }
}

/// Durable record of one randomness request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub key: RequestKey,
    /// Caller-supplied seed, `0x`-prefixed 32-byte hex.
    pub seed: String,
    /// Address that placed the request.
    pub requester: String,
    /// Optional consumer contract to receive the callback.
    pub callback_address: Option<String>,
    pub status: RequestStatus,
    /// Decimal string of the first public signal, set once fulfilled.
    pub random_value: Option<String>,
    /// Content hash of the proof that fulfilled this request.
    pub proof_hash: Option<String>,
    /// Fee paid by the requester, in the chain's smallest unit.
    pub fee_paid: u128,
    pub requested_at: u64,
    pub fulfilled_at: Option<u64>,
    pub expires_at: u64,
    pub processing_time_ms: Option<u64>,
    pub retry_count: u32,
    pub last_error: Option<FailureInfo>,
}

impl RequestRecord {
    /// Create a fresh `pending` record for a newly observed request.
    pub fn new(
        key: RequestKey,
        seed: String,
        requester: String,
        callback_address: Option<String>,
        fee_paid: u128,
        requested_at: u64,
        expires_at: u64,
    ) -> Self {
        debug_assert!(expires_at > requested_at);
        Self {
            key,
            seed,
            requester,
            callback_address,
            status: RequestStatus::Pending,
            random_value: None,
            proof_hash: None,
            fee_paid,
            requested_at,
            fulfilled_at: None,
            expires_at,
            processing_time_ms: None,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn is_past_expiry(&self, now_ms: u64) -> bool {
        self.expires_at < now_ms
    }

    /// Attempt a plain status transition (no payload).
    pub fn transition(&self, next: RequestStatus) -> TransitionResult {
        if self.status.is_terminal() {
            return TransitionResult::AlreadyTerminal(self.status);
        }
        if !self.status.allows(next) {
            return TransitionResult::Invalid {
                from: self.status,
                to: next,
            };
        }
        let mut updated = self.clone();
        updated.status = next;
        TransitionResult::Applied(updated)
    }

    /// Transition to `fulfilled`, setting the fulfillment payload
    /// atomically with the status change. Refused past the deadline.
    pub fn fulfilled(
        &self,
        random_value: String,
        proof_hash: String,
        now_ms: u64,
    ) -> TransitionResult {
        if self.status.is_terminal() {
            return TransitionResult::AlreadyTerminal(self.status);
        }
        if self.is_past_expiry(now_ms) {
            return TransitionResult::PastExpiry;
        }
        if !self.status.allows(RequestStatus::Fulfilled) {
            return TransitionResult::Invalid {
                from: self.status,
                to: RequestStatus::Fulfilled,
            };
        }
        let mut updated = self.clone();
        updated.status = RequestStatus::Fulfilled;
        updated.random_value = Some(random_value);
        updated.proof_hash = Some(proof_hash);
        updated.fulfilled_at = Some(now_ms);
        updated.processing_time_ms = Some(now_ms.saturating_sub(self.requested_at));
        TransitionResult::Applied(updated)
    }

    /// Transition to `failed`, recording the causing stage failure.
    pub fn failed(&self, error: FailureInfo) -> TransitionResult {
        if self.status.is_terminal() {
            return TransitionResult::AlreadyTerminal(self.status);
        }
        let mut updated = self.clone();
        updated.status = RequestStatus::Failed;
        updated.retry_count = self.retry_count.saturating_add(1);
        updated.last_error = Some(error);
        TransitionResult::Applied(updated)
    }

    /// Transition to `expired`.
    pub fn expired(&self) -> TransitionResult {
        if self.status.is_terminal() {
            return TransitionResult::AlreadyTerminal(self.status);
        }
        let mut updated = self.clone();
        updated.status = RequestStatus::Expired;
        TransitionResult::Applied(updated)
    }
}

/// Verification lifecycle of a proof artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed,
    Invalid,
}

/// Durable record of the proof produced for one request (1:1 with
/// [`RequestRecord`] by key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub key: RequestKey,
    pub proof: crate::prover::Groth16Proof,
    /// Ordered public signals: random value first, auxiliary commitment
    /// second.
    pub public_signals: Vec<String>,
    /// Content hash of proof + signals; globally unique across requests.
    pub proof_hash: String,
    pub verification_status: VerificationStatus,
    /// Job handle assigned by the verification service.
    pub job_id: Option<String>,
    pub submitted_at: Option<u64>,
    pub verified_at: Option<u64>,
    pub generation_ms: u64,
    pub verification_ms: Option<u64>,
}

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;

    fn record(status: RequestStatus, expires_at: u64) -> RequestRecord {
        let mut r = RequestRecord::new(
            RequestKey::new(84532, 7),
            format!("0x{}", "aa".repeat(32)),
            "0x1111111111111111111111111111111111111111".into(),
            None,
            1_000,
            100,
            expires_at,
        );
        r.status = status;
        r
    }

    #[test]
    fn success_path_edges_are_legal() {
        use RequestStatus::*;
        for (from, to) in [
            (Pending, Processing),
            (Processing, ProofSubmitted),
            (ProofSubmitted, Verifying),
            (Verifying, Fulfilled),
        ] {
            assert!(from.allows(to), "{from} -> {to} should be legal");
        }
    }

    #[test]
    fn terminal_states_never_regress() {
        use RequestStatus::*;
        for terminal in [Fulfilled, Failed, Expired] {
            for to in [
                Pending,
                Processing,
                ProofSubmitted,
                Verifying,
                Fulfilled,
                Failed,
                Expired,
            ] {
                assert!(!terminal.allows(to), "{terminal} -> {to} must be refused");
            }
            let r = record(terminal, 10_000);
            assert_eq!(
                r.transition(Processing),
                TransitionResult::AlreadyTerminal(terminal)
            );
        }
    }

    #[test]
    fn fulfillment_requires_verifying() {
        use RequestStatus::*;
        for from in [Pending, Processing, ProofSubmitted] {
            let r = record(from, u64::MAX);
            assert!(matches!(
                r.fulfilled("1".into(), "h".into(), 200),
                TransitionResult::Invalid { .. }
            ));
        }
    }

    #[test]
    fn expired_request_never_fulfills() {
        let r = record(RequestStatus::Verifying, 150);
        let out = r.fulfilled("12345".into(), "hash".into(), 200);
        assert_eq!(out, TransitionResult::PastExpiry);
        // Expiry is still reachable.
        let expired = r.expired().applied().unwrap();
        assert_eq!(expired.status, RequestStatus::Expired);
    }

    #[test]
    fn fulfilled_sets_payload_atomically() {
        let r = record(RequestStatus::Verifying, u64::MAX);
        let done = r
            .fulfilled("12345".into(), "0xhash".into(), 5_100)
            .applied()
            .unwrap();
        assert_eq!(done.status, RequestStatus::Fulfilled);
        assert_eq!(done.random_value.as_deref(), Some("12345"));
        assert_eq!(done.proof_hash.as_deref(), Some("0xhash"));
        assert_eq!(done.fulfilled_at, Some(5_100));
        assert_eq!(done.processing_time_ms, Some(5_000));
    }

    #[test]
    fn failed_records_the_stage_error_and_bumps_retry_count() {
        let r = record(RequestStatus::Processing, u64::MAX);
        let info = FailureInfo {
            code: "proof_generation".into(),
            stage: Stage::Generation,
            message: "witness mismatch".into(),
        };
        let failed = r.failed(info.clone()).applied().unwrap();
        assert_eq!(failed.status, RequestStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error, Some(info));
    }

    #[test]
    fn failure_and_expiry_absorb_from_any_non_terminal_state() {
        use RequestStatus::*;
        for from in [Pending, Processing, ProofSubmitted, Verifying] {
            assert!(from.allows(Failed));
            assert!(from.allows(Expired));
        }
    }

    #[test]
    fn request_key_renders_as_opaque_id() {
        assert_eq!(RequestKey::new(84532, 42).to_string(), "84532:42");
    }
}
