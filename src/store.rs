//! Persistent store boundary.
//!
//! All writes are upserts keyed by the request's composite id, so
//! re-processing after a crash converges instead of duplicating rows.
//! The backing database is an external collaborator; [`MemoryStore`] is
//! the in-process implementation used by the default wiring and tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::model::{ProofRecord, RequestKey, RequestRecord, RequestStatus};

/// Durable record store for requests and proofs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent create: if a record already exists under the key, the
    /// stored record is returned untouched and the argument is dropped.
    async fn create_request(&self, record: RequestRecord) -> Result<RequestRecord>;

    /// Upsert the full record under its key.
    async fn update_request(&self, record: RequestRecord) -> Result<()>;

    async fn get_request(&self, key: &RequestKey) -> Result<Option<RequestRecord>>;

    /// Idempotent create for the request's proof artifact.
    async fn create_proof(&self, record: ProofRecord) -> Result<ProofRecord>;

    async fn update_proof(&self, record: ProofRecord) -> Result<()>;

    async fn get_proof(&self, key: &RequestKey) -> Result<Option<ProofRecord>>;

    /// Requests in a non-terminal status, optionally narrowed to one
    /// chain. Feeds the recovery pass after a restart.
    async fn find_pending(&self, chain_id: Option<u64>) -> Result<Vec<RequestRecord>>;

    /// Requests still `pending`/`processing` whose deadline has passed.
    async fn find_expired(&self, now_ms: u64) -> Result<Vec<RequestRecord>>;

    /// Which request, if any, already owns this proof hash. Guards the
    /// global proof-hash uniqueness invariant.
    async fn proof_hash_owner(&self, proof_hash: &str) -> Result<Option<RequestKey>>;
}

/// In-memory store. Single-process; durable deployments plug a database
/// implementation in behind the same trait.
#[derive(Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<RequestKey, RequestRecord>>,
    proofs: RwLock<HashMap<RequestKey, ProofRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_request(&self, record: RequestRecord) -> Result<RequestRecord> {
        let mut requests = self.requests.write().await;
        Ok(requests.entry(record.key).or_insert(record).clone())
    }

    async fn update_request(&self, record: RequestRecord) -> Result<()> {
        self.requests.write().await.insert(record.key, record);
        Ok(())
    }

    async fn get_request(&self, key: &RequestKey) -> Result<Option<RequestRecord>> {
        Ok(self.requests.read().await.get(key).cloned())
    }

    async fn create_proof(&self, record: ProofRecord) -> Result<ProofRecord> {
        let mut proofs = self.proofs.write().await;
        Ok(proofs.entry(record.key).or_insert(record).clone())
    }

    async fn update_proof(&self, record: ProofRecord) -> Result<()> {
        self.proofs.write().await.insert(record.key, record);
        Ok(())
    }

    async fn get_proof(&self, key: &RequestKey) -> Result<Option<ProofRecord>> {
        Ok(self.proofs.read().await.get(key).cloned())
    }

    async fn find_pending(&self, chain_id: Option<u64>) -> Result<Vec<RequestRecord>> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| !r.status.is_terminal())
            .filter(|r| chain_id.is_none_or(|id| r.key.chain_id == id))
            .cloned()
            .collect())
    }

    async fn find_expired(&self, now_ms: u64) -> Result<Vec<RequestRecord>> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    RequestStatus::Pending | RequestStatus::Processing
                ) && r.is_past_expiry(now_ms)
            })
            .cloned()
            .collect())
    }

    async fn proof_hash_owner(&self, proof_hash: &str) -> Result<Option<RequestKey>> {
        let proofs = self.proofs.read().await;
        Ok(proofs
            .values()
            .find(|p| p.proof_hash == proof_hash)
            .map(|p| p.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VerificationStatus;
    use crate::prover::sample_proof;

    fn request(chain_id: u64, id: u64, status: RequestStatus, expires_at: u64) -> RequestRecord {
        let mut r = RequestRecord::new(
            RequestKey::new(chain_id, id),
            format!("0x{}", "aa".repeat(32)),
            "0xrequester".into(),
            None,
            0,
            100,
            expires_at,
        );
        r.status = status;
        r
    }

    fn proof(chain_id: u64, id: u64, hash: &str) -> ProofRecord {
        ProofRecord {
            key: RequestKey::new(chain_id, id),
            proof: sample_proof("1"),
            public_signals: vec!["12345".into(), "67890".into()],
            proof_hash: hash.into(),
            verification_status: VerificationStatus::Pending,
            job_id: None,
            submitted_at: None,
            verified_at: None,
            generation_ms: 10,
            verification_ms: None,
        }
    }

    #[tokio::test]
    async fn create_request_is_idempotent() {
        let store = MemoryStore::new();
        let first = request(1, 1, RequestStatus::Processing, 10_000);
        store.create_request(first.clone()).await.unwrap();

        // A duplicate create must not clobber the progressed record.
        let duplicate = request(1, 1, RequestStatus::Pending, 10_000);
        let stored = store.create_request(duplicate).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Processing);
        assert_eq!(stored, first);
    }

    #[tokio::test]
    async fn update_is_an_upsert() {
        let store = MemoryStore::new();
        let r = request(1, 2, RequestStatus::Pending, 10_000);
        store.update_request(r.clone()).await.unwrap();
        let fetched = store.get_request(&r.key).await.unwrap().unwrap();
        assert_eq!(fetched, r);
    }

    #[tokio::test]
    async fn find_pending_filters_terminal_and_by_chain() {
        let store = MemoryStore::new();
        store
            .update_request(request(1, 1, RequestStatus::Pending, 10_000))
            .await
            .unwrap();
        store
            .update_request(request(1, 2, RequestStatus::Fulfilled, 10_000))
            .await
            .unwrap();
        store
            .update_request(request(2, 3, RequestStatus::Verifying, 10_000))
            .await
            .unwrap();

        let all = store.find_pending(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let chain1 = store.find_pending(Some(1)).await.unwrap();
        assert_eq!(chain1.len(), 1);
        assert_eq!(chain1[0].key.on_chain_id, 1);
    }

    #[tokio::test]
    async fn find_expired_only_matches_unclaimed_work_past_deadline() {
        let store = MemoryStore::new();
        store
            .update_request(request(1, 1, RequestStatus::Pending, 500))
            .await
            .unwrap();
        store
            .update_request(request(1, 2, RequestStatus::Processing, 500))
            .await
            .unwrap();
        store
            .update_request(request(1, 3, RequestStatus::Verifying, 500))
            .await
            .unwrap();
        store
            .update_request(request(1, 4, RequestStatus::Pending, 2_000))
            .await
            .unwrap();

        let mut expired = store.find_expired(1_000).await.unwrap();
        expired.sort_by_key(|r| r.key.on_chain_id);
        let ids: Vec<u64> = expired.iter().map(|r| r.key.on_chain_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn proof_hash_owner_detects_reuse() {
        let store = MemoryStore::new();
        store.create_proof(proof(1, 1, "0xhash")).await.unwrap();
        assert_eq!(
            store.proof_hash_owner("0xhash").await.unwrap(),
            Some(RequestKey::new(1, 1))
        );
        assert_eq!(store.proof_hash_owner("0xother").await.unwrap(), None);
    }
}
