//! Prover adapter — drives the external zero-knowledge proof generator.
//!
//! The prover is a black box reached over HTTP. Generation latency runs
//! seconds to tens of seconds and a failed generation is not retried:
//! the same input would fail the same way again.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use crate::entropy::MixedInput;

/// HTTP timeout for prover calls. Generation is slow; leave headroom.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Groth16 proof in the prover's projective form: `a` and `c` are
/// 3-element point triples, `b` is a 3×2 matrix. All coordinates are
/// decimal-string field elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Groth16Proof {
    #[serde(rename = "pi_a")]
    pub a: Vec<String>,
    #[serde(rename = "pi_b")]
    pub b: Vec<Vec<String>>,
    #[serde(rename = "pi_c")]
    pub c: Vec<String>,
}

impl Groth16Proof {
    /// Validate the documented arities: 3 coordinates for `a` and `c`,
    /// three 2-element rows for `b`.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.a.len() == 3,
            "proof component 'a' has wrong arity: expected 3, got {}",
            self.a.len()
        );
        anyhow::ensure!(
            self.c.len() == 3,
            "proof component 'c' has wrong arity: expected 3, got {}",
            self.c.len()
        );
        anyhow::ensure!(
            self.b.len() == 3,
            "proof component 'b' has wrong arity: expected 3 rows, got {}",
            self.b.len()
        );
        for (i, row) in self.b.iter().enumerate() {
            anyhow::ensure!(
                row.len() == 2,
                "proof component 'b' row {i} has wrong arity: expected 2, got {}",
                row.len()
            );
        }
        Ok(())
    }

    /// Convert to the affine Solidity calldata form: `a`/`c` drop the
    /// projective coordinate, `b` keeps two rows with swapped limbs.
    pub fn to_calldata(&self) -> SolidityProof {
        SolidityProof {
            a: [self.a[0].clone(), self.a[1].clone()],
            b: [
                [self.b[0][1].clone(), self.b[0][0].clone()],
                [self.b[1][1].clone(), self.b[1][0].clone()],
            ],
            c: [self.c[0].clone(), self.c[1].clone()],
        }
    }
}

/// Proof in the shape the on-chain verifier consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolidityProof {
    pub a: [String; 2],
    pub b: [[String; 2]; 2],
    pub c: [String; 2],
}

/// Result of one proof generation: the proof plus its ordered public
/// signals (random value first, auxiliary commitment second).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProverOutput {
    pub proof: Groth16Proof,
    #[serde(rename = "publicSignals")]
    pub public_signals: Vec<String>,
}

impl ProverOutput {
    /// Boundary validation: proof arity plus a non-empty signal list.
    pub fn validate(&self) -> Result<()> {
        self.proof.validate()?;
        anyhow::ensure!(
            !self.public_signals.is_empty(),
            "prover returned an empty public-signal list"
        );
        Ok(())
    }

    /// First public signal, the random value itself.
    pub fn random_value(&self) -> &str {
        &self.public_signals[0]
    }
}

/// Content hash over proof + signals, hex encoded. Globally unique per
/// proof; reuse across requests is refused upstream.
pub fn proof_hash(proof: &Groth16Proof, public_signals: &[String]) -> String {
    let mut hasher = Sha256::new();
    for coord in proof.a.iter().chain(proof.c.iter()) {
        hasher.update(coord.as_bytes());
        hasher.update([0u8]);
    }
    for row in &proof.b {
        for coord in row {
            hasher.update(coord.as_bytes());
            hasher.update([0u8]);
        }
    }
    for signal in public_signals {
        hasher.update(signal.as_bytes());
        hasher.update([0u8]);
    }
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// External proof generator boundary.
#[async_trait]
pub trait Prover: Send + Sync {
    /// Generate a proof for the mixed input. Errors are surfaced as-is;
    /// the caller must not retry.
    async fn generate(&self, input: &MixedInput) -> Result<ProverOutput>;

    /// Optional defensive self-check before submission.
    async fn verify_locally(
        &self,
        _proof: &Groth16Proof,
        _public_signals: &[String],
    ) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Serialize)]
struct ProveRequest<'a> {
    #[serde(rename = "blockHash")]
    block_hash: &'a str,
    nonce: String,
    timestamp: String,
    entropy: &'a str,
    salt: &'a str,
}

/// HTTP client for the prover service.
#[derive(Clone)]
pub struct HttpProver {
    base_url: String,
    http: reqwest::Client,
}

impl HttpProver {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }
}

#[async_trait]
impl Prover for HttpProver {
    async fn generate(&self, input: &MixedInput) -> Result<ProverOutput> {
        let body = ProveRequest {
            block_hash: &input.block_hash,
            nonce: input.nonce.to_string(),
            timestamp: input.timestamp.to_string(),
            entropy: &input.entropy,
            salt: &input.salt,
        };

        debug!(url = %self.base_url, nonce = input.nonce, "Requesting proof generation");

        let resp = self
            .http
            .post(format!("{}/prove", self.base_url))
            .json(&body)
            .send()
            .await
            .context("prover request failed")?;

        anyhow::ensure!(
            resp.status().is_success(),
            "prover returned HTTP {}",
            resp.status()
        );

        let output: ProverOutput = resp
            .json()
            .await
            .context("failed to parse prover response")?;
        output.validate()?;
        Ok(output)
    }
}

/// Well-formed proof fixture shared by tests across the crate.
#[cfg(test)]
pub(crate) fn sample_proof(tag: &str) -> Groth16Proof {
    Groth16Proof {
        a: vec![format!("{tag}1"), format!("{tag}2"), "1".into()],
        b: vec![
            vec![format!("{tag}3"), format!("{tag}4")],
            vec![format!("{tag}5"), format!("{tag}6")],
            vec!["1".into(), "0".into()],
        ],
        c: vec![format!("{tag}7"), format!("{tag}8"), "1".into()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_proof_passes_validation() {
        let out = ProverOutput {
            proof: sample_proof("9"),
            public_signals: vec!["12345".into(), "67890".into()],
        };
        out.validate().unwrap();
        assert_eq!(out.random_value(), "12345");
    }

    #[test]
    fn wrong_arities_are_refused() {
        let mut p = sample_proof("9");
        p.a.pop();
        assert!(p.validate().is_err());

        let mut p = sample_proof("9");
        p.b[1].push("extra".into());
        assert!(p.validate().is_err());

        let out = ProverOutput {
            proof: sample_proof("9"),
            public_signals: vec![],
        };
        assert!(out.validate().is_err());
    }

    #[test]
    fn calldata_form_swaps_b_limbs() {
        let p = sample_proof("4");
        let sol = p.to_calldata();
        assert_eq!(sol.a, [p.a[0].clone(), p.a[1].clone()]);
        assert_eq!(sol.b[0], [p.b[0][1].clone(), p.b[0][0].clone()]);
        assert_eq!(sol.b[1], [p.b[1][1].clone(), p.b[1][0].clone()]);
        assert_eq!(sol.c, [p.c[0].clone(), p.c[1].clone()]);
    }

    #[test]
    fn proof_hash_is_stable_and_input_sensitive() {
        let signals = vec!["12345".into(), "67890".into()];
        let h1 = proof_hash(&sample_proof("1"), &signals);
        let h2 = proof_hash(&sample_proof("1"), &signals);
        let h3 = proof_hash(&sample_proof("2"), &signals);
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert!(h1.starts_with("0x") && h1.len() == 66);
    }
}
