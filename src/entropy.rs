//! Entropy mixing — turns a caller seed plus chain-derived data into the
//! prover's input bundle.
//!
//! The derived `entropy` scalar is HMAC-SHA256 keyed by the oracle secret
//! over seed‖blockHash‖nonce‖timestamp‖local-randomness, reduced into the
//! BN254 scalar field. Deterministic for the same inputs, unpredictable
//! without the secret.

use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Stage, StageError};

type HmacSha256 = Hmac<Sha256>;

/// BN254 scalar field modulus (decimal).
const FIELD_MODULUS: &str =
    "21888242871839275222246405745257275088548364400416034343698204186575808495617";

/// Ledger-derived entropy inputs for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntropy {
    /// `0x`-prefixed 32-byte block hash.
    pub block_hash: String,
    pub block_number: u64,
    /// Unix seconds.
    pub timestamp: u64,
    /// True when the chain was unreachable and a local pseudo-block was
    /// substituted so the request can still proceed.
    pub fallback: bool,
}

impl ChainEntropy {
    /// Locally generated stand-in for an unreachable chain.
    pub fn fallback(now_secs: u64) -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self {
            block_hash: format!("0x{}", hex::encode(bytes)),
            block_number: now_secs.max(1),
            timestamp: now_secs.max(1),
            fallback: true,
        }
    }
}

/// The prover's input bundle. Field names map 1:1 to the prover boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixedInput {
    /// `0x`-prefixed 32-byte hex block hash.
    pub block_hash: String,
    /// Block number at mixing time.
    pub nonce: u64,
    /// Block timestamp, unix seconds.
    pub timestamp: u64,
    /// Derived scalar, decimal string, reduced into the field.
    pub entropy: String,
    /// Independent random scalar, decimal string.
    pub salt: String,
}

impl MixedInput {
    /// Fail fast on anything the prover would choke on: zero numeric
    /// fields, malformed block hash, zero scalars.
    pub fn validate(&self) -> Result<(), StageError> {
        if !is_hex32(&self.block_hash) {
            return Err(validation(format!(
                "blockHash must be 0x-prefixed 32-byte hex, got {:?}",
                self.block_hash
            )));
        }
        if self.nonce == 0 {
            return Err(validation("nonce must be strictly positive".into()));
        }
        if self.timestamp == 0 {
            return Err(validation("timestamp must be strictly positive".into()));
        }
        for (name, value) in [("entropy", &self.entropy), ("salt", &self.salt)] {
            if value.is_empty() || value == "0" || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(validation(format!(
                    "{name} must be a positive decimal scalar, got {value:?}"
                )));
            }
        }
        Ok(())
    }
}

fn validation(message: String) -> StageError {
    StageError::Validation {
        stage: Stage::Generation,
        message,
    }
}

fn is_hex32(s: &str) -> bool {
    s.len() == 66
        && s.starts_with("0x")
        && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Reduce a digest into the scalar field and render as decimal.
fn reduce_to_field(bytes: &[u8]) -> String {
    let modulus = BigUint::parse_bytes(FIELD_MODULUS.as_bytes(), 10)
        .expect("field modulus is a valid decimal constant");
    let value = BigUint::from_bytes_be(bytes) % modulus;
    value.to_str_radix(10)
}

/// Combines seeds, chain data and local randomness into prover inputs.
#[derive(Clone)]
pub struct EntropyMixer {
    secret: Vec<u8>,
}

impl EntropyMixer {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Mix with explicit local randomness. Deterministic for the same
    /// arguments, which is what the tests lean on.
    pub fn mix(
        &self,
        seed_hex: &str,
        chain: &ChainEntropy,
        local: &[u8; 32],
        salt_seed: &[u8; 32],
    ) -> Result<MixedInput, StageError> {
        if !is_hex32(seed_hex) {
            return Err(validation(format!(
                "seed must be 0x-prefixed 32-byte hex, got {:?}",
                seed_hex
            )));
        }
        let seed_bytes =
            hex::decode(&seed_hex[2..]).map_err(|e| validation(format!("invalid seed hex: {e}")))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| validation(format!("invalid mixer secret: {e}")))?;
        mac.update(&seed_bytes);
        mac.update(chain.block_hash.as_bytes());
        mac.update(&chain.block_number.to_le_bytes());
        mac.update(&chain.timestamp.to_le_bytes());
        mac.update(local);
        let digest = mac.finalize().into_bytes();

        let salt_digest = Sha256::digest(salt_seed);

        let input = MixedInput {
            block_hash: chain.block_hash.clone(),
            nonce: chain.block_number,
            timestamp: chain.timestamp,
            entropy: reduce_to_field(&digest),
            salt: reduce_to_field(&salt_digest),
        };
        input.validate()?;
        Ok(input)
    }

    /// Mix with fresh OS randomness for the local component and salt.
    pub fn mix_fresh(&self, seed_hex: &str, chain: &ChainEntropy) -> Result<MixedInput, StageError> {
        let mut local = [0u8; 32];
        let mut salt_seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut local);
        rand::rngs::OsRng.fill_bytes(&mut salt_seed);
        self.mix(seed_hex, chain, &local, &salt_seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> ChainEntropy {
        ChainEntropy {
            block_hash: format!("0x{}", "ab".repeat(32)),
            block_number: 123_456,
            timestamp: 1_700_000_000,
            fallback: false,
        }
    }

    fn seed() -> String {
        format!("0x{}", "aa".repeat(32))
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let mixer = EntropyMixer::new(b"test-secret".to_vec());
        let a = mixer.mix(&seed(), &chain(), &[1u8; 32], &[2u8; 32]).unwrap();
        let b = mixer.mix(&seed(), &chain(), &[1u8; 32], &[2u8; 32]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_seed_changes_entropy_but_not_salt() {
        let mixer = EntropyMixer::new(b"test-secret".to_vec());
        let other_seed = format!("0x{}", "bb".repeat(32));
        let a = mixer.mix(&seed(), &chain(), &[1u8; 32], &[2u8; 32]).unwrap();
        let b = mixer
            .mix(&other_seed, &chain(), &[1u8; 32], &[2u8; 32])
            .unwrap();
        assert_ne!(a.entropy, b.entropy);
        assert_eq!(a.salt, b.salt);
    }

    #[test]
    fn scalars_are_reduced_into_the_field() {
        let mixer = EntropyMixer::new(b"test-secret".to_vec());
        let out = mixer.mix(&seed(), &chain(), &[7u8; 32], &[9u8; 32]).unwrap();
        let modulus = BigUint::parse_bytes(FIELD_MODULUS.as_bytes(), 10).unwrap();
        let entropy = BigUint::parse_bytes(out.entropy.as_bytes(), 10).unwrap();
        let salt = BigUint::parse_bytes(out.salt.as_bytes(), 10).unwrap();
        assert!(entropy < modulus);
        assert!(salt < modulus);
    }

    #[test]
    fn malformed_seed_fails_before_mixing() {
        let mixer = EntropyMixer::new(b"s".to_vec());
        for bad in ["aabb", "0x1234", &format!("0x{}", "zz".repeat(32))] {
            let err = mixer
                .mix(bad, &chain(), &[0u8; 32], &[0u8; 32])
                .unwrap_err();
            assert_eq!(err.code(), "validation");
        }
    }

    #[test]
    fn zero_numeric_fields_are_refused() {
        let input = MixedInput {
            block_hash: format!("0x{}", "ab".repeat(32)),
            nonce: 0,
            timestamp: 1,
            entropy: "5".into(),
            salt: "6".into(),
        };
        assert!(input.validate().is_err());

        let input = MixedInput {
            nonce: 1,
            timestamp: 0,
            ..input
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn fallback_entropy_is_well_formed_and_flagged() {
        let fb = ChainEntropy::fallback(1_700_000_000);
        assert!(fb.fallback);
        assert!(is_hex32(&fb.block_hash));
        let mixer = EntropyMixer::new(b"k".to_vec());
        let out = mixer.mix(&seed(), &fb, &[3u8; 32], &[4u8; 32]).unwrap();
        out.validate().unwrap();
    }
}
