//! zkVRF orchestration backend.
//!
//! Off-chain service that watches EVM ledgers for randomness requests and
//! fulfills them with externally generated, externally verified
//! zero-knowledge proofs. Per chain, the pipeline is: observe the request
//! event, mix entropy, drive the prover, submit the proof to the
//! verification service, poll the verification job to a terminal state,
//! then submit the on-chain fulfillment transaction.

pub mod config;
pub mod coordinator;
pub mod entropy;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod prover;
pub mod store;
pub mod verifier;
