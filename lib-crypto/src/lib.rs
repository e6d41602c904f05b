//! Cryptographic primitives for the Askcoin node.
//!
//! Everything consensus-critical funnels through two operations:
//!
//! - [`coin_hash_b64`]: double SHA-256 of canonical JSON bytes, encoded with
//!   the standard (`+/=`) base64 alphabet. Block hashes and transaction ids
//!   are both 44-character strings produced by this function.
//! - secp256k1 ECDSA over the *decoded* 32-byte hash, with DER-encoded
//!   signatures and 65-byte uncompressed SEC1 public keys, both carried as
//!   base64 strings on the wire.
//!
//! Proof-of-work is a property of the decoded hash bytes, checked with
//! [`hash_pow`].

pub mod hashing;
pub mod keys;

pub use hashing::{
    b64_decode, b64_encode, coin_hash, coin_hash_b64, hash_pow, is_base64_string, sha256d,
};
pub use keys::{generate_keypair, pubkey_from_b64, sign_b64, verify_sign_b64};

use thiserror::Error;

/// Errors produced by key handling and signature checks.
///
/// Signature *mismatch* is not an error: `verify_sign_b64` returns
/// `Ok(false)` for a well-formed signature that does not verify, and an
/// `Err` only when the material itself cannot be decoded.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64: {0}")]
    InvalidBase64(String),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid DER signature")]
    InvalidSignature,
    #[error("message digest must be 32 bytes, got {0}")]
    InvalidDigestLength(usize),
}
