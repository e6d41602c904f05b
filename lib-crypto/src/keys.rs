//! secp256k1 key handling: signing and verification over base64-carried
//! material.
//!
//! Wire conventions: public keys are 65-byte uncompressed SEC1 points
//! (88 characters of base64), signatures are DER, and the signed message is
//! always a 32-byte digest — the decoded block hash or transaction id.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::hashing::b64_decode;
use crate::CryptoError;

/// Length of an uncompressed SEC1 public key.
pub const PUBKEY_LEN: usize = 65;

/// Length of a base64-encoded uncompressed public key.
pub const PUBKEY_B64_LEN: usize = 88;

/// Generate a fresh keypair, returning `(privkey_b64, pubkey_b64)`.
///
/// The public key is uncompressed SEC1, so the base64 form is always
/// [`PUBKEY_B64_LEN`] characters.
pub fn generate_keypair() -> (String, String) {
    let secp = Secp256k1::new();
    let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
    (
        STANDARD.encode(sk.secret_bytes()),
        STANDARD.encode(pk.serialize_uncompressed()),
    )
}

/// Parse a base64 uncompressed public key.
pub fn pubkey_from_b64(pubkey_b64: &str) -> Result<PublicKey, CryptoError> {
    let bytes = b64_decode(pubkey_b64)?;

    if bytes.len() != PUBKEY_LEN {
        return Err(CryptoError::InvalidPublicKey);
    }

    PublicKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Sign a base64-carried 32-byte digest, returning the DER signature in
/// base64.
pub fn sign_b64(privkey_b64: &str, hash_b64: &str) -> Result<String, CryptoError> {
    let sk_bytes = b64_decode(privkey_b64)?;
    let sk = SecretKey::from_slice(&sk_bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
    let digest = digest_from_b64(hash_b64)?;

    let secp = Secp256k1::signing_only();
    let sig = secp.sign_ecdsa(&digest, &sk);

    Ok(STANDARD.encode(sig.serialize_der()))
}

/// Verify a base64 DER signature by `pubkey_b64` over the decoded 32-byte
/// digest `hash_b64`.
///
/// Returns `Ok(false)` on signature mismatch; `Err` only when the key,
/// signature, or digest cannot be decoded.
pub fn verify_sign_b64(
    pubkey_b64: &str,
    hash_b64: &str,
    sign_b64: &str,
) -> Result<bool, CryptoError> {
    let pk = pubkey_from_b64(pubkey_b64)?;
    let digest = digest_from_b64(hash_b64)?;
    let sig_bytes = b64_decode(sign_b64)?;
    let sig = Signature::from_der(&sig_bytes).map_err(|_| CryptoError::InvalidSignature)?;

    let secp = Secp256k1::verification_only();
    Ok(secp.verify_ecdsa(&digest, &sig, &pk).is_ok())
}

fn digest_from_b64(hash_b64: &str) -> Result<Message, CryptoError> {
    let bytes = b64_decode(hash_b64)?;

    if bytes.len() != 32 {
        return Err(CryptoError::InvalidDigestLength(bytes.len()));
    }

    Message::from_digest_slice(&bytes).map_err(|_| CryptoError::InvalidDigestLength(bytes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::coin_hash_b64;

    #[test]
    fn keypair_shapes() {
        let (_sk, pk) = generate_keypair();
        assert_eq!(pk.len(), PUBKEY_B64_LEN);
        assert!(pubkey_from_b64(&pk).is_ok());
    }

    #[test]
    fn sign_verify_round_trip() {
        let (sk, pk) = generate_keypair();
        let hash = coin_hash_b64(b"some canonical payload");
        let sig = sign_b64(&sk, &hash).unwrap();

        assert!(verify_sign_b64(&pk, &hash, &sig).unwrap());

        let other_hash = coin_hash_b64(b"another payload");
        assert!(!verify_sign_b64(&pk, &other_hash, &sig).unwrap());
    }

    #[test]
    fn wrong_key_does_not_verify() {
        let (sk, _pk) = generate_keypair();
        let (_sk2, pk2) = generate_keypair();
        let hash = coin_hash_b64(b"payload");
        let sig = sign_b64(&sk, &hash).unwrap();

        assert!(!verify_sign_b64(&pk2, &hash, &sig).unwrap());
    }

    #[test]
    fn malformed_material_is_an_error() {
        let (sk, pk) = generate_keypair();
        let hash = coin_hash_b64(b"payload");
        let sig = sign_b64(&sk, &hash).unwrap();

        assert!(verify_sign_b64("not-base64!!", &hash, &sig).is_err());
        assert!(verify_sign_b64(&pk, "c2hvcnQ=", &sig).is_err());
        assert!(verify_sign_b64(&pk, &hash, "AAAA").is_err());
    }
}
