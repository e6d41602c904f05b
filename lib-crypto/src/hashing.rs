//! Double-SHA-256 hashing and the base64 conventions shared by the whole
//! wire protocol.
//!
//! The canonical hash of any JSON value is computed over its serialized
//! bytes in received key order; callers serialize, this module only hashes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

use crate::CryptoError;

/// SHA-256 applied twice.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Double SHA-256 of `data`, as raw bytes.
pub fn coin_hash(data: &[u8]) -> [u8; 32] {
    sha256d(data)
}

/// Double SHA-256 of `data`, encoded with the standard base64 alphabet.
///
/// This is the node's id function: block hashes and transaction ids are
/// exactly `coin_hash_b64(canonical_json(data))`, always 44 characters.
pub fn coin_hash_b64(data: &[u8]) -> String {
    STANDARD.encode(sha256d(data))
}

/// Standard-alphabet base64 with padding.
pub fn b64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode standard-alphabet base64, padding required.
pub fn b64_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(s)
        .map_err(|e| CryptoError::InvalidBase64(e.to_string()))
}

/// True when `s` contains only standard base64 characters (`A-Za-z0-9+/`),
/// with `=` permitted as trailing padding only.
pub fn is_base64_string(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }

    let bytes = s.as_bytes();
    let body_end = bytes.len() - bytes.iter().rev().take_while(|&&b| b == b'=').count();

    if bytes.len() - body_end > 2 {
        return false;
    }

    bytes[..body_end]
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}

/// Check that `hash` carries at least `zero_bits` leading zero bits.
///
/// `zero_bits` outside `1..=256` never satisfies the check; the caller is
/// expected to have range-validated it already.
pub fn hash_pow(hash: &[u8; 32], zero_bits: u32) -> bool {
    if zero_bits == 0 || zero_bits > 256 {
        return false;
    }

    let full_bytes = (zero_bits / 8) as usize;
    let rem_bits = zero_bits % 8;

    if hash[..full_bytes].iter().any(|&b| b != 0) {
        return false;
    }

    if rem_bits > 0 {
        // the next byte must start with rem_bits zeros
        if hash[full_bytes] >> (8 - rem_bits) != 0 {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_hash_is_double_sha256() {
        let data = b"askcoin";
        let once: [u8; 32] = Sha256::digest(data).into();
        let twice: [u8; 32] = Sha256::digest(once).into();
        assert_eq!(coin_hash(data), twice);
        assert_eq!(coin_hash_b64(data), STANDARD.encode(twice));
    }

    #[test]
    fn coin_hash_b64_is_44_chars() {
        assert_eq!(coin_hash_b64(b"").len(), 44);
        assert_eq!(coin_hash_b64(b"{\"id\":1}").len(), 44);
    }

    #[test]
    fn base64_string_validation() {
        assert!(is_base64_string("AQIDBA=="));
        assert!(is_base64_string("abc+/123"));
        assert!(!is_base64_string(""));
        assert!(!is_base64_string("has space"));
        assert!(!is_base64_string("pad=middle"));
        assert!(!is_base64_string("too===="));
    }

    #[test]
    fn pow_bit_check() {
        let mut hash = [0u8; 32];
        hash[0] = 0x01; // 7 leading zero bits
        assert!(hash_pow(&hash, 7));
        assert!(!hash_pow(&hash, 8));

        let zeros = [0u8; 32];
        assert!(hash_pow(&zeros, 256));
        assert!(!hash_pow(&zeros, 0));
        assert!(!hash_pow(&zeros, 257));

        let mut hash = [0u8; 32];
        hash[2] = 0x80; // exactly 16 leading zero bits
        assert!(hash_pow(&hash, 16));
        assert!(!hash_pow(&hash, 17));
    }
}
