//! Block structures and wire-document validation.
//!
//! A block travels (and persists) as `{hash, sign, data, tx?, children?}`.
//! `data` is the hashed region; its serialization in received key order is
//! the canonical byte string for both the id and the proof-of-work check.
//! Live blocks keep only header-level fields; transaction bodies are read
//! back from storage when a branch has to be reverted.

use serde_json::Value;

use lib_crypto::{b64_decode, coin_hash_b64, hash_pow, is_base64_string};

use crate::pow::AccumPow;

/// Base64 length of a 32-byte hash.
pub const HASH_B64_LEN: usize = 44;

/// Base64 length of a 65-byte uncompressed public key.
pub const PUBKEY_B64_LEN: usize = 88;

/// Upper bound on transactions in one block.
pub const MAX_TX_PER_BLOCK: usize = 2000;

/// A fully validated block linked into the in-memory chain.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: u64,
    pub utc: u64,
    pub version: u32,
    pub zero_bits: u32,
    pub hash: String,
    pub pre_hash: String,
    pub miner_pubkey: String,
    pub accum_pow: AccumPow,
    /// `utc - parent.utc`; drives the child's required zero-bits.
    pub utc_diff: u64,
    /// Whether the reserve fund paid the 5000-unit subsidy when this block
    /// committed. Needed so reversal is exact.
    pub subsidy_paid: bool,
}

/// A received but unapplied block header, known only by announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBlock {
    pub id: u64,
    pub utc: u64,
    pub version: u32,
    pub zero_bits: u32,
    pub hash: String,
    pub pre_hash: String,
}

/// The parsed `data` object of a block document.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub id: u64,
    pub utc: u64,
    pub version: u32,
    pub zero_bits: u32,
    pub pre_hash: String,
    pub miner: String,
    pub nonce: [u64; 4],
    pub tx_ids: Vec<String>,
}

/// Why a block document failed structural validation. All of these are
/// protocol violations on the path that received the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDocError {
    Envelope,
    HashMismatch,
    Header,
}

/// Validate the outer envelope: `hash` and `sign` strings of plausible
/// shape plus a `data` object that re-hashes to `hash`.
///
/// Returns the canonical data bytes for the proof-of-work check.
pub fn verify_envelope(doc: &Value) -> Result<(String, String, Vec<u8>), BlockDocError> {
    let hash = doc
        .get("hash")
        .and_then(Value::as_str)
        .ok_or(BlockDocError::Envelope)?;
    let sign = doc
        .get("sign")
        .and_then(Value::as_str)
        .ok_or(BlockDocError::Envelope)?;

    if hash.len() != HASH_B64_LEN || !is_base64_string(hash) || !is_base64_string(sign) {
        return Err(BlockDocError::Envelope);
    }

    let data = doc.get("data").ok_or(BlockDocError::Envelope)?;

    if !data.is_object() {
        return Err(BlockDocError::Envelope);
    }

    let data_bytes = serde_json::to_vec(data).map_err(|_| BlockDocError::Envelope)?;

    if coin_hash_b64(&data_bytes) != hash {
        return Err(BlockDocError::HashMismatch);
    }

    Ok((hash.to_string(), sign.to_string(), data_bytes))
}

impl BlockData {
    /// Field-by-field validation of a block's `data` object.
    pub fn parse(data: &Value) -> Result<Self, BlockDocError> {
        let id = get_u64(data, "id").ok_or(BlockDocError::Header)?;

        if id == 0 {
            // genesis is never transmitted
            return Err(BlockDocError::Header);
        }

        let utc = get_u64(data, "utc").ok_or(BlockDocError::Header)?;
        let version = get_u32(data, "version").ok_or(BlockDocError::Header)?;
        let zero_bits = get_u32(data, "zero_bits").ok_or(BlockDocError::Header)?;

        if zero_bits == 0 || zero_bits > 256 {
            return Err(BlockDocError::Header);
        }

        let pre_hash = data
            .get("pre_hash")
            .and_then(Value::as_str)
            .ok_or(BlockDocError::Header)?;

        if pre_hash.len() != HASH_B64_LEN || !is_base64_string(pre_hash) {
            return Err(BlockDocError::Header);
        }

        let miner = data
            .get("miner")
            .and_then(Value::as_str)
            .ok_or(BlockDocError::Header)?;

        if miner.len() != PUBKEY_B64_LEN || !is_base64_string(miner) {
            return Err(BlockDocError::Header);
        }

        let nonce_arr = data
            .get("nonce")
            .and_then(Value::as_array)
            .ok_or(BlockDocError::Header)?;

        if nonce_arr.len() != 4 {
            return Err(BlockDocError::Header);
        }

        let mut nonce = [0u64; 4];
        for (slot, value) in nonce.iter_mut().zip(nonce_arr) {
            *slot = value.as_u64().ok_or(BlockDocError::Header)?;
        }

        let tx_ids_arr = data
            .get("tx_ids")
            .and_then(Value::as_array)
            .ok_or(BlockDocError::Header)?;

        if tx_ids_arr.len() > MAX_TX_PER_BLOCK {
            return Err(BlockDocError::Header);
        }

        let mut tx_ids = Vec::with_capacity(tx_ids_arr.len());
        for id in tx_ids_arr {
            let id = id.as_str().ok_or(BlockDocError::Header)?;

            if id.len() != HASH_B64_LEN || !is_base64_string(id) {
                return Err(BlockDocError::Header);
            }

            tx_ids.push(id.to_string());
        }

        Ok(Self {
            id,
            utc,
            version,
            zero_bits,
            pre_hash: pre_hash.to_string(),
            miner: miner.to_string(),
            nonce,
            tx_ids,
        })
    }

    pub fn to_pending(&self, hash: &str) -> PendingBlock {
        PendingBlock {
            id: self.id,
            utc: self.utc,
            version: self.version,
            zero_bits: self.zero_bits,
            hash: hash.to_string(),
            pre_hash: self.pre_hash.clone(),
        }
    }
}

/// Check the proof of work of a validated envelope: the decoded hash must
/// carry the claimed number of leading zero bits.
pub fn verify_block_pow(hash_b64: &str, zero_bits: u32) -> bool {
    let Ok(bytes) = b64_decode(hash_b64) else {
        return false;
    };

    let Ok(bytes) = <[u8; 32]>::try_from(bytes) else {
        return false;
    };

    hash_pow(&bytes, zero_bits)
}

/// Required zero-bits of a child given its parent, per the ±1 rule: a fast
/// parent (utc_diff < 15 s) tightens by one, a slow one (> 35 s) relaxes by
/// one with a floor of 1.
pub fn expected_zero_bits(parent_zero_bits: u32, parent_utc_diff: u64) -> u32 {
    if parent_utc_diff < 15 {
        parent_zero_bits + 1
    } else if parent_utc_diff > 35 {
        parent_zero_bits.saturating_sub(1).max(1)
    } else {
        parent_zero_bits
    }
}

fn get_u64(doc: &Value, field: &str) -> Option<u64> {
    doc.get(field)?.as_u64()
}

fn get_u32(doc: &Value, field: &str) -> Option<u32> {
    doc.get(field)?
        .as_u64()
        .filter(|&v| v <= u32::MAX as u64)
        .map(|v| v as u32)
}
