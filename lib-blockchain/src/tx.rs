//! Transaction documents: the five kinds, their structural validation, and
//! canonical ids.
//!
//! A transaction travels as `{sign, data}` where `data` carries at least
//! `type`, `utc` and `pubkey`. The id is the double-SHA-256 of `data`
//! serialized in received key order; `sign` is the author's ECDSA over the
//! decoded id. Type 1 additionally nests a `sign_data` object signed by the
//! referrer.
//!
//! Parsing here is purely structural. Whether the referenced accounts,
//! topics and balances exist is the world state's business at apply time.

use serde_json::Value;

use lib_crypto::{coin_hash_b64, is_base64_string, verify_sign_b64};

use crate::account::valid_account_name;
use crate::block::{HASH_B64_LEN, PUBKEY_B64_LEN};

/// Flat fee carried by every transaction: one unit to the miner, one to the
/// author's referrer or the reserve fund.
pub const TX_FEE: u64 = 2;

/// A transaction's `block_id` must lie within this many blocks of the block
/// applying it.
pub const TX_ID_WINDOW: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxBody {
    Register {
        name: String,
        referrer_pubkey: String,
        avatar: u64,
        /// Referrer's signature over the canonical `sign_data`.
        inner_sign: String,
        /// Canonical bytes of `sign_data`, kept for signature checking.
        sign_data_hash: String,
    },
    Send {
        receiver_pubkey: String,
        amount: u64,
        memo: Option<String>,
    },
    NewTopic {
        topic: String,
        reward: u64,
    },
    Reply {
        topic_key: String,
        reply: String,
        reply_to: Option<String>,
    },
    Reward {
        topic_key: String,
        amount: u64,
        reply_to: String,
    },
}

/// A structurally valid transaction, id recomputed from its canonical
/// bytes. Signature verification is a separate step so callers control
/// punish granularity.
#[derive(Debug, Clone, PartialEq)]
pub struct TxEnvelope {
    pub id: String,
    pub sign: String,
    pub pubkey: String,
    pub utc: u64,
    pub tx_type: u32,
    /// The window anchor; for type 1 it lives inside `sign_data`.
    pub block_id: u64,
    pub body: TxBody,
    /// The full `{sign, data}` document as received, for storage and
    /// rebroadcast.
    pub doc: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TxParseError {
    #[error("malformed transaction envelope")]
    Envelope,
    #[error("unknown transaction type")]
    UnknownType,
    #[error("malformed transaction payload")]
    Payload,
}

impl TxEnvelope {
    pub fn parse(doc: &Value) -> Result<Self, TxParseError> {
        let sign = doc
            .get("sign")
            .and_then(Value::as_str)
            .ok_or(TxParseError::Envelope)?;

        if !is_base64_string(sign) {
            return Err(TxParseError::Envelope);
        }

        let data = doc.get("data").ok_or(TxParseError::Envelope)?;

        if !data.is_object() {
            return Err(TxParseError::Envelope);
        }

        let pubkey = data
            .get("pubkey")
            .and_then(Value::as_str)
            .ok_or(TxParseError::Envelope)?;

        if pubkey.len() != PUBKEY_B64_LEN || !is_base64_string(pubkey) {
            return Err(TxParseError::Envelope);
        }

        let tx_type = get_u32(data, "type").ok_or(TxParseError::Envelope)?;
        let utc = get_u64(data, "utc").ok_or(TxParseError::Envelope)?;

        let data_bytes = serde_json::to_vec(data).map_err(|_| TxParseError::Envelope)?;
        let id = coin_hash_b64(&data_bytes);

        let (block_id, body) = parse_body(tx_type, data)?;

        Ok(Self {
            id,
            sign: sign.to_string(),
            pubkey: pubkey.to_string(),
            utc,
            tx_type,
            block_id,
            body,
            doc: doc.clone(),
        })
    }

    /// Author signature over the transaction id.
    pub fn verify_sig(&self) -> bool {
        verify_sign_b64(&self.pubkey, &self.id, &self.sign).unwrap_or(false)
    }

    /// For type 1: referrer signature over the canonical `sign_data`.
    pub fn verify_inner_sig(&self) -> bool {
        match &self.body {
            TxBody::Register {
                referrer_pubkey,
                inner_sign,
                sign_data_hash,
                ..
            } => verify_sign_b64(referrer_pubkey, sign_data_hash, inner_sign).unwrap_or(false),
            _ => true,
        }
    }
}

fn parse_body(tx_type: u32, data: &Value) -> Result<(u64, TxBody), TxParseError> {
    match tx_type {
        1 => parse_register(data),
        2 => parse_send(data),
        3 => parse_new_topic(data),
        4 => parse_reply(data),
        5 => parse_reward(data),
        _ => Err(TxParseError::UnknownType),
    }
}

fn parse_register(data: &Value) -> Result<(u64, TxBody), TxParseError> {
    let avatar = get_u64(data, "avatar").ok_or(TxParseError::Payload)?;

    if avatar == 0 || avatar > 100 {
        return Err(TxParseError::Payload);
    }

    let inner_sign = data
        .get("sign")
        .and_then(Value::as_str)
        .ok_or(TxParseError::Payload)?;

    if !is_base64_string(inner_sign) {
        return Err(TxParseError::Payload);
    }

    let sign_data = data.get("sign_data").ok_or(TxParseError::Payload)?;

    if !sign_data.is_object() {
        return Err(TxParseError::Payload);
    }

    let block_id = get_u64(sign_data, "block_id").ok_or(TxParseError::Payload)?;

    if get_u64(sign_data, "fee") != Some(TX_FEE) {
        return Err(TxParseError::Payload);
    }

    let name = sign_data
        .get("name")
        .and_then(Value::as_str)
        .ok_or(TxParseError::Payload)?;

    if !valid_account_name(name) {
        return Err(TxParseError::Payload);
    }

    let referrer = sign_data
        .get("referrer")
        .and_then(Value::as_str)
        .ok_or(TxParseError::Payload)?;

    if referrer.len() != PUBKEY_B64_LEN || !is_base64_string(referrer) {
        return Err(TxParseError::Payload);
    }

    let sign_data_bytes = serde_json::to_vec(sign_data).map_err(|_| TxParseError::Payload)?;

    Ok((
        block_id,
        TxBody::Register {
            name: name.to_string(),
            referrer_pubkey: referrer.to_string(),
            avatar,
            inner_sign: inner_sign.to_string(),
            sign_data_hash: coin_hash_b64(&sign_data_bytes),
        },
    ))
}

fn parse_send(data: &Value) -> Result<(u64, TxBody), TxParseError> {
    let block_id = parse_common_tail(data)?;

    let receiver = data
        .get("receiver")
        .and_then(Value::as_str)
        .ok_or(TxParseError::Payload)?;

    if receiver.len() != PUBKEY_B64_LEN || !is_base64_string(receiver) {
        return Err(TxParseError::Payload);
    }

    let amount = get_u64(data, "amount").ok_or(TxParseError::Payload)?;

    if amount == 0 {
        return Err(TxParseError::Payload);
    }

    let memo = match data.get("memo") {
        None => None,
        Some(memo) => {
            let memo = memo.as_str().ok_or(TxParseError::Payload)?;

            if memo.is_empty() {
                None
            } else {
                if memo.len() < 4 || memo.len() > 80 || !is_base64_string(memo) {
                    return Err(TxParseError::Payload);
                }
                Some(memo.to_string())
            }
        }
    };

    Ok((
        block_id,
        TxBody::Send {
            receiver_pubkey: receiver.to_string(),
            amount,
            memo,
        },
    ))
}

fn parse_new_topic(data: &Value) -> Result<(u64, TxBody), TxParseError> {
    let block_id = parse_common_tail(data)?;

    let topic = data
        .get("topic")
        .and_then(Value::as_str)
        .ok_or(TxParseError::Payload)?;

    if topic.len() < 4 || topic.len() > 400 || !is_base64_string(topic) {
        return Err(TxParseError::Payload);
    }

    let reward = get_u64(data, "reward").ok_or(TxParseError::Payload)?;

    if reward == 0 {
        return Err(TxParseError::Payload);
    }

    Ok((
        block_id,
        TxBody::NewTopic {
            topic: topic.to_string(),
            reward,
        },
    ))
}

fn parse_reply(data: &Value) -> Result<(u64, TxBody), TxParseError> {
    let block_id = parse_common_tail(data)?;
    let topic_key = parse_topic_key(data)?;

    let reply = data
        .get("reply")
        .and_then(Value::as_str)
        .ok_or(TxParseError::Payload)?;

    if reply.len() < 4 || reply.len() > 400 || !is_base64_string(reply) {
        return Err(TxParseError::Payload);
    }

    let reply_to = match data.get("reply_to") {
        None => None,
        Some(to) => {
            let to = to.as_str().ok_or(TxParseError::Payload)?;

            if to.len() != HASH_B64_LEN || !is_base64_string(to) {
                return Err(TxParseError::Payload);
            }

            Some(to.to_string())
        }
    };

    Ok((
        block_id,
        TxBody::Reply {
            topic_key,
            reply: reply.to_string(),
            reply_to,
        },
    ))
}

fn parse_reward(data: &Value) -> Result<(u64, TxBody), TxParseError> {
    let block_id = parse_common_tail(data)?;
    let topic_key = parse_topic_key(data)?;

    let amount = get_u64(data, "amount").ok_or(TxParseError::Payload)?;

    if amount == 0 {
        return Err(TxParseError::Payload);
    }

    let reply_to = data
        .get("reply_to")
        .and_then(Value::as_str)
        .ok_or(TxParseError::Payload)?;

    if reply_to.len() != HASH_B64_LEN || !is_base64_string(reply_to) {
        return Err(TxParseError::Payload);
    }

    Ok((
        block_id,
        TxBody::Reward {
            topic_key,
            amount,
            reply_to: reply_to.to_string(),
        },
    ))
}

/// `block_id` plus the fixed fee, shared by types 2–5.
fn parse_common_tail(data: &Value) -> Result<u64, TxParseError> {
    let block_id = get_u64(data, "block_id").ok_or(TxParseError::Payload)?;

    if get_u64(data, "fee") != Some(TX_FEE) {
        return Err(TxParseError::Payload);
    }

    Ok(block_id)
}

fn parse_topic_key(data: &Value) -> Result<String, TxParseError> {
    let topic_key = data
        .get("topic_key")
        .and_then(Value::as_str)
        .ok_or(TxParseError::Payload)?;

    if topic_key.len() != HASH_B64_LEN || !is_base64_string(topic_key) {
        return Err(TxParseError::Payload);
    }

    Ok(topic_key.to_string())
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

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::{b64_encode, generate_keypair, sign_b64};
    use serde_json::json;

    fn send_doc(privkey: &str, pubkey: &str) -> Value {
        let data = json!({
            "type": 2u32,
            "utc": 1_600_000_000u64,
            "pubkey": pubkey,
            "block_id": 5u64,
            "fee": TX_FEE,
            "receiver": b64_encode(&[7u8; 65]),
            "amount": 100u64,
        });
        let id = coin_hash_b64(&serde_json::to_vec(&data).unwrap());
        let sign = sign_b64(privkey, &id).unwrap();
        json!({"sign": sign, "data": data})
    }

    #[test]
    fn parse_and_verify_send() {
        let (sk, pk) = generate_keypair();
        let doc = send_doc(&sk, &pk);
        let tx = TxEnvelope::parse(&doc).unwrap();

        assert_eq!(tx.tx_type, 2);
        assert_eq!(tx.block_id, 5);
        assert!(tx.verify_sig());
        assert!(matches!(tx.body, TxBody::Send { amount: 100, .. }));
    }

    #[test]
    fn id_covers_data_key_order() {
        let (sk, pk) = generate_keypair();
        let doc = send_doc(&sk, &pk);
        let tx = TxEnvelope::parse(&doc).unwrap();

        // the id is derived from the bytes of `data` exactly as received
        let recomputed = coin_hash_b64(&serde_json::to_vec(doc.get("data").unwrap()).unwrap());
        assert_eq!(tx.id, recomputed);
    }

    #[test]
    fn wrong_fee_rejected() {
        let (sk, pk) = generate_keypair();
        let mut doc = send_doc(&sk, &pk);
        doc["data"]["fee"] = json!(3u64);
        assert_eq!(TxEnvelope::parse(&doc), Err(TxParseError::Payload));
    }

    #[test]
    fn register_requires_valid_name_and_inner_sign() {
        let (ref_sk, ref_pk) = generate_keypair();
        let (sk, pk) = generate_keypair();

        let sign_data = json!({
            "block_id": 3u64,
            "fee": TX_FEE,
            "name": b64_encode(b"carol"),
            "referrer": ref_pk,
        });
        let inner_hash = coin_hash_b64(&serde_json::to_vec(&sign_data).unwrap());
        let inner_sign = sign_b64(&ref_sk, &inner_hash).unwrap();

        let data = json!({
            "type": 1u32,
            "utc": 1_600_000_000u64,
            "pubkey": pk,
            "avatar": 3u64,
            "sign": inner_sign,
            "sign_data": sign_data,
        });
        let id = coin_hash_b64(&serde_json::to_vec(&data).unwrap());
        let doc = json!({"sign": sign_b64(&sk, &id).unwrap(), "data": data});

        let tx = TxEnvelope::parse(&doc).unwrap();
        assert_eq!(tx.block_id, 3);
        assert!(tx.verify_sig());
        assert!(tx.verify_inner_sig());

        let mut bad = doc.clone();
        bad["data"]["sign_data"]["name"] = json!("a b");
        assert!(TxEnvelope::parse(&bad).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let (sk, pk) = generate_keypair();
        let mut doc = send_doc(&sk, &pk);
        doc["data"]["type"] = json!(9u32);
        assert_eq!(TxEnvelope::parse(&doc), Err(TxParseError::UnknownType));
    }

    #[test]
    fn memo_shape_enforced() {
        let (sk, pk) = generate_keypair();

        let mut doc = send_doc(&sk, &pk);
        doc["data"]["memo"] = json!("ab");
        assert!(TxEnvelope::parse(&doc).is_err());

        let mut doc = send_doc(&sk, &pk);
        doc["data"]["memo"] = json!("");
        let tx = TxEnvelope::parse(&doc).unwrap();
        assert!(matches!(tx.body, TxBody::Send { memo: None, .. }));
    }
}
