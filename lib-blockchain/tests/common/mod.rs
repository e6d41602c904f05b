//! Shared scaffolding for chain integration tests: keypairs, transaction
//! construction with real signatures, and low-difficulty block mining.

use serde_json::{json, Value};

use lib_blockchain::chain::{genesis_doc, Blockchain, GenesisConfig};
use lib_blockchain::pow::AccumPow;
use lib_blockchain::store::BlockStore;
use lib_blockchain::tx::TX_FEE;
use lib_crypto::{b64_encode, coin_hash_b64, generate_keypair, hash_pow, sha256d, sign_b64};
use lib_network::message::{
    envelope, ASKCOIN_VERSION, BLOCK_BRIEF_RSP, BLOCK_BROADCAST, BLOCK_DETAIL_RSP, MSG_BLOCK,
    MSG_TX, TX_BROADCAST,
};
use lib_network::NodeHandle;

pub const BASE_UTC: u64 = 1_518_000_000;

#[derive(Clone)]
pub struct Keys {
    pub privkey: String,
    pub pubkey: String,
}

pub fn keys() -> Keys {
    let (privkey, pubkey) = generate_keypair();
    Keys { privkey, pubkey }
}

/// A fresh chain on a temporary store whose genesis root is a real
/// keypair, plus a detached network handle for score assertions.
pub fn test_chain() -> (Blockchain, NodeHandle, Keys) {
    let root = keys();
    let config = GenesisConfig::new(root.pubkey.clone(), BASE_UTC);
    let store = BlockStore::open_temporary().unwrap();
    let net = NodeHandle::detached();
    let chain = Blockchain::load(store, &config, net.clone()).unwrap();
    (chain, net, root)
}

pub fn genesis_hash(root: &Keys) -> String {
    let config = GenesisConfig::new(root.pubkey.clone(), BASE_UTC);
    genesis_doc(&config)["hash"].as_str().unwrap().to_string()
}

/// Accumulated pow of a chain of `blocks_after_genesis + 1` blocks that
/// all carry `zero_bits = 1`.
pub fn accum_after(blocks_after_genesis: u64) -> AccumPow {
    let mut pow = AccumPow::zero();
    for _ in 0..=blocks_after_genesis {
        pow.add_pow(1).unwrap();
    }
    pow
}

// ----------------------------------------------------------------------
// Transactions
// ----------------------------------------------------------------------

pub fn register_tx(new_account: &Keys, name: &str, referrer: &Keys, block_id: u64) -> Value {
    let sign_data = json!({
        "block_id": block_id,
        "fee": TX_FEE,
        "name": b64_encode(name.as_bytes()),
        "referrer": referrer.pubkey,
    });
    let inner_hash = coin_hash_b64(&serde_json::to_vec(&sign_data).unwrap());
    let inner_sign = sign_b64(&referrer.privkey, &inner_hash).unwrap();

    let data = json!({
        "type": 1u32,
        "utc": BASE_UTC,
        "pubkey": new_account.pubkey,
        "avatar": 5u64,
        "sign": inner_sign,
        "sign_data": sign_data,
    });
    seal_tx(&new_account.privkey, data)
}

pub fn send_tx(author: &Keys, receiver_pubkey: &str, amount: u64, block_id: u64) -> Value {
    let data = json!({
        "type": 2u32,
        "utc": BASE_UTC,
        "pubkey": author.pubkey,
        "block_id": block_id,
        "fee": TX_FEE,
        "receiver": receiver_pubkey,
        "amount": amount,
    });
    seal_tx(&author.privkey, data)
}

pub fn topic_tx(author: &Keys, payload: &[u8], reward: u64, block_id: u64) -> Value {
    let data = json!({
        "type": 3u32,
        "utc": BASE_UTC,
        "pubkey": author.pubkey,
        "block_id": block_id,
        "fee": TX_FEE,
        "topic": b64_encode(payload),
        "reward": reward,
    });
    seal_tx(&author.privkey, data)
}

pub fn reply_tx(author: &Keys, topic_key: &str, payload: &[u8], block_id: u64) -> Value {
    let data = json!({
        "type": 4u32,
        "utc": BASE_UTC,
        "pubkey": author.pubkey,
        "block_id": block_id,
        "fee": TX_FEE,
        "topic_key": topic_key,
        "reply": b64_encode(payload),
    });
    seal_tx(&author.privkey, data)
}

pub fn reward_tx(
    author: &Keys,
    topic_key: &str,
    reply_to: &str,
    amount: u64,
    block_id: u64,
) -> Value {
    let data = json!({
        "type": 5u32,
        "utc": BASE_UTC,
        "pubkey": author.pubkey,
        "block_id": block_id,
        "fee": TX_FEE,
        "topic_key": topic_key,
        "amount": amount,
        "reply_to": reply_to,
    });
    seal_tx(&author.privkey, data)
}

pub fn tx_id_of(tx_doc: &Value) -> String {
    coin_hash_b64(&serde_json::to_vec(&tx_doc["data"]).unwrap())
}

fn seal_tx(privkey: &str, data: Value) -> Value {
    let id = coin_hash_b64(&serde_json::to_vec(&data).unwrap());
    let sign = sign_b64(privkey, &id).unwrap();
    json!({"sign": sign, "data": data})
}

// ----------------------------------------------------------------------
// Blocks
// ----------------------------------------------------------------------

/// A block document `{hash, sign, data, tx}` mined at `zero_bits = 1` by
/// nonce search.
pub fn mine_block(
    id: u64,
    utc: u64,
    pre_hash: &str,
    miner: &Keys,
    txs: &[Value],
) -> Value {
    let tx_ids: Vec<String> = txs.iter().map(tx_id_of).collect();

    for nonce in 0u64.. {
        let data = json!({
            "id": id,
            "utc": utc,
            "version": ASKCOIN_VERSION,
            "zero_bits": 1u32,
            "pre_hash": pre_hash,
            "miner": miner.pubkey,
            "nonce": [nonce, 0u64, 0u64, 0u64],
            "tx_ids": tx_ids,
        });
        let bytes = serde_json::to_vec(&data).unwrap();
        let digest = sha256d(&bytes);

        if hash_pow(&digest, 1) {
            let hash = coin_hash_b64(&bytes);
            let sign = sign_b64(&miner.privkey, &hash).unwrap();
            return json!({"hash": hash, "sign": sign, "data": data, "tx": txs});
        }
    }

    unreachable!("a zero_bits=1 nonce always exists");
}

pub fn block_hash(block_doc: &Value) -> String {
    block_doc["hash"].as_str().unwrap().to_string()
}

pub fn broadcast_doc(block_doc: &Value, declared: AccumPow) -> Value {
    let mut doc = envelope(MSG_BLOCK, BLOCK_BROADCAST);
    doc.insert("hash".into(), block_doc["hash"].clone());
    doc.insert("sign".into(), block_doc["sign"].clone());
    doc.insert("pow".into(), json!(declared.words()));
    doc.insert("data".into(), block_doc["data"].clone());
    Value::Object(doc)
}

pub fn brief_rsp_doc(block_doc: &Value) -> Value {
    let mut doc = envelope(MSG_BLOCK, BLOCK_BRIEF_RSP);
    doc.insert("hash".into(), block_doc["hash"].clone());
    doc.insert("sign".into(), block_doc["sign"].clone());
    doc.insert("data".into(), block_doc["data"].clone());
    Value::Object(doc)
}

pub fn detail_rsp_doc(block_doc: &Value) -> Value {
    let mut doc = envelope(MSG_BLOCK, BLOCK_DETAIL_RSP);
    doc.insert("hash".into(), block_doc["hash"].clone());
    doc.insert("sign".into(), block_doc["sign"].clone());
    doc.insert("data".into(), block_doc["data"].clone());
    doc.insert("tx".into(), block_doc["tx"].clone());
    Value::Object(doc)
}

pub fn tx_broadcast_doc(tx_doc: &Value) -> Value {
    let mut doc = envelope(MSG_TX, TX_BROADCAST);
    doc.insert("sign".into(), tx_doc["sign"].clone());
    doc.insert("data".into(), tx_doc["data"].clone());
    Value::Object(doc)
}
