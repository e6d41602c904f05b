//! Durable block storage on sled.
//!
//! One tree, keyed by the 44-character base64 block hash; the value is the
//! canonical JSON document `{hash, sign, data, tx, children}`. Appending a
//! block writes the new document and the parent document with its grown
//! `children` list in a single atomic batch, so a crash can never observe
//! a child without its back-link.

use std::path::Path;

use serde_json::{json, Value};
use sled::Batch;
use thiserror::Error;
use tracing::info;

use lib_crypto::coin_hash_b64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("stored block {0} is corrupt: {1}")]
    Corrupt(String, String),
    #[error("unknown block {0}")]
    Unknown(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Sled-backed store of block documents.
pub struct BlockStore {
    db: sled::Db,
}

impl BlockStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path).map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { db })
    }

    /// An in-memory store for tests.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { db })
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Fetch a stored block document, verifying that it still re-hashes to
    /// its key. A mismatch means disk corruption: fatal for the caller.
    pub fn get_block(&self, hash: &str) -> StoreResult<Option<Value>> {
        let Some(raw) = self
            .db
            .get(hash.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };

        let doc: Value = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Corrupt(hash.to_string(), e.to_string()))?;

        let data = doc
            .get("data")
            .ok_or_else(|| StoreError::Corrupt(hash.to_string(), "missing data".into()))?;
        let data_bytes = serde_json::to_vec(data)
            .map_err(|e| StoreError::Corrupt(hash.to_string(), e.to_string()))?;

        if coin_hash_b64(&data_bytes) != hash {
            return Err(StoreError::Corrupt(
                hash.to_string(),
                "data does not re-hash to key".into(),
            ));
        }

        Ok(Some(doc))
    }

    /// Write the genesis document. Only valid on an empty store.
    pub fn put_genesis(&self, doc: &Value) -> StoreResult<()> {
        let hash = doc
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Corrupt("genesis".into(), "missing hash".into()))?;

        let bytes = serde_json::to_vec(doc).map_err(|e| StoreError::Database(e.to_string()))?;
        self.db
            .insert(hash.as_bytes(), bytes)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        self.flush()?;
        info!(%hash, "genesis block written");

        Ok(())
    }

    /// Persist a new block and the parent's updated children list in one
    /// atomic batch. `doc` must carry `hash`, `sign`, `data` and `tx`; the
    /// `children` list is initialized empty here.
    pub fn append_block(&self, doc: &Value, parent_hash: &str) -> StoreResult<()> {
        let hash = doc
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Corrupt("new block".into(), "missing hash".into()))?
            .to_string();

        let mut parent = self
            .get_block(parent_hash)?
            .ok_or_else(|| StoreError::Unknown(parent_hash.to_string()))?;

        let children = parent
            .get_mut("children")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| {
                StoreError::Corrupt(parent_hash.to_string(), "missing children".into())
            })?;

        if !children.iter().any(|c| c.as_str() == Some(&hash)) {
            children.push(json!(hash));
        }

        let mut stored = doc.clone();
        if stored.get("children").is_none() {
            stored["children"] = json!([]);
        }

        let mut batch = Batch::default();
        batch.insert(
            hash.as_bytes(),
            serde_json::to_vec(&stored).map_err(|e| StoreError::Database(e.to_string()))?,
        );
        batch.insert(
            parent_hash.as_bytes(),
            serde_json::to_vec(&parent).map_err(|e| StoreError::Database(e.to_string()))?,
        );

        self.db
            .apply_batch(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        self.flush()
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Every stored document, for the boot-time chain reconstruction. Each
    /// document is integrity-checked against its key.
    pub fn load_all(&self) -> StoreResult<Vec<Value>> {
        let mut docs = Vec::new();

        for item in self.db.iter() {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let hash = String::from_utf8_lossy(&key).to_string();
            let doc = self
                .get_block(&hash)?
                .ok_or_else(|| StoreError::Unknown(hash.clone()))?;
            docs.push(doc);
        }

        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::coin_hash_b64;
    use serde_json::json;

    fn doc_for(data: Value) -> Value {
        let hash = coin_hash_b64(&serde_json::to_vec(&data).unwrap());
        json!({"hash": hash, "sign": "", "data": data, "tx": [], "children": []})
    }

    #[test]
    fn append_links_parent_and_child_atomically() {
        let store = BlockStore::open_temporary().unwrap();

        let genesis = doc_for(json!({"id": 0u64}));
        let genesis_hash = genesis["hash"].as_str().unwrap().to_string();
        store.put_genesis(&genesis).unwrap();

        let child = doc_for(json!({"id": 1u64, "pre_hash": genesis_hash}));
        let child_hash = child["hash"].as_str().unwrap().to_string();
        store.append_block(&child, &genesis_hash).unwrap();

        let stored_parent = store.get_block(&genesis_hash).unwrap().unwrap();
        assert_eq!(stored_parent["children"], json!([child_hash]));

        let stored_child = store.get_block(&child_hash).unwrap().unwrap();
        assert_eq!(stored_child["children"], json!([]));
    }

    #[test]
    fn append_is_idempotent_on_children() {
        let store = BlockStore::open_temporary().unwrap();
        let genesis = doc_for(json!({"id": 0u64}));
        let genesis_hash = genesis["hash"].as_str().unwrap().to_string();
        store.put_genesis(&genesis).unwrap();

        let child = doc_for(json!({"id": 1u64, "pre_hash": genesis_hash}));
        store.append_block(&child, &genesis_hash).unwrap();
        store.append_block(&child, &genesis_hash).unwrap();

        let stored_parent = store.get_block(&genesis_hash).unwrap().unwrap();
        assert_eq!(stored_parent["children"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_value_is_detected() {
        let store = BlockStore::open_temporary().unwrap();
        let data = json!({"id": 0u64});
        let hash = coin_hash_b64(&serde_json::to_vec(&data).unwrap());
        // stored data does not match the key
        let doc = json!({"hash": hash, "sign": "", "data": {"id": 99u64}, "tx": [], "children": []});
        store
            .db
            .insert(hash.as_bytes(), serde_json::to_vec(&doc).unwrap())
            .unwrap();

        assert!(matches!(
            store.get_block(&hash),
            Err(StoreError::Corrupt(_, _))
        ));
    }

    #[test]
    fn missing_parent_is_an_error() {
        let store = BlockStore::open_temporary().unwrap();
        let child = doc_for(json!({"id": 1u64}));
        assert!(matches!(
            store.append_block(&child, "nope"),
            Err(StoreError::Unknown(_))
        ));
    }
}
