//! The blockchain worker: one logical thread owning the world state, the
//! chain synchronizer, and the mempool.
//!
//! Peer messages arrive on an unbounded channel in per-peer send order and
//! are processed strictly sequentially; timer expirations are drained on a
//! one-second tick in the same loop. Nothing else ever touches the state,
//! which is what makes rollback records sufficient for reorganization.
//!
//! Error discipline follows three tiers: protocol violations punish the
//! sending peer (close + 600 s ban + score −1000); logical rejections drop
//! the message or fail over the active request; integrity faults (storage
//! corruption, pow overflow, an unreplayable branch) surface as
//! [`ChainError`] and abort the node.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use lib_crypto::{b64_encode, coin_hash_b64, is_base64_string, verify_sign_b64};
use lib_network::message::{
    envelope, type_and_cmd, version_compatible, ASKCOIN_VERSION, BLOCK_BRIEF_REQ, BLOCK_BRIEF_RSP,
    BLOCK_BROADCAST, BLOCK_DETAIL_REQ, BLOCK_DETAIL_RSP, MSG_BLOCK, MSG_PROBE, MSG_SYS, MSG_TX,
    TX_BROADCAST,
};
use lib_network::{NetworkEvent, NodeHandle, PeerHandle};

use crate::block::{
    expected_zero_bits, verify_block_pow, verify_envelope, Block, BlockData, HASH_B64_LEN,
};
use crate::mempool::{Mempool, SubmitOutcome};
use crate::pow::AccumPow;
use crate::state::{BlockUndo, WorldState};
use crate::store::{BlockStore, StoreError};
use crate::sync::{BriefRequest, DetailRequest, SyncState, TimerController, TimerEvent};
use crate::tx::{TxEnvelope, TX_ID_WINDOW};

/// Genesis timestamp of the public network.
pub const GENESIS_UTC: u64 = 1_518_000_000;

/// Score credit for a peer whose block was applied successfully.
const BLOCK_SUPPLIER_CREDIT: u64 = 10;

/// Fatal faults. Continuing after one of these risks a silently forked
/// chain, so the worker surfaces them and the process exits non-zero.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("integrity fault: {0}")]
    Integrity(String),
}

/// The parameters that define a chain's genesis block.
#[derive(Debug, Clone)]
pub struct GenesisConfig {
    /// Public key of the root account; it mines block 0 and referees the
    /// first registrations.
    pub root_pubkey: String,
    pub utc: u64,
}

impl GenesisConfig {
    pub fn new(root_pubkey: impl Into<String>, utc: u64) -> Self {
        Self {
            root_pubkey: root_pubkey.into(),
            utc,
        }
    }
}

impl Default for GenesisConfig {
    fn default() -> Self {
        // the well-known network root key
        let mut pk = [0x11u8; 65];
        pk[0] = 0x04;
        Self {
            root_pubkey: b64_encode(&pk),
            utc: GENESIS_UTC,
        }
    }
}

/// Build the canonical genesis document. Genesis is self-certifying: its
/// identity is its hash, so it carries no signature and every signature
/// check skips block id 0.
pub fn genesis_doc(config: &GenesisConfig) -> Value {
    let data = json!({
        "id": 0u64,
        "utc": config.utc,
        "version": ASKCOIN_VERSION,
        "zero_bits": 1u32,
        "pre_hash": b64_encode(&[0u8; 32]),
        "miner": config.root_pubkey,
        "nonce": [0u64, 0u64, 0u64, 0u64],
        "tx_ids": [],
    });
    let hash = coin_hash_b64(&serde_json::to_vec(&data).expect("genesis data serializes"));

    json!({"hash": hash, "sign": "", "data": data, "tx": [], "children": []})
}

/// The node's chain-side singleton. See the module docs for the threading
/// contract.
pub struct Blockchain {
    state: WorldState,
    store: BlockStore,
    blocks: HashMap<String, Block>,
    /// Block whose state is currently applied.
    tip: String,
    /// Block with the greatest accumulated pow seen so far.
    most_difficult: String,
    genesis_hash: String,
    undo_log: HashMap<String, BlockUndo>,
    sync: SyncState,
    timers: TimerController,
    mempool: Mempool,
    net: NodeHandle,
}

impl Blockchain {
    /// Open (and on first boot, create) the chain: write genesis if the
    /// store is empty, rebuild the block DAG, pick the most difficult tip
    /// and replay its branch into the world state.
    pub fn load(
        store: BlockStore,
        config: &GenesisConfig,
        net: NodeHandle,
    ) -> Result<Self, ChainError> {
        if store.is_empty() {
            store.put_genesis(&genesis_doc(config))?;
        }

        let docs = store.load_all()?;
        let mut by_hash: HashMap<String, &Value> = HashMap::new();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut genesis_hash = None;

        for doc in &docs {
            let hash = doc_str(doc, "hash")?.to_string();
            let data = doc
                .get("data")
                .ok_or_else(|| integrity(format!("stored block {hash} lacks data")))?;
            let id = data.get("id").and_then(Value::as_u64);
            let pre_hash = data.get("pre_hash").and_then(Value::as_str);

            if id == Some(0) {
                genesis_hash = Some(hash.clone());
            } else if let Some(pre) = pre_hash {
                children.entry(pre.to_string()).or_default().push(hash.clone());
            }

            by_hash.insert(hash, doc);
        }

        let genesis_hash =
            genesis_hash.ok_or_else(|| integrity("store holds no genesis block".into()))?;

        // walk the DAG from genesis, accumulating pow
        let mut blocks: HashMap<String, Block> = HashMap::new();
        let genesis = build_block(by_hash[&genesis_hash], None)?;
        blocks.insert(genesis_hash.clone(), genesis);

        let mut queue = vec![genesis_hash.clone()];
        while let Some(hash) = queue.pop() {
            let kids = children.get(&hash).cloned().unwrap_or_default();
            let parent = blocks[&hash].clone();

            for kid in kids {
                let doc = by_hash
                    .get(&kid)
                    .copied()
                    .ok_or_else(|| integrity(format!("missing stored child {kid}")))?;
                let block = build_block(doc, Some(&parent))?;
                blocks.insert(kid.clone(), block);
                queue.push(kid);
            }
        }

        let most_difficult = blocks
            .values()
            .max_by(|a, b| (a.accum_pow, &a.hash).cmp(&(b.accum_pow, &b.hash)))
            .map(|b| b.hash.clone())
            .expect("at least genesis exists");

        let mut chain = Self {
            state: WorldState::genesis(&config.root_pubkey),
            store,
            blocks,
            tip: genesis_hash.clone(),
            most_difficult: genesis_hash.clone(),
            genesis_hash,
            undo_log: HashMap::new(),
            sync: SyncState::new(),
            timers: TimerController::new(),
            mempool: Mempool::new(),
            net,
        };

        chain.replay_to(&most_difficult)?;
        chain.most_difficult = most_difficult;
        info!(
            tip = %chain.tip,
            height = chain.tip_block().id,
            blocks = chain.blocks.len(),
            "chain loaded"
        );

        Ok(chain)
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn tip_block(&self) -> &Block {
        &self.blocks[&self.tip]
    }

    pub fn most_difficult_block(&self) -> &Block {
        &self.blocks[&self.most_difficult]
    }

    pub fn block(&self, hash: &str) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn genesis_hash(&self) -> &str {
        &self.genesis_hash
    }

    pub fn is_switching(&self) -> bool {
        self.sync.is_switching
    }

    /// Drive the worker until the event channel closes or stop flips.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<NetworkEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ChainError> {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(NetworkEvent::PeerMessage { peer, doc }) => {
                        self.handle_message(peer, doc, unix_now())?;
                    }
                    None => break,
                },
                _ = tick.tick() => self.on_tick(unix_now())?,
                _ = stop.changed() => break,
            }
        }

        self.store.flush()?;
        Ok(())
    }

    /// Dispatch one message from a registered peer.
    pub fn handle_message(
        &mut self,
        peer: PeerHandle,
        doc: Value,
        now: u64,
    ) -> Result<(), ChainError> {
        let Some((msg_type, msg_cmd)) = type_and_cmd(&doc) else {
            self.net.punish(&peer);
            return Ok(());
        };

        match msg_type {
            MSG_BLOCK => {
                match msg_cmd {
                    BLOCK_BROADCAST => self.on_block_broadcast(&peer, &doc, now)?,
                    BLOCK_BRIEF_REQ => self.on_block_req(&peer, &doc, false)?,
                    BLOCK_BRIEF_RSP => self.on_brief_rsp(&peer, &doc)?,
                    BLOCK_DETAIL_REQ => self.on_block_req(&peer, &doc, true)?,
                    BLOCK_DETAIL_RSP => self.on_detail_rsp(&peer, &doc, now)?,
                    _ => {
                        self.net.punish(&peer);
                        return Ok(());
                    }
                }
                self.do_brief_chain(now)?;
            }
            MSG_TX => match msg_cmd {
                TX_BROADCAST => self.on_tx_broadcast(&peer, &doc),
                _ => self.net.punish(&peer),
            },
            MSG_PROBE | MSG_SYS => {}
            _ => self.net.punish(&peer),
        }

        Ok(())
    }

    /// The one-second heartbeat: fire due timers, then advance the brief
    /// machinery.
    pub fn on_tick(&mut self, now: u64) -> Result<(), ChainError> {
        for event in self.timers.poll(now) {
            match event {
                TimerEvent::BriefRetry { hash } => self.on_brief_retry(&hash),
                TimerEvent::DetailRetry => self.on_detail_retry()?,
                TimerEvent::EnqueueChain { chain_id } => {
                    if self.sync.chain(chain_id).is_some() {
                        self.sync.pending_brief_chains.push(chain_id);
                    }
                }
            }
        }

        self.do_brief_chain(now)
    }

    // ------------------------------------------------------------------
    // BLOCK_BROADCAST
    // ------------------------------------------------------------------

    fn on_block_broadcast(
        &mut self,
        peer: &PeerHandle,
        doc: &Value,
        now: u64,
    ) -> Result<(), ChainError> {
        // one pending chain per peer
        if self.sync.has_pending_from(peer.key()) {
            return Ok(());
        }

        let Some(hash) = doc.get("hash").and_then(Value::as_str) else {
            self.net.punish(peer);
            return Ok(());
        };

        if hash.len() != HASH_B64_LEN || doc.get("sign").and_then(Value::as_str).is_none() {
            self.net.punish(peer);
            return Ok(());
        }

        if self.blocks.contains_key(hash) {
            return Ok(());
        }

        let (hash, sign, _data_bytes) = match verify_envelope(doc) {
            Ok(parts) => parts,
            Err(_) => {
                self.net.punish(peer);
                return Ok(());
            }
        };

        let Some(declared_pow) = parse_pow_words(doc.get("pow")) else {
            self.net.punish(peer);
            return Ok(());
        };

        if declared_pow <= self.most_difficult_block().accum_pow {
            return Ok(());
        }

        let header = match BlockData::parse(doc.get("data").expect("envelope verified")) {
            Ok(header) => header,
            Err(_) => {
                self.net.punish(peer);
                return Ok(());
            }
        };

        if !verify_sign_b64(&header.miner, &hash, &sign).unwrap_or(false) {
            self.net.punish(peer);
            return Ok(());
        }

        if !verify_block_pow(&hash, header.zero_bits) {
            self.net.punish(peer);
            return Ok(());
        }

        let mut remain_pow = declared_pow;
        if !remain_pow.sub_pow(header.zero_bits) {
            // claimed less total work than the block's own contribution
            self.net.punish(peer);
            return Ok(());
        }

        let (pending, is_new) = match self.sync.pending_blocks.get(&hash).cloned() {
            Some(existing) => (existing, false),
            None => (self.sync.insert_pending_block(header.to_pending(&hash)), true),
        };

        if is_new {
            // a brief request for this hash is now moot
            if let Some(request) = self.sync.brief_reqs.remove(&hash) {
                self.timers.cancel(request.timer_id);
            }
        }

        let chain_id = self
            .sync
            .add_chain(peer.clone(), pending, declared_pow, remain_pow);
        self.sync.pending_peer_keys.insert(peer.key().to_string());

        if header.utc > now {
            let diff = header.utc - now;
            if diff > 3600 {
                warn!(%hash, diff, peer = peer.key(), "block timestamp far in the future");
            }
            self.timers
                .add(TimerEvent::EnqueueChain { chain_id }, diff, true, now);
        } else {
            self.sync.pending_brief_chains.push(chain_id);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Serving BRIEF / DETAIL requests
    // ------------------------------------------------------------------

    fn on_block_req(
        &mut self,
        peer: &PeerHandle,
        doc: &Value,
        with_tx: bool,
    ) -> Result<(), ChainError> {
        let Some(hash) = doc.get("hash").and_then(Value::as_str) else {
            self.net.punish(peer);
            return Ok(());
        };

        if hash.len() != HASH_B64_LEN {
            self.net.punish(peer);
            return Ok(());
        }

        let Some(block) = self.blocks.get(hash) else {
            return Ok(());
        };

        // the stored document is integrity-checked against its key by the
        // store; a missing or unverifiable block here is disk corruption
        let stored = self
            .store
            .get_block(hash)?
            .ok_or_else(|| integrity(format!("live block {hash} missing from store")))?;

        if block.id != 0 {
            let sign = doc_str(&stored, "sign")?;
            let miner = stored
                .get("data")
                .and_then(|d| d.get("miner"))
                .and_then(Value::as_str)
                .ok_or_else(|| integrity(format!("stored block {hash} lacks miner")))?;

            if !verify_sign_b64(miner, hash, sign).unwrap_or(false) {
                return Err(integrity(format!("stored block {hash} signature invalid")));
            }
        }

        let mut rsp = envelope(
            MSG_BLOCK,
            if with_tx { BLOCK_DETAIL_RSP } else { BLOCK_BRIEF_RSP },
        );
        rsp.insert("hash".into(), stored["hash"].clone());
        rsp.insert("sign".into(), stored["sign"].clone());
        rsp.insert("data".into(), stored["data"].clone());
        if with_tx {
            // always the stored block's transaction list
            rsp.insert("tx".into(), stored.get("tx").cloned().unwrap_or(json!([])));
        }
        peer.send(Value::Object(rsp));

        Ok(())
    }

    // ------------------------------------------------------------------
    // BLOCK_BRIEF_RSP
    // ------------------------------------------------------------------

    fn on_brief_rsp(&mut self, peer: &PeerHandle, doc: &Value) -> Result<(), ChainError> {
        let (Some(hash), Some(sign)) = (
            doc.get("hash").and_then(Value::as_str),
            doc.get("sign").and_then(Value::as_str),
        ) else {
            self.net.punish(peer);
            return Ok(());
        };

        if hash.len() != HASH_B64_LEN || !is_base64_string(hash) || !is_base64_string(sign) {
            self.net.punish(peer);
            return Ok(());
        }

        if self.blocks.contains_key(hash) || self.sync.pending_blocks.contains_key(hash) {
            return Ok(());
        }

        if !self.sync.brief_reqs.contains_key(hash) {
            return Ok(());
        }

        let (hash, _sign, _bytes) = match verify_envelope(doc) {
            Ok(parts) => parts,
            Err(_) => {
                self.net.punish(peer);
                return Ok(());
            }
        };

        let header = match BlockData::parse(doc.get("data").expect("envelope verified")) {
            Ok(header) => header,
            Err(_) => {
                self.fail_brief(&hash);
                return Ok(());
            }
        };

        if !verify_sign_b64(&header.miner, &hash, sign).unwrap_or(false) {
            self.net.punish(peer);
            return Ok(());
        }

        if !verify_block_pow(&hash, header.zero_bits) {
            self.fail_brief(&hash);
            return Ok(());
        }

        self.sync.insert_pending_block(header.to_pending(&hash));

        if let Some(request) = self.sync.brief_reqs.remove(&hash) {
            self.timers.cancel(request.timer_id);
        }
        debug!(%hash, id = header.id, "brief block received");

        Ok(())
    }

    // ------------------------------------------------------------------
    // BLOCK_DETAIL_RSP
    // ------------------------------------------------------------------

    fn on_detail_rsp(
        &mut self,
        peer: &PeerHandle,
        doc: &Value,
        now: u64,
    ) -> Result<(), ChainError> {
        let (Some(hash), Some(sign)) = (
            doc.get("hash").and_then(Value::as_str),
            doc.get("sign").and_then(Value::as_str),
        ) else {
            self.net.punish(peer);
            return Ok(());
        };

        if hash.len() != HASH_B64_LEN || !is_base64_string(hash) || !is_base64_string(sign) {
            self.net.punish(peer);
            return Ok(());
        }

        if self.blocks.contains_key(hash) || !self.sync.is_switching {
            return Ok(());
        }

        let Some(tx_array) = doc.get("tx").and_then(Value::as_array) else {
            self.net.punish(peer);
            return Ok(());
        };

        let (hash, sign, _bytes) = match verify_envelope(doc) {
            Ok(parts) => parts,
            Err(_) => {
                self.net.punish(peer);
                return Ok(());
            }
        };

        // only the block the cursor is waiting for is acceptable
        let expected = {
            let Some(request) = &self.sync.detail else {
                return Ok(());
            };
            let owner = self
                .sync
                .chain(request.owner)
                .ok_or_else(|| integrity("detail request without owner chain".into()))?;
            owner.blocks[owner.start].hash.clone()
        };

        if hash != expected {
            return Ok(());
        }

        let header = match BlockData::parse(doc.get("data").expect("envelope verified")) {
            Ok(header) => header,
            Err(_) => return self.fail_detail(),
        };

        if !version_compatible(header.version, ASKCOIN_VERSION) {
            debug!(version = header.version, "detail block from incompatible version");
            return self.fail_detail();
        }

        if self.state.account_by_pubkey(&header.miner).is_none() {
            return self.fail_detail();
        }

        let Some(parent) = self.blocks.get(&header.pre_hash) else {
            return self.fail_detail();
        };
        let parent = parent.clone();

        if header.id != parent.id + 1 {
            return self.fail_detail();
        }

        if header.zero_bits != expected_zero_bits(parent.zero_bits, parent.utc_diff) {
            return self.fail_detail();
        }

        if header.utc < parent.utc {
            return self.fail_detail();
        }

        if header.utc > now {
            warn!(%hash, utc = header.utc, "detail block timestamped in the future; check the system clock");
            return Ok(());
        }

        if !verify_sign_b64(&header.miner, &hash, &sign).unwrap_or(false) {
            self.net.punish(peer);
            return Ok(());
        }

        if !verify_block_pow(&hash, header.zero_bits) {
            error!(%hash, zero_bits = header.zero_bits, "detail block fails proof of work");
            return self.fail_detail();
        }

        // per-transaction structural and signature validation
        if header.tx_ids.len() != tx_array.len() {
            return self.fail_detail();
        }

        let mut txs = Vec::with_capacity(tx_array.len());
        for (tx_id, tx_doc) in header.tx_ids.iter().zip(tx_array) {
            if self.state.knows_tx(tx_id) {
                return self.fail_detail();
            }

            let tx = match TxEnvelope::parse(tx_doc) {
                Ok(tx) => tx,
                Err(_) => return self.fail_detail(),
            };

            if &tx.id != tx_id || !tx.verify_sig() {
                return self.fail_detail();
            }

            txs.push(tx);
        }

        let mut accum_pow = parent.accum_pow;
        accum_pow
            .add_pow(header.zero_bits)
            .map_err(|_| integrity("accumulated pow overflow".into()))?;

        let block = Block {
            id: header.id,
            utc: header.utc,
            version: header.version,
            zero_bits: header.zero_bits,
            hash: hash.clone(),
            pre_hash: header.pre_hash.clone(),
            miner_pubkey: header.miner.clone(),
            accum_pow,
            utc_diff: header.utc - parent.utc,
            subsidy_paid: false,
        };

        let stored_doc = json!({
            "hash": doc["hash"],
            "sign": doc["sign"],
            "data": doc["data"],
            "tx": doc["tx"],
        });

        if self.commit_block(block, &txs, stored_doc)?.is_err() {
            return self.fail_detail();
        }

        info!(%hash, id = header.id, peer = peer.key(), "block applied");
        self.net.credit(peer.key(), BLOCK_SUPPLIER_CREDIT);
        self.advance_detail(&hash, peer)
    }

    /// Apply, persist and index one new block. `Ok(Err(_))` is a logical
    /// rejection (a transaction failed and the block was rolled back).
    fn commit_block(
        &mut self,
        block: Block,
        txs: &[TxEnvelope],
        stored_doc: Value,
    ) -> Result<Result<(), ()>, ChainError> {
        let undo = match self
            .state
            .apply_block(&block.hash, block.id, &block.miner_pubkey, txs)
        {
            Ok(undo) => undo,
            Err(failure) => {
                debug!(
                    hash = %block.hash,
                    index = failure.index,
                    error = %failure.error,
                    "block rejected during application"
                );
                return Ok(Err(()));
            }
        };

        self.store.append_block(&stored_doc, &block.pre_hash)?;

        let mut block = block;
        block.subsidy_paid = undo.subsidy_paid;
        let included: Vec<String> = undo.txs.iter().map(|t| t.tx_id.clone()).collect();

        self.tip = block.hash.clone();
        if block.accum_pow > self.blocks[&self.most_difficult].accum_pow {
            self.most_difficult = block.hash.clone();
        }
        self.undo_log.insert(block.hash.clone(), undo);
        let tip_id = block.id;
        self.blocks.insert(block.hash.clone(), block);

        let announce = self
            .mempool
            .on_block_committed(&included, tip_id, &mut self.state);
        for tx in announce {
            self.broadcast_tx(&tx);
        }

        Ok(Ok(()))
    }

    /// After a successful detail application: advance every attached
    /// chain's cursor and either finish the switch or request the next
    /// divergent block.
    fn advance_detail(&mut self, applied_hash: &str, peer: &PeerHandle) -> Result<(), ChainError> {
        let Some(request) = &self.sync.detail else {
            return Ok(());
        };
        let owner_id = request.owner;
        let attached = request.attached.clone();

        for chain_id in &attached {
            if let Some(chain) = self.sync.chain_mut(*chain_id) {
                if chain.start < chain.blocks.len() && chain.blocks[chain.start].hash == applied_hash
                {
                    chain.start += 1;
                }
                if chain.start >= chain.blocks.len() {
                    chain.detail_attached = false;
                }
            }
        }

        let owner_done = self
            .sync
            .chain(owner_id)
            .map_or(true, |c| c.start >= c.blocks.len());

        if owner_done {
            return self.finish_switch();
        }

        // keep only chains that still cover the fetch
        let keep: Vec<u64> = attached
            .iter()
            .copied()
            .filter(|id| self.sync.chain(*id).is_some_and(|c| c.detail_attached))
            .collect();
        let next_hash = {
            let owner = self.sync.chain(owner_id).expect("owner not done");
            owner.blocks[owner.start].hash.clone()
        };

        if let Some(request) = &mut self.sync.detail {
            request.attached = keep;
            request.try_num = 1;
        }

        peer.send(block_req_doc(BLOCK_DETAIL_REQ, &next_hash));
        Ok(())
    }

    /// The adopted chain is fully applied: release the request, drop the
    /// chains that rode along, and announce the new tip.
    fn finish_switch(&mut self) -> Result<(), ChainError> {
        if let Some(request) = self.sync.detail.take() {
            self.timers.cancel(request.timer_id);
            for chain_id in request.attached {
                self.sync.brief_chains.retain(|c| *c != chain_id);
                self.sync.drop_chain(chain_id);
            }
        }

        self.sync.is_switching = false;
        self.mempool.rebuild(&mut self.state);

        let tip = self.most_difficult.clone();
        info!(tip = %tip, id = self.blocks[&tip].id, "switched to new chain");
        self.broadcast_block(&tip)
    }

    /// Fail the in-flight detail request: punish every chain that backed
    /// it and restore the heaviest fully-applied branch.
    fn fail_detail(&mut self) -> Result<(), ChainError> {
        let Some(request) = self.sync.detail.take() else {
            return Ok(());
        };
        self.timers.cancel(request.timer_id);

        for chain_id in request.attached {
            self.sync.brief_chains.retain(|c| *c != chain_id);
            if let Some(chain) = self.sync.drop_chain(chain_id) {
                debug!(peer = chain.peer.key(), "punishing chain behind failed detail request");
                self.net.punish(&chain.peer);
            }
        }

        self.sync.is_switching = false;

        let target = self.most_difficult.clone();
        self.reorg_to(&target)?;
        self.mempool.rebuild(&mut self.state);

        Ok(())
    }

    // ------------------------------------------------------------------
    // TX_BROADCAST
    // ------------------------------------------------------------------

    fn on_tx_broadcast(&mut self, peer: &PeerHandle, doc: &Value) {
        let (Some(sign), Some(data)) = (doc.get("sign"), doc.get("data")) else {
            self.net.punish(peer);
            return;
        };

        let tx_doc = json!({"sign": sign, "data": data});
        let tx = match TxEnvelope::parse(&tx_doc) {
            Ok(tx) => tx,
            Err(err) => {
                debug!(peer = peer.key(), %err, "malformed transaction broadcast");
                self.net.punish(peer);
                return;
            }
        };

        if !tx.verify_sig() {
            self.net.punish(peer);
            return;
        }

        if self.state.knows_tx(&tx.id) || self.mempool.contains(&tx.id) {
            return;
        }

        let tip_id = self.tip_block().id;
        if tx.block_id + TX_ID_WINDOW < tip_id || tx.block_id > tip_id + TX_ID_WINDOW {
            debug!(tx_id = %tx.id, "transaction anchored outside the admission window");
            return;
        }

        let announce = tx.clone();
        match self.mempool.submit(tx, &mut self.state) {
            SubmitOutcome::Admitted => self.broadcast_tx(&announce),
            SubmitOutcome::Queued => {
                debug!(tx_id = %announce.id, "transaction queued awaiting dependencies");
            }
            SubmitOutcome::Duplicate | SubmitOutcome::Rejected => {}
        }
    }

    // ------------------------------------------------------------------
    // The brief-chain walk and reorg decision
    // ------------------------------------------------------------------

    fn do_brief_chain(&mut self, now: u64) -> Result<(), ChainError> {
        let mut i = 0;

        'chains: while i < self.sync.pending_brief_chains.len() {
            let chain_id = self.sync.pending_brief_chains[i];

            let Some(chain) = self.sync.chain(chain_id) else {
                self.sync.pending_brief_chains.remove(i);
                continue;
            };

            if chain.declared_pow <= self.most_difficult_block().accum_pow {
                self.sync.pending_brief_chains.remove(i);
                self.sync.drop_chain(chain_id);
                continue;
            }

            loop {
                let chain = self.sync.chain(chain_id).expect("chain is live");
                let front = chain.blocks.front().expect("chains are never empty").clone();

                if let Some(pre_block) = self.blocks.get(&front.pre_hash) {
                    // anchored to a known block
                    let anchor_id = pre_block.id;
                    let anchor_pow = pre_block.accum_pow;
                    self.sync.pending_brief_chains.remove(i);

                    let chain = self.sync.chain(chain_id).expect("chain is live");
                    if front.id != anchor_id + 1 || chain.remain_pow != anchor_pow {
                        let peer = chain.peer.clone();
                        self.sync.drop_chain(chain_id);
                        self.net.punish(&peer);
                    } else {
                        self.sync.brief_chains.push(chain_id);
                        self.try_attach_to_detail(chain_id);
                    }
                    continue 'chains;
                }

                if front.id <= 1 {
                    // pre-genesis parent that is not genesis: fabricated
                    let peer = self.sync.chain(chain_id).expect("chain is live").peer.clone();
                    self.sync.pending_brief_chains.remove(i);
                    self.sync.drop_chain(chain_id);
                    self.net.punish(&peer);
                    continue 'chains;
                }

                if let Some(pre_pending) = self.sync.pending_blocks.get(&front.pre_hash).cloned() {
                    let chain = self.sync.chain_mut(chain_id).expect("chain is live");

                    if front.id != pre_pending.id + 1
                        || !chain.remain_pow.sub_pow(pre_pending.zero_bits)
                    {
                        let peer = chain.peer.clone();
                        self.sync.pending_brief_chains.remove(i);
                        self.sync.drop_chain(chain_id);
                        self.net.punish(&peer);
                        continue 'chains;
                    }

                    chain.blocks.push_front(pre_pending);
                    chain.brief_attached = false;
                    // keep walking backward
                } else {
                    self.request_brief(chain_id, &front.pre_hash, front.id - 1, now);
                    i += 1;
                    continue 'chains;
                }
            }
        }

        if self.sync.is_switching {
            return Ok(());
        }

        // sweep anchored chains, pick the heaviest remaining claim
        let local_pow = self.most_difficult_block().accum_pow;
        let mut best: Option<(AccumPow, u64)> = None;
        let mut j = 0;

        while j < self.sync.brief_chains.len() {
            let chain_id = self.sync.brief_chains[j];

            let Some(chain) = self.sync.chain(chain_id) else {
                self.sync.brief_chains.remove(j);
                continue;
            };

            if chain.declared_pow <= local_pow {
                self.sync.brief_chains.remove(j);
                self.sync.drop_chain(chain_id);
                continue;
            }

            if best.map_or(true, |(pow, _)| chain.declared_pow > pow) {
                best = Some((chain.declared_pow, chain_id));
            }
            j += 1;
        }

        if let Some((_, chain_id)) = best {
            self.switch_chain(chain_id, now)?;
        }

        Ok(())
    }

    fn request_brief(&mut self, chain_id: u64, pre_hash: &str, pre_id: u64, now: u64) {
        if self.sync.brief_reqs.contains_key(pre_hash) {
            let chain = self.sync.chain_mut(chain_id).expect("chain is live");
            let already_attached = chain.brief_attached;
            if !already_attached {
                chain.brief_attached = true;
            }
            if !already_attached {
                let request = self.sync.brief_reqs.get_mut(pre_hash).expect("checked above");
                request.attached.push(chain_id);
            }
            return;
        }

        let chain = self.sync.chain_mut(chain_id).expect("chain is live");
        chain.brief_attached = true;
        let peer = chain.peer.clone();

        let timer_id = self.timers.add(
            TimerEvent::BriefRetry {
                hash: pre_hash.to_string(),
            },
            1,
            false,
            now,
        );
        self.sync.brief_reqs.insert(
            pre_hash.to_string(),
            BriefRequest {
                hash: pre_hash.to_string(),
                attached: vec![chain_id],
                try_num: 1,
                timer_id,
            },
        );

        debug!(id = pre_id, hash = %pre_hash, "requesting brief block");
        peer.send(block_req_doc(BLOCK_BRIEF_REQ, pre_hash));
    }

    /// While switching, a freshly anchored chain that covers the block the
    /// detail fetch is waiting for becomes a failover source.
    fn try_attach_to_detail(&mut self, chain_id: u64) {
        if !self.sync.is_switching {
            return;
        }

        let Some(request) = &self.sync.detail else {
            return;
        };

        let Some(owner) = self.sync.chain(request.owner) else {
            return;
        };
        let wanted = owner.blocks[owner.start].clone();

        let Some(chain) = self.sync.chain(chain_id) else {
            return;
        };
        let start_id = chain.blocks.front().expect("never empty").id;
        let end_id = chain.blocks.back().expect("never empty").id;

        if wanted.id < start_id || wanted.id > end_id {
            return;
        }

        let idx = (wanted.id - start_id) as usize;
        if chain.blocks[idx].hash != wanted.hash {
            return;
        }

        let chain = self.sync.chain_mut(chain_id).expect("chain is live");
        chain.start = idx;
        chain.detail_attached = true;
        if let Some(request) = &mut self.sync.detail {
            request.attached.push(chain_id);
        }
    }

    /// Adopt the chosen chain: roll back to the divergence point and start
    /// fetching full blocks.
    fn switch_chain(&mut self, chain_id: u64, now: u64) -> Result<(), ChainError> {
        // skip blocks already held from earlier switches
        loop {
            let next_known = {
                let chain = self.sync.chain(chain_id).expect("chosen chain is live");
                if chain.start >= chain.blocks.len() {
                    None
                } else {
                    Some(self.blocks.contains_key(&chain.blocks[chain.start].hash))
                }
            };

            match next_known {
                None => {
                    // everything it offered is already known
                    self.sync.brief_chains.retain(|c| *c != chain_id);
                    self.sync.drop_chain(chain_id);
                    return Ok(());
                }
                Some(true) => {
                    self.sync.chain_mut(chain_id).expect("chosen chain is live").start += 1;
                }
                Some(false) => break,
            }
        }

        let (first_hash, ancestor, peer) = {
            let chain = self.sync.chain(chain_id).expect("chosen chain is live");
            let first = &chain.blocks[chain.start];
            (first.hash.clone(), first.pre_hash.clone(), chain.peer.clone())
        };

        debug!(chain_id, first = %first_hash, "switching to more difficult chain");
        self.sync.is_switching = true;
        {
            let chain = self.sync.chain_mut(chain_id).expect("chosen chain is live");
            chain.detail_attached = true;
        }
        let timer_id = self.timers.add(TimerEvent::DetailRetry, 1, false, now);
        self.sync.detail = Some(DetailRequest {
            owner: chain_id,
            attached: vec![chain_id],
            try_num: 1,
            timer_id,
        });

        // virtual rollback to the divergence point; the anchor can sit on
        // a side branch, so this may roll back and replay forward
        self.reorg_to(&ancestor)?;

        peer.send(block_req_doc(BLOCK_DETAIL_REQ, &first_hash));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retry timers
    // ------------------------------------------------------------------

    fn on_brief_retry(&mut self, hash: &str) {
        let Some(request) = self.sync.brief_reqs.get(hash) else {
            return;
        };

        if request.try_num >= request.attached.len() as u32 * 2 {
            self.fail_brief(hash);
            return;
        }

        // drop chains whose peers are gone, then reshuffle the rest
        let mut attached = request.attached.clone();
        attached.retain(|id| {
            self.sync
                .chain(*id)
                .is_some_and(|c| !c.peer.is_closed())
        });

        if attached.is_empty() {
            self.fail_brief(hash);
            return;
        }

        attached.shuffle(&mut rand::thread_rng());
        let peer = self
            .sync
            .chain(*attached.last().expect("non-empty"))
            .expect("retained chains are live")
            .peer
            .clone();

        let request = self.sync.brief_reqs.get_mut(hash).expect("checked above");
        request.attached = attached;
        request.try_num += 1;

        debug!(%hash, "retrying brief request with another peer");
        peer.send(block_req_doc(BLOCK_BRIEF_REQ, hash));
    }

    fn on_detail_retry(&mut self) -> Result<(), ChainError> {
        let Some(request) = &self.sync.detail else {
            return Ok(());
        };

        if request.try_num >= request.attached.len() as u32 * 2 {
            return self.fail_detail();
        }

        let Some(owner) = self.sync.chain(request.owner) else {
            return self.fail_detail();
        };
        let wanted = owner.blocks[owner.start].hash.clone();

        // drop chains whose peers are gone, then reshuffle the rest
        let mut attached = request.attached.clone();
        attached.retain(|id| {
            self.sync
                .chain(*id)
                .is_some_and(|c| !c.peer.is_closed())
        });

        if attached.is_empty() {
            return self.fail_detail();
        }

        attached.shuffle(&mut rand::thread_rng());
        let peer = self
            .sync
            .chain(*attached.last().expect("non-empty"))
            .expect("retained chains are live")
            .peer
            .clone();

        if let Some(request) = &mut self.sync.detail {
            request.attached = attached;
            request.try_num += 1;
        }

        debug!(hash = %wanted, "retrying detail request with another peer");
        peer.send(block_req_doc(BLOCK_DETAIL_REQ, &wanted));
        Ok(())
    }

    /// Fail a brief request: punish every chain that depended on it.
    fn fail_brief(&mut self, hash: &str) {
        let Some(request) = self.sync.brief_reqs.remove(hash) else {
            return;
        };
        self.timers.cancel(request.timer_id);

        for chain_id in request.attached {
            let attached = self
                .sync
                .chain(chain_id)
                .is_some_and(|c| c.brief_attached);

            if attached {
                self.sync.pending_brief_chains.retain(|c| *c != chain_id);
                if let Some(chain) = self.sync.drop_chain(chain_id) {
                    warn!(peer = chain.peer.key(), %hash, "punishing peer behind failed brief request");
                    self.net.punish(&chain.peer);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reorganization plumbing
    // ------------------------------------------------------------------

    /// Roll the applied state back until `ancestor` is the tip. Reverted
    /// transactions are offered back to the mempool.
    fn rollback_to(&mut self, ancestor: &str) -> Result<(), ChainError> {
        let mut rolled = Vec::new();

        while self.tip != ancestor {
            let undo = self
                .undo_log
                .remove(&self.tip)
                .ok_or_else(|| integrity(format!("no undo record for {}", self.tip)))?;
            let txs = self.txs_of_stored_block(&self.tip)?;

            debug!(hash = %self.tip, "rolling back block");
            self.state.rollback_block(&undo);
            rolled.extend(txs);

            self.tip = self
                .blocks
                .get(&self.tip)
                .ok_or_else(|| integrity(format!("tip {} not in memory", self.tip)))?
                .pre_hash
                .clone();

            if !self.blocks.contains_key(&self.tip) {
                return Err(integrity("rollback walked past genesis".into()));
            }
        }

        self.mempool.on_block_rolled_back(rolled, &mut self.state);
        Ok(())
    }

    /// Move the applied state from the current tip to `target`, both of
    /// which must be in memory. Replayed blocks come from storage and must
    /// apply cleanly; they were valid when first committed.
    fn reorg_to(&mut self, target: &str) -> Result<(), ChainError> {
        if self.tip == target {
            return Ok(());
        }

        // common ancestor by walking the higher side down
        let mut a = self.tip.clone();
        let mut b = target.to_string();

        while a != b {
            let (ia, ib) = (
                self.blocks
                    .get(&a)
                    .ok_or_else(|| integrity(format!("unknown block {a}")))?
                    .id,
                self.blocks
                    .get(&b)
                    .ok_or_else(|| integrity(format!("unknown block {b}")))?
                    .id,
            );

            if ia >= ib {
                a = self.blocks[&a].pre_hash.clone();
            } else {
                b = self.blocks[&b].pre_hash.clone();
            }
        }

        self.rollback_to(&a)?;
        self.replay_to(target)
    }

    /// Apply the stored branch from the current tip (an ancestor of
    /// `target`) forward to `target`.
    fn replay_to(&mut self, target: &str) -> Result<(), ChainError> {
        let mut path = Vec::new();
        let mut cursor = target.to_string();

        while cursor != self.tip {
            path.push(cursor.clone());
            cursor = self
                .blocks
                .get(&cursor)
                .ok_or_else(|| integrity(format!("unknown block {cursor}")))?
                .pre_hash
                .clone();
        }

        for hash in path.iter().rev() {
            let txs = self.txs_of_stored_block(hash)?;
            let block = self.blocks[hash].clone();

            let undo = self
                .state
                .apply_block(hash, block.id, &block.miner_pubkey, &txs)
                .map_err(|failure| {
                    integrity(format!(
                        "stored block {hash} no longer applies (tx {} failed: {})",
                        failure.index, failure.error
                    ))
                })?;

            self.blocks.get_mut(hash).expect("cloned above").subsidy_paid = undo.subsidy_paid;
            self.undo_log.insert(hash.clone(), undo);
            self.tip = hash.clone();
        }

        Ok(())
    }

    fn txs_of_stored_block(&self, hash: &str) -> Result<Vec<TxEnvelope>, ChainError> {
        let doc = self
            .store
            .get_block(hash)?
            .ok_or_else(|| integrity(format!("live block {hash} missing from store")))?;

        let Some(tx_array) = doc.get("tx").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };

        tx_array
            .iter()
            .map(|tx_doc| {
                TxEnvelope::parse(tx_doc)
                    .map_err(|e| integrity(format!("stored tx in {hash} unparseable: {e}")))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Announce a committed block with its accumulated-pow vector so peers
    /// can gate on work before fetching anything.
    fn broadcast_block(&self, hash: &str) -> Result<(), ChainError> {
        let stored = self
            .store
            .get_block(hash)?
            .ok_or_else(|| integrity(format!("live block {hash} missing from store")))?;
        let pow = self.blocks[hash].accum_pow.words();

        let mut doc = envelope(MSG_BLOCK, BLOCK_BROADCAST);
        doc.insert("hash".into(), stored["hash"].clone());
        doc.insert("sign".into(), stored["sign"].clone());
        doc.insert("pow".into(), json!(pow));
        doc.insert("data".into(), stored["data"].clone());

        self.net.broadcast(&Value::Object(doc));
        Ok(())
    }

    fn broadcast_tx(&self, tx: &TxEnvelope) {
        let mut doc = envelope(MSG_TX, TX_BROADCAST);
        doc.insert("sign".into(), tx.doc["sign"].clone());
        doc.insert("data".into(), tx.doc["data"].clone());
        self.net.broadcast(&Value::Object(doc));
    }
}

fn block_req_doc(cmd: u32, hash: &str) -> Value {
    let mut doc = envelope(MSG_BLOCK, cmd);
    doc.insert("hash".into(), json!(hash));
    Value::Object(doc)
}

fn parse_pow_words(value: Option<&Value>) -> Option<AccumPow> {
    let array = value?.as_array()?;

    if array.len() != 9 {
        return None;
    }

    let mut words = [0u32; 9];
    for (slot, word) in words.iter_mut().zip(array) {
        let w = word.as_u64()?;
        if w > u32::MAX as u64 {
            return None;
        }
        *slot = w as u32;
    }

    Some(AccumPow::from_words(words))
}

fn build_block(doc: &Value, parent: Option<&Block>) -> Result<Block, ChainError> {
    let hash = doc_str(doc, "hash")?.to_string();
    let data = doc
        .get("data")
        .ok_or_else(|| integrity(format!("stored block {hash} lacks data")))?;

    let field = |name: &str| {
        data.get(name)
            .and_then(Value::as_u64)
            .ok_or_else(|| integrity(format!("stored block {hash} lacks {name}")))
    };

    let id = field("id")?;
    let utc = field("utc")?;
    let version = field("version")? as u32;
    let zero_bits = field("zero_bits")? as u32;
    let pre_hash = data
        .get("pre_hash")
        .and_then(Value::as_str)
        .ok_or_else(|| integrity(format!("stored block {hash} lacks pre_hash")))?
        .to_string();
    let miner_pubkey = data
        .get("miner")
        .and_then(Value::as_str)
        .ok_or_else(|| integrity(format!("stored block {hash} lacks miner")))?
        .to_string();

    let (accum_pow, utc_diff) = match parent {
        None => {
            let mut pow = AccumPow::zero();
            pow.add_pow(zero_bits)
                .map_err(|_| integrity("accumulated pow overflow at genesis".into()))?;
            // genesis has no parent gap; treated as in-band
            (pow, 20)
        }
        Some(parent) => {
            if id != parent.id + 1 {
                return Err(integrity(format!(
                    "stored block {hash} id {id} does not follow parent {}",
                    parent.id
                )));
            }

            let mut pow = parent.accum_pow;
            pow.add_pow(zero_bits)
                .map_err(|_| integrity("accumulated pow overflow".into()))?;
            (pow, utc.saturating_sub(parent.utc))
        }
    };

    Ok(Block {
        id,
        utc,
        version,
        zero_bits,
        hash,
        pre_hash,
        miner_pubkey,
        accum_pow,
        utc_diff,
        subsidy_paid: false,
    })
}

fn doc_str<'a>(doc: &'a Value, field: &str) -> Result<&'a str, ChainError> {
    doc.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| integrity(format!("stored document lacks {field}")))
}

fn integrity(msg: String) -> ChainError {
    ChainError::Integrity(msg)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
