//! The in-memory world state and the transaction application engine.
//!
//! Entities live in arenas and reference each other by integer id or topic
//! key, never by owning pointer, so a rollback is the literal inverse of
//! each forward mutation. Every applier returns an undo record; reverting a
//! block replays those records backwards and must restore the state
//! byte-for-byte.
//!
//! Balance discipline: block application checks *actual* balances. The
//! `uv_*` reservation counters belong to the mempool and only constrain
//! admission, never a block carried by the network.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::account::{
    valid_account_name, Account, MAX_JOINED_TOPICS, MAX_OWNED_TOPICS, RESERVE_FUND_ACCOUNT_ID,
    ROOT_ACCOUNT_ID,
};
use crate::topic::{Reply, ReplyKind, Topic, MAX_REPLIES_PER_TOPIC};
use crate::tx::{TxBody, TxEnvelope, TX_FEE, TX_ID_WINDOW};

/// Fixed coin supply; nothing is ever minted after genesis.
pub const TOTAL_SUPPLY: u64 = 1_000_000_000;

/// The root account's genesis balance; the reserve fund holds the rest.
pub const GENESIS_ROOT_BALANCE: u64 = 1_000_000;

/// Paid to the miner out of the reserve fund when it can afford it.
pub const BLOCK_SUBSIDY: u64 = 5_000;

/// How many blocks of transaction ids are kept for replay detection. Equal
/// to the `block_id` admission window so an in-window replay always hits.
pub const TX_MAP_BLOCKS: usize = 100;

/// Name of the reserve fund account.
pub const RESERVE_FUND_NAME: &str = "Askcoin";

/// Name of the genesis root account.
pub const ROOT_NAME: &str = "Root";

/// Why a transaction was refused at application time. These are logical
/// rejections: the block carrying the transaction is refused, nothing is
/// banned for them by this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxApplyError {
    #[error("transaction id already appeared in a recent block")]
    Replayed,
    #[error("transaction block_id outside the admission window")]
    StaleBlockId,
    #[error("author account unknown")]
    UnknownAuthor,
    #[error("referrer account unknown")]
    UnknownReferrer,
    #[error("receiver account unknown")]
    UnknownReceiver,
    #[error("account name already in use")]
    NameTaken,
    #[error("public key already registered")]
    PubkeyTaken,
    #[error("invalid account name")]
    BadName,
    #[error("referrer signature over sign_data does not verify")]
    BadInnerSignature,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("topic unknown")]
    UnknownTopic,
    #[error("reply unknown")]
    UnknownReply,
    #[error("open-topic limit reached")]
    TopicLimit,
    #[error("reply limit reached")]
    ReplyLimit,
    #[error("joined-topic limit reached")]
    JoinLimit,
    #[error("only the topic owner may reward")]
    NotTopicOwner,
    #[error("cannot reward a reward marker")]
    RewardMarkerTarget,
    #[error("insufficient topic balance")]
    InsufficientTopicBalance,
}

/// Inverse data for one applied transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxUndo {
    Register {
        account_id: u64,
        payer: u64,
        beneficiary: u64,
        miner: u64,
    },
    Send {
        author: u64,
        receiver: u64,
        amount: u64,
        beneficiary: u64,
        miner: u64,
    },
    NewTopic {
        author: u64,
        topic_key: String,
        reward: u64,
        beneficiary: u64,
        miner: u64,
    },
    Reply {
        author: u64,
        topic_key: String,
        reply_key: String,
        joined: bool,
        beneficiary: u64,
        miner: u64,
    },
    Reward {
        author: u64,
        topic_key: String,
        marker_key: String,
        reply_to: String,
        reply_owner: u64,
        amount: u64,
        beneficiary: u64,
        miner: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedTx {
    pub tx_id: String,
    pub undo: TxUndo,
}

/// A topic removed by expiry, with what is needed to resurrect it exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredTopic {
    pub topic: Topic,
    /// Position the key held in the owner's `owned_topics`.
    pub owner_pos: usize,
}

/// Everything needed to revert one committed block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockUndo {
    pub hash: String,
    pub block_id: u64,
    pub miner: u64,
    pub txs: Vec<AppliedTx>,
    pub subsidy_paid: bool,
    pub expired: Vec<ExpiredTopic>,
    /// `tx_map` window entries pruned when this block entered the window:
    /// (block id, block hash, tx ids).
    pub pruned: Vec<(u64, String, Vec<String>)>,
}

/// A transaction failed at position `index`; everything before it has been
/// rolled back already.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockApplyFailure {
    pub index: usize,
    pub error: TxApplyError,
}

/// Accounts, topics, replies and the replay window. See the module docs.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldState {
    accounts: HashMap<u64, Account>,
    by_pubkey: HashMap<String, u64>,
    by_name: HashMap<String, u64>,
    /// (balance descending, id) — the rich list.
    rich: BTreeSet<(Reverse<u64>, u64)>,
    topics: HashMap<String, Topic>,
    /// Topic keys in creation order; expiry pops from the front.
    topic_list: VecDeque<String>,
    next_account_id: u64,
    /// tx id → hash of the block that carried it, recent blocks only.
    tx_map: HashMap<String, String>,
    /// (block id, block hash, its tx ids), oldest first.
    tx_window: VecDeque<(u64, String, Vec<String>)>,
}

impl WorldState {
    /// The state right after genesis: the reserve fund (id 0) and the root
    /// account (id 1) split the fixed supply.
    pub fn genesis(root_pubkey: &str) -> Self {
        let mut state = Self {
            accounts: HashMap::new(),
            by_pubkey: HashMap::new(),
            by_name: HashMap::new(),
            rich: BTreeSet::new(),
            topics: HashMap::new(),
            topic_list: VecDeque::new(),
            next_account_id: 2,
            tx_map: HashMap::new(),
            tx_window: VecDeque::new(),
        };

        let mut reserve = Account::new(
            RESERVE_FUND_ACCOUNT_ID,
            RESERVE_FUND_NAME.to_string(),
            String::new(),
            1,
            None,
        );
        reserve.balance = TOTAL_SUPPLY - GENESIS_ROOT_BALANCE;

        let mut root = Account::new(
            ROOT_ACCOUNT_ID,
            ROOT_NAME.to_string(),
            root_pubkey.to_string(),
            1,
            None,
        );
        root.balance = GENESIS_ROOT_BALANCE;

        state.by_name.insert(reserve.name.clone(), reserve.id);
        state.by_name.insert(root.name.clone(), root.id);
        state.by_pubkey.insert(root.pubkey.clone(), root.id);
        state.rich.insert((Reverse(reserve.balance), reserve.id));
        state.rich.insert((Reverse(root.balance), root.id));
        state.accounts.insert(reserve.id, reserve);
        state.accounts.insert(root.id, root);

        state
    }

    pub fn account(&self, id: u64) -> Option<&Account> {
        self.accounts.get(&id)
    }

    pub fn account_mut(&mut self, id: u64) -> Option<&mut Account> {
        self.accounts.get_mut(&id)
    }

    pub fn account_id_by_pubkey(&self, pubkey: &str) -> Option<u64> {
        self.by_pubkey.get(pubkey).copied()
    }

    pub fn account_by_pubkey(&self, pubkey: &str) -> Option<&Account> {
        self.account_id_by_pubkey(pubkey)
            .and_then(|id| self.accounts.get(&id))
    }

    pub fn name_exists(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn topic(&self, key: &str) -> Option<&Topic> {
        self.topics.get(key)
    }

    pub fn topic_mut(&mut self, key: &str) -> Option<&mut Topic> {
        self.topics.get_mut(key)
    }

    /// Block hash that carried a recent transaction id.
    pub fn tx_block(&self, tx_id: &str) -> Option<&String> {
        self.tx_map.get(tx_id)
    }

    pub fn knows_tx(&self, tx_id: &str) -> bool {
        self.tx_map.contains_key(tx_id)
    }

    /// Accounts ordered by balance descending.
    pub fn rich_list(&self, limit: usize) -> Vec<&Account> {
        self.rich
            .iter()
            .take(limit)
            .filter_map(|&(_, id)| self.accounts.get(&id))
            .collect()
    }

    /// Σ account + topic balances. Reply balances are payout records, not
    /// coins, and are deliberately excluded.
    pub fn coin_total(&self) -> u64 {
        let accounts: u64 = self.accounts.values().map(|a| a.balance).sum();
        let topics: u64 = self.topics.values().map(|t| t.balance).sum();
        accounts + topics
    }

    fn set_balance(&mut self, id: u64, new_balance: u64) {
        let account = self.accounts.get_mut(&id).expect("balance of live account");
        self.rich.remove(&(Reverse(account.balance), id));
        account.balance = new_balance;
        self.rich.insert((Reverse(new_balance), id));
    }

    fn credit(&mut self, id: u64, amount: u64) {
        let balance = self.accounts[&id].balance + amount;
        self.set_balance(id, balance);
    }

    fn debit(&mut self, id: u64, amount: u64) {
        let balance = self.accounts[&id]
            .balance
            .checked_sub(amount)
            .expect("debit checked by validation");
        self.set_balance(id, balance);
    }

    /// Fee destination for one unit beside the miner's: the author's
    /// referrer, or the reserve fund for a root account.
    fn fee_beneficiary(&self, author: u64) -> u64 {
        self.accounts[&author]
            .referrer
            .unwrap_or(RESERVE_FUND_ACCOUNT_ID)
    }

    /// Validate and apply one transaction in the context of block
    /// `block_id` mined by `miner`. On success the returned undo record
    /// inverts the mutation exactly.
    pub fn apply_tx(
        &mut self,
        tx: &TxEnvelope,
        block_id: u64,
        miner: u64,
    ) -> Result<AppliedTx, TxApplyError> {
        if self.tx_map.contains_key(&tx.id) {
            return Err(TxApplyError::Replayed);
        }

        if tx.block_id + TX_ID_WINDOW < block_id || tx.block_id > block_id + TX_ID_WINDOW {
            return Err(TxApplyError::StaleBlockId);
        }

        let undo = match &tx.body {
            TxBody::Register { .. } => self.apply_register(tx, miner)?,
            TxBody::Send { .. } => self.apply_send(tx, miner)?,
            TxBody::NewTopic { .. } => self.apply_new_topic(tx, block_id, miner)?,
            TxBody::Reply { .. } => self.apply_reply(tx, miner)?,
            TxBody::Reward { .. } => self.apply_reward(tx, miner)?,
        };

        Ok(AppliedTx {
            tx_id: tx.id.clone(),
            undo,
        })
    }

    fn apply_register(&mut self, tx: &TxEnvelope, miner: u64) -> Result<TxUndo, TxApplyError> {
        let TxBody::Register {
            name,
            referrer_pubkey,
            avatar,
            ..
        } = &tx.body
        else {
            unreachable!("dispatched on body kind");
        };

        if !valid_account_name(name) {
            return Err(TxApplyError::BadName);
        }

        if self.by_name.contains_key(name) {
            return Err(TxApplyError::NameTaken);
        }

        if self.by_pubkey.contains_key(&tx.pubkey) {
            return Err(TxApplyError::PubkeyTaken);
        }

        let payer = self
            .account_id_by_pubkey(referrer_pubkey)
            .ok_or(TxApplyError::UnknownReferrer)?;

        if self.accounts[&payer].balance < TX_FEE {
            return Err(TxApplyError::InsufficientBalance);
        }

        if !tx.verify_inner_sig() {
            return Err(TxApplyError::BadInnerSignature);
        }

        let beneficiary = self.fee_beneficiary(payer);
        self.debit(payer, TX_FEE);
        self.credit(miner, 1);
        self.credit(beneficiary, 1);

        let account_id = self.next_account_id;
        self.next_account_id += 1;

        let account = Account::new(
            account_id,
            name.clone(),
            tx.pubkey.clone(),
            *avatar,
            Some(payer),
        );
        self.by_name.insert(account.name.clone(), account_id);
        self.by_pubkey.insert(account.pubkey.clone(), account_id);
        self.rich.insert((Reverse(0), account_id));
        self.accounts.insert(account_id, account);

        Ok(TxUndo::Register {
            account_id,
            payer,
            beneficiary,
            miner,
        })
    }

    fn apply_send(&mut self, tx: &TxEnvelope, miner: u64) -> Result<TxUndo, TxApplyError> {
        let TxBody::Send {
            receiver_pubkey,
            amount,
            ..
        } = &tx.body
        else {
            unreachable!("dispatched on body kind");
        };

        let author = self
            .account_id_by_pubkey(&tx.pubkey)
            .ok_or(TxApplyError::UnknownAuthor)?;
        let receiver = self
            .account_id_by_pubkey(receiver_pubkey)
            .ok_or(TxApplyError::UnknownReceiver)?;

        if self.accounts[&author].balance < amount + TX_FEE {
            return Err(TxApplyError::InsufficientBalance);
        }

        let beneficiary = self.fee_beneficiary(author);
        self.debit(author, amount + TX_FEE);
        self.credit(receiver, *amount);
        self.credit(miner, 1);
        self.credit(beneficiary, 1);

        Ok(TxUndo::Send {
            author,
            receiver,
            amount: *amount,
            beneficiary,
            miner,
        })
    }

    fn apply_new_topic(
        &mut self,
        tx: &TxEnvelope,
        block_id: u64,
        miner: u64,
    ) -> Result<TxUndo, TxApplyError> {
        let TxBody::NewTopic { topic, reward } = &tx.body else {
            unreachable!("dispatched on body kind");
        };

        let author = self
            .account_id_by_pubkey(&tx.pubkey)
            .ok_or(TxApplyError::UnknownAuthor)?;

        if self.accounts[&author].balance < reward + TX_FEE {
            return Err(TxApplyError::InsufficientBalance);
        }

        if self.accounts[&author].owned_topics.len() >= MAX_OWNED_TOPICS {
            return Err(TxApplyError::TopicLimit);
        }

        let beneficiary = self.fee_beneficiary(author);
        self.debit(author, reward + TX_FEE);
        self.credit(miner, 1);
        self.credit(beneficiary, 1);

        let new_topic = Topic::new(tx.id.clone(), topic.clone(), block_id, author, *reward);
        self.accounts
            .get_mut(&author)
            .expect("author exists")
            .owned_topics
            .push(tx.id.clone());
        self.topic_list.push_back(tx.id.clone());
        self.topics.insert(tx.id.clone(), new_topic);

        Ok(TxUndo::NewTopic {
            author,
            topic_key: tx.id.clone(),
            reward: *reward,
            beneficiary,
            miner,
        })
    }

    fn apply_reply(&mut self, tx: &TxEnvelope, miner: u64) -> Result<TxUndo, TxApplyError> {
        let TxBody::Reply {
            topic_key,
            reply,
            reply_to,
        } = &tx.body
        else {
            unreachable!("dispatched on body kind");
        };

        let author = self
            .account_id_by_pubkey(&tx.pubkey)
            .ok_or(TxApplyError::UnknownAuthor)?;

        let topic = self.topics.get(topic_key).ok_or(TxApplyError::UnknownTopic)?;

        if let Some(to) = reply_to {
            if !topic.replies.contains_key(to) {
                return Err(TxApplyError::UnknownReply);
            }
        }

        if topic.reply_list.len() >= MAX_REPLIES_PER_TOPIC {
            return Err(TxApplyError::ReplyLimit);
        }

        if self.accounts[&author].balance < TX_FEE {
            return Err(TxApplyError::InsufficientBalance);
        }

        let joins = author != topic.owner && !topic.members.contains(&author);

        if joins && self.accounts[&author].joined_topics.len() >= MAX_JOINED_TOPICS {
            return Err(TxApplyError::JoinLimit);
        }

        let beneficiary = self.fee_beneficiary(author);
        self.debit(author, TX_FEE);
        self.credit(miner, 1);
        self.credit(beneficiary, 1);

        let topic = self.topics.get_mut(topic_key).expect("checked above");
        topic.add_reply(Reply {
            key: tx.id.clone(),
            kind: ReplyKind::Text,
            data: reply.clone(),
            owner: author,
            reply_to: reply_to.clone(),
            balance: 0,
        });

        if joins {
            topic.members.insert(author);
            self.accounts
                .get_mut(&author)
                .expect("author exists")
                .joined_topics
                .insert(topic_key.clone());
        }

        Ok(TxUndo::Reply {
            author,
            topic_key: topic_key.clone(),
            reply_key: tx.id.clone(),
            joined: joins,
            beneficiary,
            miner,
        })
    }

    fn apply_reward(&mut self, tx: &TxEnvelope, miner: u64) -> Result<TxUndo, TxApplyError> {
        let TxBody::Reward {
            topic_key,
            amount,
            reply_to,
        } = &tx.body
        else {
            unreachable!("dispatched on body kind");
        };

        let author = self
            .account_id_by_pubkey(&tx.pubkey)
            .ok_or(TxApplyError::UnknownAuthor)?;

        let topic = self.topics.get(topic_key).ok_or(TxApplyError::UnknownTopic)?;

        if topic.owner != author {
            return Err(TxApplyError::NotTopicOwner);
        }

        let target = topic
            .replies
            .get(reply_to)
            .ok_or(TxApplyError::UnknownReply)?;

        if target.kind == ReplyKind::RewardMarker {
            return Err(TxApplyError::RewardMarkerTarget);
        }

        let reply_owner = target.owner;

        if topic.balance < *amount {
            return Err(TxApplyError::InsufficientTopicBalance);
        }

        if topic.reply_list.len() >= MAX_REPLIES_PER_TOPIC {
            return Err(TxApplyError::ReplyLimit);
        }

        if self.accounts[&author].balance < TX_FEE {
            return Err(TxApplyError::InsufficientBalance);
        }

        let beneficiary = self.fee_beneficiary(author);
        self.debit(author, TX_FEE);
        self.credit(miner, 1);
        self.credit(beneficiary, 1);

        // the reply records the credit, the owner banks it
        self.credit(reply_owner, *amount);
        let topic = self.topics.get_mut(topic_key).expect("checked above");
        topic.balance -= amount;
        topic
            .replies
            .get_mut(reply_to)
            .expect("checked above")
            .balance += amount;
        topic.add_reply(Reply {
            key: tx.id.clone(),
            kind: ReplyKind::RewardMarker,
            data: String::new(),
            owner: reply_owner,
            reply_to: Some(reply_to.clone()),
            balance: *amount,
        });

        Ok(TxUndo::Reward {
            author,
            topic_key: topic_key.clone(),
            marker_key: tx.id.clone(),
            reply_to: reply_to.clone(),
            reply_owner,
            amount: *amount,
            beneficiary,
            miner,
        })
    }

    /// Exact inverse of [`Self::apply_tx`].
    pub fn revert_tx(&mut self, applied: &AppliedTx) {
        match &applied.undo {
            TxUndo::Register {
                account_id,
                payer,
                beneficiary,
                miner,
            } => {
                let account = self
                    .accounts
                    .remove(account_id)
                    .expect("reverting live account");
                self.by_name.remove(&account.name);
                self.by_pubkey.remove(&account.pubkey);
                self.rich.remove(&(Reverse(account.balance), *account_id));
                self.next_account_id -= 1;

                self.debit(*miner, 1);
                self.debit(*beneficiary, 1);
                self.credit(*payer, TX_FEE);
            }
            TxUndo::Send {
                author,
                receiver,
                amount,
                beneficiary,
                miner,
            } => {
                self.debit(*receiver, *amount);
                self.debit(*miner, 1);
                self.debit(*beneficiary, 1);
                self.credit(*author, amount + TX_FEE);
            }
            TxUndo::NewTopic {
                author,
                topic_key,
                reward,
                beneficiary,
                miner,
            } => {
                self.topics.remove(topic_key).expect("reverting live topic");
                let popped = self.topic_list.pop_back();
                debug_assert_eq!(popped.as_deref(), Some(topic_key.as_str()));
                let owner = self.accounts.get_mut(author).expect("author exists");
                let popped = owner.owned_topics.pop();
                debug_assert_eq!(popped.as_deref(), Some(topic_key.as_str()));

                self.debit(*miner, 1);
                self.debit(*beneficiary, 1);
                self.credit(*author, reward + TX_FEE);
            }
            TxUndo::Reply {
                author,
                topic_key,
                reply_key,
                joined,
                beneficiary,
                miner,
            } => {
                let topic = self.topics.get_mut(topic_key).expect("reverting live topic");
                topic.pop_reply(reply_key).expect("reverting live reply");

                if *joined {
                    topic.members.remove(author);
                    self.accounts
                        .get_mut(author)
                        .expect("author exists")
                        .joined_topics
                        .remove(topic_key);
                }

                self.debit(*miner, 1);
                self.debit(*beneficiary, 1);
                self.credit(*author, TX_FEE);
            }
            TxUndo::Reward {
                author,
                topic_key,
                marker_key,
                reply_to,
                reply_owner,
                amount,
                beneficiary,
                miner,
            } => {
                let topic = self.topics.get_mut(topic_key).expect("reverting live topic");
                topic.pop_reply(marker_key).expect("reverting live marker");
                topic
                    .replies
                    .get_mut(reply_to)
                    .expect("rewarded reply exists")
                    .balance -= amount;
                topic.balance += amount;

                self.debit(*reply_owner, *amount);
                self.debit(*miner, 1);
                self.debit(*beneficiary, 1);
                self.credit(*author, TX_FEE);
            }
        }
    }

    /// Apply a whole block: transactions in order, then topic expiry, the
    /// miner subsidy, and the replay-window advance. On any transaction
    /// failure the applied prefix is rolled back before returning.
    pub fn apply_block(
        &mut self,
        block_hash: &str,
        block_id: u64,
        miner_pubkey: &str,
        txs: &[TxEnvelope],
    ) -> Result<BlockUndo, BlockApplyFailure> {
        let miner = self
            .account_id_by_pubkey(miner_pubkey)
            .ok_or(BlockApplyFailure {
                index: 0,
                error: TxApplyError::UnknownAuthor,
            })?;

        let mut applied: Vec<AppliedTx> = Vec::with_capacity(txs.len());

        for (index, tx) in txs.iter().enumerate() {
            match self.apply_tx(tx, block_id, miner) {
                Ok(entry) => applied.push(entry),
                Err(error) => {
                    debug!(tx_id = %tx.id, %error, "transaction rejected, rolling block back");
                    for entry in applied.iter().rev() {
                        self.revert_tx(entry);
                    }
                    return Err(BlockApplyFailure { index, error });
                }
            }
        }

        let expired = self.proc_topic_expired(block_id);

        let subsidy_paid = self.accounts[&RESERVE_FUND_ACCOUNT_ID].balance >= BLOCK_SUBSIDY;
        if subsidy_paid {
            self.debit(RESERVE_FUND_ACCOUNT_ID, BLOCK_SUBSIDY);
            self.credit(miner, BLOCK_SUBSIDY);
        }

        let tx_ids: Vec<String> = applied.iter().map(|t| t.tx_id.clone()).collect();
        for id in &tx_ids {
            self.tx_map.insert(id.clone(), block_hash.to_string());
        }
        self.tx_window.push_back((block_id, block_hash.to_string(), tx_ids));

        let mut pruned = Vec::new();
        while self.tx_window.len() > TX_MAP_BLOCKS {
            let (old_id, old_hash, old_txs) =
                self.tx_window.pop_front().expect("non-empty window");
            for id in &old_txs {
                self.tx_map.remove(id);
            }
            pruned.push((old_id, old_hash, old_txs));
        }

        Ok(BlockUndo {
            hash: block_hash.to_string(),
            block_id,
            miner,
            txs: applied,
            subsidy_paid,
            expired,
            pruned,
        })
    }

    /// Exact inverse of [`Self::apply_block`].
    pub fn rollback_block(&mut self, undo: &BlockUndo) {
        // replay window: drop this block's entry, restore pruned ones
        let (popped_id, _, popped_txs) =
            self.tx_window.pop_back().expect("rolling back live block");
        debug_assert_eq!(popped_id, undo.block_id);
        for id in &popped_txs {
            self.tx_map.remove(id);
        }
        for (old_id, old_hash, old_txs) in undo.pruned.iter().rev() {
            for id in old_txs {
                self.tx_map.insert(id.clone(), old_hash.clone());
            }
            self.tx_window
                .push_front((*old_id, old_hash.clone(), old_txs.clone()));
        }

        if undo.subsidy_paid {
            self.debit(undo.miner, BLOCK_SUBSIDY);
            self.credit(RESERVE_FUND_ACCOUNT_ID, BLOCK_SUBSIDY);
        }

        for expired in undo.expired.iter().rev() {
            self.unexpire_topic(expired);
        }

        for applied in undo.txs.iter().rev() {
            self.revert_tx(applied);
        }
    }

    /// Remove topics whose lifetime ended at `cur_block_id`, returning
    /// their pools to the reserve fund.
    fn proc_topic_expired(&mut self, cur_block_id: u64) -> Vec<ExpiredTopic> {
        let mut expired = Vec::new();

        while let Some(front) = self.topic_list.front() {
            let topic = &self.topics[front];

            if !topic.expired_at(cur_block_id) {
                break;
            }

            let key = self.topic_list.pop_front().expect("front exists");
            let topic = self.topics.remove(&key).expect("listed topic exists");
            debug!(topic = %key, refund = topic.balance, "topic expired");

            if topic.balance > 0 {
                self.credit(RESERVE_FUND_ACCOUNT_ID, topic.balance);
            }

            let owner = self.accounts.get_mut(&topic.owner).expect("owner exists");
            let owner_pos = owner
                .owned_topics
                .iter()
                .position(|k| k == &key)
                .expect("owner lists topic");
            owner.owned_topics.remove(owner_pos);

            for member in &topic.members {
                if let Some(account) = self.accounts.get_mut(member) {
                    account.joined_topics.remove(&key);
                }
            }

            expired.push(ExpiredTopic { topic, owner_pos });
        }

        expired
    }

    fn unexpire_topic(&mut self, expired: &ExpiredTopic) {
        let topic = expired.topic.clone();
        let key = topic.key.clone();

        if topic.balance > 0 {
            self.debit(RESERVE_FUND_ACCOUNT_ID, topic.balance);
        }

        let owner = self.accounts.get_mut(&topic.owner).expect("owner exists");
        owner.owned_topics.insert(expired.owner_pos, key.clone());

        for member in &topic.members {
            if let Some(account) = self.accounts.get_mut(member) {
                account.joined_topics.insert(key.clone());
            }
        }

        self.topic_list.push_front(key.clone());
        self.topics.insert(key, topic);
    }
}
