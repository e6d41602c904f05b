//! The unverified-transaction pool.
//!
//! Transactions that passed structural and signature validation wait here
//! for a block. Two queues: `uv_2` holds transactions satisfiable against
//! the current world state, with their funds and slots reserved through the
//! `uv_*` counters on accounts and topics; `uv_1` holds transactions whose
//! dependencies (author, referrer, receiver, topic, reply target) are not
//! materialised yet, or whose resources are currently claimed.
//!
//! A transaction is announced to peers exactly once, when it is first
//! admitted to `uv_2`.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::account::{MAX_JOINED_TOPICS, MAX_OWNED_TOPICS};
use crate::state::WorldState;
use crate::topic::{ReplyKind, MAX_REPLIES_PER_TOPIC};
use crate::tx::{TxBody, TxEnvelope, TX_FEE, TX_ID_WINDOW};

/// What `classify` decided about a transaction against the current state.
enum Classification {
    /// Satisfiable now; the reservation to take.
    Ok(Reservation),
    /// A referenced entity does not exist yet.
    Missing,
    /// Entities exist but funds or slots are currently claimed.
    Short,
    /// Never satisfiable (name taken, wrong owner, marker target…).
    Invalid,
}

/// Resources reserved by an admitted transaction.
#[derive(Debug, Clone, PartialEq)]
enum Reservation {
    Register { payer: u64, name: String },
    Spend { author: u64, total: u64 },
    NewTopic { author: u64, total: u64 },
    Reply { author: u64, topic_key: String, joins: bool },
    Reward { author: u64, topic_key: String, amount: u64 },
}

#[derive(Debug, Clone)]
struct PoolTx {
    tx: TxEnvelope,
    announced: bool,
}

/// Outcome of submitting a broadcast transaction.
#[derive(Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Entered `uv_2`; announce it to peers.
    Admitted,
    /// Entered `uv_1`, waiting on a dependency or resource.
    Queued,
    Duplicate,
    Rejected,
}

#[derive(Debug, Default)]
pub struct Mempool {
    uv_1: Vec<PoolTx>,
    uv_2: HashMap<String, (PoolTx, Reservation)>,
    uv_2_order: VecDeque<String>,
    /// Names claimed by pending registrations.
    reserved_names: HashSet<String>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.uv_2.contains_key(tx_id) || self.uv_1.iter().any(|p| p.tx.id == tx_id)
    }

    pub fn admitted_len(&self) -> usize {
        self.uv_2.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.uv_1.len()
    }

    /// Submit a broadcast transaction. The caller has already checked
    /// structure, signatures and replay against the tx map.
    pub fn submit(&mut self, tx: TxEnvelope, state: &mut WorldState) -> SubmitOutcome {
        if self.contains(&tx.id) {
            return SubmitOutcome::Duplicate;
        }

        match self.classify(&tx, state) {
            Classification::Ok(reservation) => {
                self.reserve(&reservation, state);
                let id = tx.id.clone();
                self.uv_2.insert(
                    id.clone(),
                    (
                        PoolTx {
                            tx,
                            announced: true,
                        },
                        reservation,
                    ),
                );
                self.uv_2_order.push_back(id);
                SubmitOutcome::Admitted
            }
            Classification::Missing | Classification::Short => {
                self.uv_1.push(PoolTx {
                    tx,
                    announced: false,
                });
                SubmitOutcome::Queued
            }
            Classification::Invalid => SubmitOutcome::Rejected,
        }
    }

    /// A block committed: drop its transactions from both queues, drop
    /// stale entries, and reclassify the waiting queue. Returns the
    /// transactions newly admitted, for their single announcement.
    pub fn on_block_committed(
        &mut self,
        included: &[String],
        tip_block_id: u64,
        state: &mut WorldState,
    ) -> Vec<TxEnvelope> {
        let included: HashSet<&str> = included.iter().map(String::as_str).collect();

        for id in included.iter() {
            if let Some((_, reservation)) = self.uv_2.remove(*id) {
                self.release(&reservation, state);
                self.uv_2_order.retain(|k| k != id);
            }
        }
        self.uv_1.retain(|p| !included.contains(p.tx.id.as_str()));

        self.drop_stale(tip_block_id, state);

        // reclassify the waiting queue: dependencies may have materialised
        let waiting = std::mem::take(&mut self.uv_1);
        let mut announce = Vec::new();

        for mut pool_tx in waiting {
            match self.classify(&pool_tx.tx, state) {
                Classification::Ok(reservation) => {
                    self.reserve(&reservation, state);

                    if !pool_tx.announced {
                        pool_tx.announced = true;
                        announce.push(pool_tx.tx.clone());
                    }

                    let id = pool_tx.tx.id.clone();
                    self.uv_2.insert(id.clone(), (pool_tx, reservation));
                    self.uv_2_order.push_back(id);
                }
                Classification::Missing => self.uv_1.push(pool_tx),
                Classification::Short | Classification::Invalid => {
                    debug!(tx_id = %pool_tx.tx.id, "waiting transaction no longer satisfiable");
                }
            }
        }

        announce
    }

    /// Transactions from rolled-back blocks re-enter the admitted queue
    /// when still valid; they were announced long ago, so never again.
    pub fn on_block_rolled_back(&mut self, txs: Vec<TxEnvelope>, state: &mut WorldState) {
        for tx in txs {
            if self.contains(&tx.id) || state.knows_tx(&tx.id) {
                continue;
            }

            if let Classification::Ok(reservation) = self.classify(&tx, state) {
                self.reserve(&reservation, state);
                let id = tx.id.clone();
                self.uv_2.insert(
                    id.clone(),
                    (
                        PoolTx {
                            tx,
                            announced: true,
                        },
                        reservation,
                    ),
                );
                self.uv_2_order.push_back(id);
            }
        }
    }

    /// Release every reservation and re-admit from scratch against a
    /// reorganised state. Admission order is preserved.
    pub fn rebuild(&mut self, state: &mut WorldState) {
        let order = std::mem::take(&mut self.uv_2_order);
        let mut admitted = std::mem::take(&mut self.uv_2);
        let waiting = std::mem::take(&mut self.uv_1);
        self.reserved_names.clear();

        for (_, reservation) in admitted.values() {
            self.release_counters_only(reservation, state);
        }

        for id in order {
            let Some((pool_tx, _)) = admitted.remove(&id) else {
                continue;
            };
            self.readmit(pool_tx, state);
        }

        for pool_tx in waiting {
            self.readmit(pool_tx, state);
        }
    }

    fn readmit(&mut self, pool_tx: PoolTx, state: &mut WorldState) {
        if state.knows_tx(&pool_tx.tx.id) {
            return;
        }

        match self.classify(&pool_tx.tx, state) {
            Classification::Ok(reservation) => {
                self.reserve(&reservation, state);
                let id = pool_tx.tx.id.clone();
                self.uv_2.insert(id.clone(), (pool_tx, reservation));
                self.uv_2_order.push_back(id);
            }
            Classification::Missing | Classification::Short => self.uv_1.push(pool_tx),
            Classification::Invalid => {
                debug!(tx_id = %pool_tx.tx.id, "transaction invalid after reorganisation");
            }
        }
    }

    /// Drop transactions whose `block_id` anchor fell out of the window.
    fn drop_stale(&mut self, tip_block_id: u64, state: &mut WorldState) {
        let stale = |tx: &TxEnvelope| {
            tx.block_id + TX_ID_WINDOW < tip_block_id || tx.block_id > tip_block_id + TX_ID_WINDOW
        };

        let stale_ids: Vec<String> = self
            .uv_2_order
            .iter()
            .filter(|id| self.uv_2.get(*id).is_some_and(|(p, _)| stale(&p.tx)))
            .cloned()
            .collect();

        for id in stale_ids {
            if let Some((_, reservation)) = self.uv_2.remove(&id) {
                debug!(tx_id = %id, "dropping stale admitted transaction");
                self.release(&reservation, state);
                self.uv_2_order.retain(|k| k != &id);
            }
        }

        self.uv_1.retain(|p| !stale(&p.tx));
    }

    fn classify(&self, tx: &TxEnvelope, state: &WorldState) -> Classification {
        match &tx.body {
            TxBody::Register {
                name,
                referrer_pubkey,
                ..
            } => {
                if state.name_exists(name) || self.reserved_names.contains(name) {
                    return Classification::Invalid;
                }

                if state.account_id_by_pubkey(&tx.pubkey).is_some() {
                    return Classification::Invalid;
                }

                let Some(referrer) = state.account_by_pubkey(referrer_pubkey) else {
                    return Classification::Missing;
                };

                if referrer.free_balance() < TX_FEE {
                    return Classification::Short;
                }

                if !tx.verify_inner_sig() {
                    return Classification::Invalid;
                }

                Classification::Ok(Reservation::Register {
                    payer: referrer.id,
                    name: name.clone(),
                })
            }
            TxBody::Send {
                receiver_pubkey,
                amount,
                ..
            } => {
                let Some(author) = state.account_by_pubkey(&tx.pubkey) else {
                    return Classification::Missing;
                };

                if state.account_id_by_pubkey(receiver_pubkey).is_none() {
                    return Classification::Missing;
                }

                if author.free_balance() < amount + TX_FEE {
                    return Classification::Short;
                }

                Classification::Ok(Reservation::Spend {
                    author: author.id,
                    total: amount + TX_FEE,
                })
            }
            TxBody::NewTopic { reward, .. } => {
                let Some(author) = state.account_by_pubkey(&tx.pubkey) else {
                    return Classification::Missing;
                };

                if author.free_balance() < reward + TX_FEE {
                    return Classification::Short;
                }

                if author.owned_topics.len() as u64 + author.uv_topic >= MAX_OWNED_TOPICS as u64 {
                    return Classification::Short;
                }

                Classification::Ok(Reservation::NewTopic {
                    author: author.id,
                    total: reward + TX_FEE,
                })
            }
            TxBody::Reply {
                topic_key,
                reply_to,
                ..
            } => {
                let Some(author) = state.account_by_pubkey(&tx.pubkey) else {
                    return Classification::Missing;
                };
                let Some(topic) = state.topic(topic_key) else {
                    return Classification::Missing;
                };

                if let Some(to) = reply_to {
                    if !topic.replies.contains_key(to) {
                        return Classification::Missing;
                    }
                }

                if topic.reply_list.len() as u64 + topic.uv_reply >= MAX_REPLIES_PER_TOPIC as u64 {
                    return Classification::Short;
                }

                if author.free_balance() < TX_FEE {
                    return Classification::Short;
                }

                let joins = author.id != topic.owner && !topic.members.contains(&author.id);

                if joins
                    && author.joined_topics.len() as u64 + author.uv_join_topic
                        >= MAX_JOINED_TOPICS as u64
                {
                    return Classification::Short;
                }

                Classification::Ok(Reservation::Reply {
                    author: author.id,
                    topic_key: topic_key.clone(),
                    joins,
                })
            }
            TxBody::Reward {
                topic_key,
                amount,
                reply_to,
            } => {
                let Some(author) = state.account_by_pubkey(&tx.pubkey) else {
                    return Classification::Missing;
                };
                let Some(topic) = state.topic(topic_key) else {
                    return Classification::Missing;
                };

                if topic.owner != author.id {
                    return Classification::Invalid;
                }

                let Some(target) = topic.replies.get(reply_to) else {
                    return Classification::Missing;
                };

                if target.kind == ReplyKind::RewardMarker {
                    return Classification::Invalid;
                }

                if topic.free_balance() < *amount {
                    return Classification::Short;
                }

                if topic.reply_list.len() as u64 + topic.uv_reply >= MAX_REPLIES_PER_TOPIC as u64 {
                    return Classification::Short;
                }

                if author.free_balance() < TX_FEE {
                    return Classification::Short;
                }

                Classification::Ok(Reservation::Reward {
                    author: author.id,
                    topic_key: topic_key.clone(),
                    amount: *amount,
                })
            }
        }
    }

    fn reserve(&mut self, reservation: &Reservation, state: &mut WorldState) {
        match reservation {
            Reservation::Register { payer, name } => {
                self.reserved_names.insert(name.clone());
                if let Some(account) = state.account_mut(*payer) {
                    account.uv_spend += TX_FEE;
                }
            }
            Reservation::Spend { author, total } => {
                if let Some(account) = state.account_mut(*author) {
                    account.uv_spend += total;
                }
            }
            Reservation::NewTopic { author, total } => {
                if let Some(account) = state.account_mut(*author) {
                    account.uv_spend += total;
                    account.uv_topic += 1;
                }
            }
            Reservation::Reply {
                author,
                topic_key,
                joins,
            } => {
                if let Some(account) = state.account_mut(*author) {
                    account.uv_spend += TX_FEE;
                    if *joins {
                        account.uv_join_topic += 1;
                    }
                }
                if let Some(topic) = state.topic_mut(topic_key) {
                    topic.uv_reply += 1;
                }
            }
            Reservation::Reward {
                author,
                topic_key,
                amount,
            } => {
                if let Some(account) = state.account_mut(*author) {
                    account.uv_spend += TX_FEE;
                }
                if let Some(topic) = state.topic_mut(topic_key) {
                    topic.uv_reward += amount;
                    topic.uv_reply += 1;
                }
            }
        }
    }

    fn release(&mut self, reservation: &Reservation, state: &mut WorldState) {
        if let Reservation::Register { name, .. } = reservation {
            self.reserved_names.remove(name);
        }
        self.release_counters_only(reservation, state);
    }

    /// Entity counters only; entities gone from the state (an expired
    /// topic, a reverted account) simply have nothing to release.
    fn release_counters_only(&self, reservation: &Reservation, state: &mut WorldState) {
        match reservation {
            Reservation::Register { payer, .. } => {
                if let Some(account) = state.account_mut(*payer) {
                    account.uv_spend = account.uv_spend.saturating_sub(TX_FEE);
                }
            }
            Reservation::Spend { author, total } => {
                if let Some(account) = state.account_mut(*author) {
                    account.uv_spend = account.uv_spend.saturating_sub(*total);
                }
            }
            Reservation::NewTopic { author, total } => {
                if let Some(account) = state.account_mut(*author) {
                    account.uv_spend = account.uv_spend.saturating_sub(*total);
                    account.uv_topic = account.uv_topic.saturating_sub(1);
                }
            }
            Reservation::Reply {
                author,
                topic_key,
                joins,
            } => {
                if let Some(account) = state.account_mut(*author) {
                    account.uv_spend = account.uv_spend.saturating_sub(TX_FEE);
                    if *joins {
                        account.uv_join_topic = account.uv_join_topic.saturating_sub(1);
                    }
                }
                if let Some(topic) = state.topic_mut(topic_key) {
                    topic.uv_reply = topic.uv_reply.saturating_sub(1);
                }
            }
            Reservation::Reward {
                author,
                topic_key,
                amount,
            } => {
                if let Some(account) = state.account_mut(*author) {
                    account.uv_spend = account.uv_spend.saturating_sub(TX_FEE);
                }
                if let Some(topic) = state.topic_mut(topic_key) {
                    topic.uv_reward = topic.uv_reward.saturating_sub(*amount);
                    topic.uv_reply = topic.uv_reply.saturating_sub(1);
                }
            }
        }
    }
}
