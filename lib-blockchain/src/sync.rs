//! Synchronizer containers: pending blocks, fork-candidate chains, the
//! brief/detail request tables, and the timer wheel.
//!
//! Timers never run callbacks. They produce [`TimerEvent`] messages that
//! the blockchain worker drains on its one-second tick, so every timer
//! expiration executes under the same single-threaded worker as peer
//! messages.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use lib_network::PeerHandle;

use crate::block::PendingBlock;
use crate::pow::AccumPow;

/// Cap on cached pending block headers, evicted in insertion order.
pub const PENDING_BLOCK_CAP: usize = 1_000_000;

/// A fork candidate: a contiguous run of pending headers announced by one
/// peer, walked backward toward a known ancestor.
#[derive(Debug)]
pub struct PendingChain {
    pub id: u64,
    pub peer: PeerHandle,
    /// Total work the peer claims for its chain.
    pub declared_pow: AccumPow,
    /// Declared work minus the zero-bits of every header collected so far;
    /// must land exactly on the anchor block's accumulated pow.
    pub remain_pow: AccumPow,
    /// Oldest first.
    pub blocks: VecDeque<Arc<PendingBlock>>,
    /// Cursor of the next block a detail fetch needs.
    pub start: usize,
    /// Whether a brief request currently depends on this chain.
    pub brief_attached: bool,
    /// Whether the detail request currently depends on this chain.
    pub detail_attached: bool,
}

/// An outstanding BLOCK_BRIEF_REQ for one parent hash.
#[derive(Debug)]
pub struct BriefRequest {
    pub hash: String,
    /// Chains waiting on this hash; the last entry's peer was asked.
    pub attached: Vec<u64>,
    pub try_num: u32,
    pub timer_id: u64,
}

/// The single outstanding BLOCK_DETAIL_REQ while switching.
#[derive(Debug)]
pub struct DetailRequest {
    /// The chain being adopted.
    pub owner: u64,
    pub attached: Vec<u64>,
    pub try_num: u32,
    pub timer_id: u64,
}

/// All synchronizer state, owned by the blockchain worker.
#[derive(Debug, Default)]
pub struct SyncState {
    chains: HashMap<u64, PendingChain>,
    next_chain_id: u64,
    /// Chains whose oldest header's parent is still unknown.
    pub pending_brief_chains: Vec<u64>,
    /// Chains anchored to a known block, candidates for adoption.
    pub brief_chains: Vec<u64>,
    pub pending_blocks: HashMap<String, Arc<PendingBlock>>,
    pending_block_order: VecDeque<String>,
    pub brief_reqs: HashMap<String, BriefRequest>,
    pub detail: Option<DetailRequest>,
    pub is_switching: bool,
    /// Peers with a chain in flight; one pending chain per peer.
    pub pending_peer_keys: HashSet<String>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chain(
        &mut self,
        peer: PeerHandle,
        newest: Arc<PendingBlock>,
        declared_pow: AccumPow,
        remain_pow: AccumPow,
    ) -> u64 {
        let id = self.next_chain_id;
        self.next_chain_id += 1;

        let mut blocks = VecDeque::new();
        blocks.push_back(newest);
        self.chains.insert(
            id,
            PendingChain {
                id,
                peer,
                declared_pow,
                remain_pow,
                blocks,
                start: 0,
                brief_attached: false,
                detail_attached: false,
            },
        );

        id
    }

    pub fn chain(&self, id: u64) -> Option<&PendingChain> {
        self.chains.get(&id)
    }

    pub fn chain_mut(&mut self, id: u64) -> Option<&mut PendingChain> {
        self.chains.get_mut(&id)
    }

    /// Drop a chain and its one-per-peer claim. The caller removes the id
    /// from whichever list it sits in.
    pub fn drop_chain(&mut self, id: u64) -> Option<PendingChain> {
        let chain = self.chains.remove(&id)?;
        self.pending_peer_keys.remove(chain.peer.key());
        Some(chain)
    }

    pub fn has_pending_from(&self, peer_key: &str) -> bool {
        self.pending_peer_keys.contains(peer_key)
    }

    /// Cache a pending header, evicting the oldest entries past the cap.
    pub fn insert_pending_block(&mut self, block: PendingBlock) -> Arc<PendingBlock> {
        let arc = Arc::new(block);
        self.pending_blocks
            .insert(arc.hash.clone(), Arc::clone(&arc));
        self.pending_block_order.push_back(arc.hash.clone());

        while self.pending_block_order.len() > PENDING_BLOCK_CAP {
            if let Some(old) = self.pending_block_order.pop_front() {
                self.pending_blocks.remove(&old);
            }
        }

        arc
    }
}

/// What a fired timer asks the worker to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The 1-second brief-request retry tick.
    BriefRetry { hash: String },
    /// The 1-second detail-request retry tick.
    DetailRetry,
    /// A future-dated announcement becomes processable.
    EnqueueChain { chain_id: u64 },
}

#[derive(Debug)]
struct TimerEntry {
    deadline: u64,
    interval: u64,
    oneshot: bool,
    event: TimerEvent,
}

/// A second-granularity timer queue producing events instead of running
/// callbacks.
#[derive(Debug, Default)]
pub struct TimerController {
    entries: HashMap<u64, TimerEntry>,
    queue: BTreeSet<(u64, u64)>,
    next_id: u64,
}

impl TimerController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` every `interval` seconds (or once, `oneshot`).
    pub fn add(&mut self, event: TimerEvent, interval: u64, oneshot: bool, now: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let deadline = now + interval;
        self.entries.insert(
            id,
            TimerEntry {
                deadline,
                interval,
                oneshot,
                event,
            },
        );
        self.queue.insert((deadline, id));

        id
    }

    pub fn cancel(&mut self, id: u64) {
        if let Some(entry) = self.entries.remove(&id) {
            self.queue.remove(&(entry.deadline, id));
        }
    }

    /// Fire everything due at `now`. Repeating timers re-arm.
    pub fn poll(&mut self, now: u64) -> Vec<TimerEvent> {
        let mut fired = Vec::new();

        while let Some(&(deadline, id)) = self.queue.iter().next() {
            if deadline > now {
                break;
            }

            self.queue.remove(&(deadline, id));
            let entry = self.entries.get_mut(&id).expect("queued entry exists");
            fired.push(entry.event.clone());

            if entry.oneshot {
                self.entries.remove(&id);
            } else {
                entry.deadline = now + entry.interval;
                self.queue.insert((entry.deadline, id));
            }
        }

        fired
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeating_timer_rearms_until_cancelled() {
        let mut timers = TimerController::new();
        let id = timers.add(TimerEvent::DetailRetry, 1, false, 100);

        assert!(timers.poll(100).is_empty());
        assert_eq!(timers.poll(101), vec![TimerEvent::DetailRetry]);
        assert_eq!(timers.poll(102), vec![TimerEvent::DetailRetry]);

        timers.cancel(id);
        assert!(timers.poll(200).is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn oneshot_fires_once() {
        let mut timers = TimerController::new();
        timers.add(
            TimerEvent::EnqueueChain { chain_id: 7 },
            5,
            true,
            100,
        );

        assert!(timers.poll(104).is_empty());
        assert_eq!(
            timers.poll(105),
            vec![TimerEvent::EnqueueChain { chain_id: 7 }]
        );
        assert!(timers.poll(300).is_empty());
    }

    #[test]
    fn pending_block_cache_evicts_in_insertion_order() {
        let mut sync = SyncState::new();

        for i in 0..3 {
            sync.insert_pending_block(PendingBlock {
                id: i,
                utc: 0,
                version: 1,
                zero_bits: 1,
                hash: format!("h{i}"),
                pre_hash: "p".into(),
            });
        }

        assert_eq!(sync.pending_blocks.len(), 3);
        assert!(sync.pending_blocks.contains_key("h0"));
    }
}
