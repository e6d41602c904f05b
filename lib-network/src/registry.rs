//! Peer address registry: reputation scores, the dial-candidate ordering,
//! and the timed ban set.
//!
//! All book-keeping lives behind one mutex (`score_mutex` in the node); the
//! per-entry connection state is a separate atomic so the connect loop can
//! reserve a candidate and then release the lock before dialing.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

/// Score assigned to a newly learned address.
pub const INITIAL_SCORE: u64 = 1_000_000_000;

/// How long a punished address stays banned.
pub const BAN_DURATION: Duration = Duration::from_secs(600);

/// Connection state of a scored address.
pub mod peer_state {
    /// Not connected, available for dialing.
    pub const FREE: u8 = 0;
    /// Reserved by the connect loop or an inbound registration in flight.
    pub const RESERVED: u8 = 1;
    /// Registered connection established.
    pub const CONNECTED: u8 = 2;
}

/// One known address with its reputation.
#[derive(Debug)]
pub struct ScoreEntry {
    /// `host:port`.
    pub key: String,
    pub host: String,
    pub port: u16,
    /// See [`peer_state`]. Atomic so reservation does not hold the book lock.
    pub state: AtomicU8,
}

impl ScoreEntry {
    fn new(host: String, port: u16) -> Arc<Self> {
        Arc::new(Self {
            key: format!("{host}:{port}"),
            host,
            port,
            state: AtomicU8::new(peer_state::FREE),
        })
    }
}

/// The score book: every known peer address, ordered by score descending
/// for candidate selection, plus the banned set.
#[derive(Debug, Default)]
pub struct ScoreBook {
    entries: HashMap<String, Arc<ScoreEntry>>,
    scores: HashMap<String, u64>,
    // (reverse score, key) so iteration sees the best-scored address first
    ordered: BTreeSet<(std::cmp::Reverse<u64>, String)>,
    banned: HashMap<String, Instant>,
}

impl ScoreBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address if unknown. Returns false when already present.
    pub fn add_peer(&mut self, host: &str, port: u16) -> bool {
        let key = format!("{host}:{port}");

        if self.entries.contains_key(&key) {
            return false;
        }

        let entry = ScoreEntry::new(host.to_string(), port);
        self.ordered.insert((std::cmp::Reverse(INITIAL_SCORE), key.clone()));
        self.scores.insert(key.clone(), INITIAL_SCORE);
        self.entries.insert(key, entry);

        true
    }

    pub fn get(&self, key: &str) -> Option<&Arc<ScoreEntry>> {
        self.entries.get(key)
    }

    pub fn score_of(&self, key: &str) -> Option<u64> {
        self.scores.get(key).copied()
    }

    /// Apply a score delta, keeping the ordering index in step. Scores
    /// saturate at zero.
    pub fn adjust(&mut self, key: &str, delta: i64) -> bool {
        let Some(score) = self.scores.get_mut(key) else {
            return false;
        };

        self.ordered.remove(&(std::cmp::Reverse(*score), key.to_string()));
        *score = if delta >= 0 {
            score.saturating_add(delta as u64)
        } else {
            score.saturating_sub(delta.unsigned_abs())
        };
        self.ordered.insert((std::cmp::Reverse(*score), key.to_string()));

        true
    }

    /// Remove an address entirely. Used to retire dead zero-score entries.
    pub fn remove(&mut self, key: &str) -> bool {
        let Some(score) = self.scores.remove(key) else {
            return false;
        };

        self.ordered.remove(&(std::cmp::Reverse(score), key.to_string()));
        self.entries.remove(key);

        true
    }

    /// Pick the best free, unbanned candidate and reserve it.
    ///
    /// Zero-score entries that are free are retired instead of returned;
    /// this is the book's only retirement path.
    pub fn reserve_candidate(&mut self, now: Instant) -> Option<Arc<ScoreEntry>> {
        self.sweep_bans(now);
        let mut retire = Vec::new();
        let mut picked = None;

        for (std::cmp::Reverse(score), key) in self.ordered.iter() {
            if self.banned.contains_key(key) {
                debug!(peer = %key, "skipping banned dial candidate");
                continue;
            }

            let entry = &self.entries[key];

            if *score == 0 {
                if entry.state.load(Ordering::Relaxed) == peer_state::FREE {
                    retire.push(key.clone());
                }
                continue;
            }

            if entry
                .state
                .compare_exchange(
                    peer_state::FREE,
                    peer_state::RESERVED,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                picked = Some(Arc::clone(entry));
                break;
            }
        }

        for key in retire {
            self.remove(&key);
        }

        picked
    }

    /// Ban an address until `now + BAN_DURATION`.
    pub fn ban(&mut self, key: &str, now: Instant) {
        self.banned.insert(key.to_string(), now + BAN_DURATION);
    }

    pub fn is_banned(&mut self, key: &str, now: Instant) -> bool {
        match self.banned.get(key) {
            Some(&until) if until > now => true,
            Some(_) => {
                self.banned.remove(key);
                debug!(peer = %key, "unbanned");
                false
            }
            None => false,
        }
    }

    /// Drop every ban that has expired.
    pub fn sweep_bans(&mut self, now: Instant) {
        self.banned.retain(|key, &mut until| {
            if until > now {
                true
            } else {
                debug!(peer = %key, "unbanned");
                false
            }
        });
    }

    /// Known addresses, best score first. Used to rewrite the peer file.
    pub fn snapshot(&self) -> Vec<String> {
        self.ordered.iter().map(|(_, key)| key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
