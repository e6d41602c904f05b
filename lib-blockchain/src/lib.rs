//! Chain core of the Askcoin node.
//!
//! The crate is organized leaves-first, the way the pieces depend on each
//! other:
//!
//! - [`pow`] — 288-bit accumulated-difficulty arithmetic
//! - [`account`], [`topic`] — world-state entities, referenced by id/key
//! - [`block`] — block structures and wire-document validation
//! - [`tx`] — the five transaction kinds and their structural checks
//! - [`state`] — the world state with apply/rollback per transaction
//! - [`store`] — sled-backed block documents with atomic parent/child writes
//! - [`mempool`] — the unverified pool with dependency tracking
//! - [`sync`] — pending chains, fetch requests, and the timer wheel
//! - [`chain`] — the single-threaded blockchain worker tying it together

pub mod account;
pub mod block;
pub mod chain;
pub mod mempool;
pub mod pow;
pub mod state;
pub mod store;
pub mod sync;
pub mod topic;
pub mod tx;

pub use account::{Account, RESERVE_FUND_ACCOUNT_ID, ROOT_ACCOUNT_ID};
pub use block::{Block, PendingBlock};
pub use chain::{genesis_doc, Blockchain, ChainError, GenesisConfig};
pub use mempool::{Mempool, SubmitOutcome};
pub use pow::AccumPow;
pub use state::{WorldState, BLOCK_SUBSIDY, GENESIS_ROOT_BALANCE, TOTAL_SUPPLY};
pub use store::{BlockStore, StoreError};
pub use topic::{Reply, ReplyKind, Topic};
pub use tx::{TxBody, TxEnvelope, TX_FEE};
