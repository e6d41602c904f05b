//! Peer-to-peer session layer for the Askcoin node.
//!
//! This crate owns everything below the blockchain: the framed JSON wire
//! codec, the mutual REG / REG_VERIFY registration handshake, heartbeats,
//! the score-ordered peer registry with its timed ban set, and the connect
//! loop. Messages from registered peers that are not session traffic are
//! handed to the blockchain worker through an unbounded channel as
//! [`NetworkEvent`]s, preserving per-peer send order.

pub mod codec;
pub mod message;
pub mod node;
pub mod peer;
pub mod registry;

pub use node::{start, NodeConfig, NodeHandle};
pub use peer::{NetworkEvent, PeerCtrl, PeerHandle};
pub use registry::{ScoreBook, BAN_DURATION, INITIAL_SCORE};

use thiserror::Error;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length {0} outside limits")]
    FrameTooLarge(usize),
    #[error("bad json: {0}")]
    BadJson(String),
}
