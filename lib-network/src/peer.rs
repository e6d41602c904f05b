//! Peer session records and the handle handed to the blockchain worker.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

/// Registration progress of a connection, mirroring the handshake states:
/// 0 = fresh, 1 = REG_REQ sent (outbound), 2 = REG_RSP sent (inbound),
/// 3 = REG_RSP received, awaiting verify, 4 = verify dialed back.
pub mod reg_state {
    pub const FRESH: u8 = 0;
    pub const REQ_SENT: u8 = 1;
    pub const RSP_SENT: u8 = 2;
    pub const RSP_RECEIVED: u8 = 3;
    pub const VERIFY_SENT: u8 = 4;
}

/// Per-connection session bookkeeping, guarded by the node's peer mutex.
#[derive(Debug)]
pub struct PeerSession {
    pub conn_id: u64,
    pub passive: bool,
    pub state: u8,
    /// Random nonce we generated for this connection.
    pub local_key: u32,
    /// Nonce the remote sent us.
    pub remote_key: u32,
    /// The remote's connection id for the registration connection.
    pub reg_conn_id: u64,
    /// `host:port` the peer announced (inbound) or that we dialed (outbound).
    pub addr: Option<(String, u16)>,
    pub out_tx: mpsc::UnboundedSender<Value>,
    pub ctrl_tx: mpsc::UnboundedSender<PeerCtrl>,
}

impl PeerSession {
    /// `host:port`, empty until the address is known.
    pub fn key(&self) -> String {
        match &self.addr {
            Some((host, port)) => format!("{host}:{port}"),
            None => String::new(),
        }
    }

    pub fn handle(&self) -> PeerHandle {
        PeerHandle {
            key: Arc::from(self.key().as_str()),
            conn_id: self.conn_id,
            out_tx: self.out_tx.clone(),
            ctrl_tx: self.ctrl_tx.clone(),
        }
    }
}

/// Control messages for a connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCtrl {
    /// Registration completed; `ping` starts the 5-second heartbeat
    /// (the side that initiated the registration connection pings).
    Promote { ping: bool },
    Close,
}

/// Cloneable handle to a registered peer, used by the blockchain worker to
/// send frames and observe liveness without touching the socket.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    key: Arc<str>,
    conn_id: u64,
    out_tx: mpsc::UnboundedSender<Value>,
    ctrl_tx: mpsc::UnboundedSender<PeerCtrl>,
}

impl PeerHandle {
    /// `host:port` of the peer.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queue a frame; false when the connection is gone.
    pub fn send(&self, doc: Value) -> bool {
        self.out_tx.send(doc).is_ok()
    }

    /// True once the connection task has exited.
    pub fn is_closed(&self) -> bool {
        self.out_tx.is_closed()
    }

    /// Ask the connection task to close the socket.
    pub fn close(&self) {
        let _ = self.ctrl_tx.send(PeerCtrl::Close);
    }

    /// A handle wired to in-memory channels instead of a socket, for tests
    /// of everything above the session layer. Returns the handle plus the
    /// receiving ends: sent frames and control messages land there.
    pub fn loopback(
        key: &str,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Value>,
        mpsc::UnboundedReceiver<PeerCtrl>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        (
            Self {
                key: Arc::from(key),
                conn_id: 0,
                out_tx,
                ctrl_tx,
            },
            out_rx,
            ctrl_rx,
        )
    }
}

/// Events delivered from the session layer to the blockchain worker.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A non-session message from a registered peer.
    PeerMessage { peer: PeerHandle, doc: Value },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn loopback_handle_delivers_and_closes() {
        let (peer, mut out_rx, _ctrl_rx) = PeerHandle::loopback("10.0.0.1:100");
        assert!(peer.send(json!({"msg_type": 1})));
        assert_eq!(out_rx.try_recv().unwrap(), json!({"msg_type": 1}));
        assert!(!peer.is_closed());

        drop(out_rx);
        assert!(peer.is_closed());
        assert!(!peer.send(json!({})));
    }
}
