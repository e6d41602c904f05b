//! The p2p node: listener, connect loop, and the registration handshake.
//!
//! A peer is not "registered" until both directions of its announced
//! address are proven: the side that receives REG_REQ answers REG_RSP and
//! then dials the *claimed* `host:port` on a second connection to deliver
//! REG_VERIFY_REQ. Only when the nonces survive the round trip do both
//! sides promote the first connection. A peer cannot register an address it
//! does not actually listen on.
//!
//! Locking: `directory` (peer sessions) before `scores` (reputation book),
//! never across an await point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::codec::{read_frame, write_frame};
use crate::message::*;
use crate::peer::{reg_state, NetworkEvent, PeerCtrl, PeerHandle, PeerSession};
use crate::registry::{peer_state, ScoreBook};
use crate::NetError;

/// Idle deadline for any connection; reset by registration and heartbeats.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat cadence on registered connections.
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of the connect-loop scan when there is nothing to dial.
const CONNECT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// How long an outbound dial may block.
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Listener and dialer configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address announced to peers in REG_REQ.
    pub host: String,
    pub port: u16,
    pub max_passive_conn: u32,
    pub max_active_conn: u32,
}

#[derive(Default)]
struct Directory {
    registered: std::collections::HashMap<u64, PeerSession>,
    unreg: std::collections::HashMap<u64, PeerSession>,
}

impl Directory {
    fn total(&self) -> usize {
        self.registered.len() + self.unreg.len()
    }

    fn passive_count(&self) -> usize {
        self.registered
            .values()
            .chain(self.unreg.values())
            .filter(|s| s.passive)
            .count()
    }

    fn active_count(&self) -> usize {
        self.total() - self.passive_count()
    }
}

struct NodeInner {
    config: NodeConfig,
    directory: Mutex<Directory>,
    scores: Mutex<ScoreBook>,
    events: mpsc::UnboundedSender<NetworkEvent>,
    next_conn_id: AtomicU64,
    stop: watch::Sender<bool>,
}

/// Handle to a running (or detached) node. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

/// How a freshly opened connection entered the node.
enum ConnKind {
    /// Accepted on the listener.
    Passive,
    /// Dialed by the connect loop toward a scored address.
    Active { host: String, port: u16 },
    /// The second, verification connection dialed back after REG_REQ.
    VerifyDial { reg_conn_id: u64 },
}

/// Start listening, scanning and dialing. Events for registered peers are
/// delivered to `events` in per-peer send order.
pub async fn start(
    config: NodeConfig,
    events: mpsc::UnboundedSender<NetworkEvent>,
) -> Result<NodeHandle, NetError> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .map_err(NetError::Io)?;
    info!(port = config.port, "p2p node listening");

    let (stop, _) = watch::channel(false);
    let inner = Arc::new(NodeInner {
        config,
        directory: Mutex::new(Directory::default()),
        scores: Mutex::new(ScoreBook::new()),
        events,
        next_conn_id: AtomicU64::new(1),
        stop,
    });

    tokio::spawn(accept_loop(Arc::clone(&inner), listener));
    tokio::spawn(connect_loop(Arc::clone(&inner)));

    Ok(NodeHandle { inner })
}

impl NodeHandle {
    /// A node with no sockets: the score book and peer directory work, so
    /// chain-side code can be exercised without networking.
    pub fn detached() -> Self {
        let (events, _) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(NodeInner {
                config: NodeConfig {
                    host: "127.0.0.1".into(),
                    port: 0,
                    max_passive_conn: 0,
                    max_active_conn: 0,
                },
                directory: Mutex::new(Directory::default()),
                scores: Mutex::new(ScoreBook::new()),
                events,
                next_conn_id: AtomicU64::new(1),
                stop,
            }),
        }
    }

    /// Close, ban for 600 seconds, and subtract 1000 from the peer's score.
    pub fn punish(&self, peer: &PeerHandle) {
        warn!(peer = peer.key(), "punishing peer");
        peer.close();

        let mut scores = self.inner.scores.lock().unwrap();
        scores.adjust(peer.key(), -1000);
        scores.ban(peer.key(), Instant::now());
    }

    /// Reward an address that supplied a successfully applied block.
    pub fn credit(&self, key: &str, amount: u64) {
        self.inner.scores.lock().unwrap().adjust(key, amount as i64);
    }

    /// Send a frame to every registered peer.
    pub fn broadcast(&self, doc: &Value) {
        let directory = self.inner.directory.lock().unwrap();
        for session in directory.registered.values() {
            let _ = session.out_tx.send(doc.clone());
        }
    }

    /// Seed a dialable address.
    pub fn add_known_peer(&self, host: &str, port: u16) {
        self.inner.scores.lock().unwrap().add_peer(host, port);
    }

    /// Known addresses, best first; written back to the peer file.
    pub fn known_peers(&self) -> Vec<String> {
        self.inner.scores.lock().unwrap().snapshot()
    }

    pub fn registered_count(&self) -> usize {
        self.inner.directory.lock().unwrap().registered.len()
    }

    pub fn is_banned(&self, key: &str) -> bool {
        self.inner.scores.lock().unwrap().is_banned(key, Instant::now())
    }

    pub fn score_of(&self, key: &str) -> Option<u64> {
        self.inner.scores.lock().unwrap().score_of(key)
    }

    /// Ask every loop and connection to wind down.
    pub fn stop(&self) {
        let _ = self.inner.stop.send(true);

        let directory = self.inner.directory.lock().unwrap();
        for session in directory
            .registered
            .values()
            .chain(directory.unreg.values())
        {
            let _ = session.ctrl_tx.send(PeerCtrl::Close);
        }
    }
}

async fn accept_loop(inner: Arc<NodeInner>, listener: TcpListener) {
    let mut stop = inner.stop.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, addr)) = accepted else { continue };

                let allowed = {
                    let directory = inner.directory.lock().unwrap();
                    directory.passive_count() < inner.config.max_passive_conn as usize
                };

                if !allowed {
                    debug!(%addr, "passive connection limit reached, dropping");
                    continue;
                }

                tokio::spawn(run_connection(Arc::clone(&inner), stream, ConnKind::Passive));
            }
            _ = stop.changed() => break,
        }
    }
}

async fn connect_loop(inner: Arc<NodeInner>) {
    let mut stop = inner.stop.subscribe();

    loop {
        let dialed = try_dial_one(&inner).await;

        if !dialed {
            tokio::select! {
                _ = tokio::time::sleep(CONNECT_SCAN_INTERVAL) => {}
                _ = stop.changed() => break,
            }
        }

        if *inner.stop.borrow() {
            break;
        }
    }
}

/// One scan of the score book: reserve the best free candidate and dial it.
/// Returns true when a dial was attempted.
async fn try_dial_one(inner: &Arc<NodeInner>) -> bool {
    {
        let directory = inner.directory.lock().unwrap();
        if directory.active_count() >= inner.config.max_active_conn as usize {
            return false;
        }
    }

    let candidate = {
        let mut scores = inner.scores.lock().unwrap();
        scores.reserve_candidate(Instant::now())
    };

    let Some(entry) = candidate else { return false };
    debug!(peer = %entry.key, "dialing peer from score book");

    let dial = tokio::time::timeout(
        DIAL_TIMEOUT,
        TcpStream::connect((entry.host.as_str(), entry.port)),
    )
    .await;

    match dial {
        Ok(Ok(stream)) => {
            debug!(peer = %entry.key, "connected to peer");
            tokio::spawn(run_connection(
                Arc::clone(inner),
                stream,
                ConnKind::Active {
                    host: entry.host.clone(),
                    port: entry.port,
                },
            ));
        }
        _ => {
            debug!(peer = %entry.key, "connect to peer failed");
            entry.state.store(peer_state::FREE, Ordering::Relaxed);
            inner.scores.lock().unwrap().adjust(&entry.key, -10);
        }
    }

    true
}

/// What the frame handler asks the connection task to do next.
enum Action {
    Continue,
    ResetDeadline,
    Close,
}

async fn run_connection(inner: Arc<NodeInner>, stream: TcpStream, kind: ConnKind) {
    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = stream.into_split();

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Value>();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<PeerCtrl>();
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Result<Value, NetError>>();

    let passive = matches!(kind, ConnKind::Passive);
    let mut session = PeerSession {
        conn_id,
        passive,
        state: reg_state::FRESH,
        local_key: 0,
        remote_key: 0,
        reg_conn_id: 0,
        addr: None,
        out_tx: out_tx.clone(),
        ctrl_tx: ctrl_tx.clone(),
    };

    match &kind {
        ConnKind::Active { host, port } => {
            session.state = reg_state::REQ_SENT;
            session.local_key = rand::thread_rng().gen();
            session.addr = Some((host.clone(), *port));

            let mut doc = envelope(MSG_REG, REG_REQ);
            doc.insert("host".into(), json!(inner.config.host));
            doc.insert("port".into(), json!(inner.config.port));
            doc.insert("id".into(), json!(conn_id));
            doc.insert("key".into(), json!(session.local_key));
            doc.insert("version".into(), json!(ASKCOIN_VERSION));
            let _ = out_tx.send(Value::Object(doc));
        }
        ConnKind::Passive => {}
        ConnKind::VerifyDial { reg_conn_id } => {
            // init_verify: forward the registration nonce on the fresh
            // connection; the registration session moves to VERIFY_SENT.
            let mut directory = inner.directory.lock().unwrap();
            match directory.unreg.get_mut(reg_conn_id) {
                Some(reg_session) => {
                    let mut doc = envelope(MSG_REG, REG_VERIFY_REQ);
                    doc.insert("id".into(), json!(reg_session.reg_conn_id));
                    doc.insert("key".into(), json!(reg_session.remote_key));
                    reg_session.state = reg_state::VERIFY_SENT;
                    let _ = out_tx.send(Value::Object(doc));
                }
                None => {
                    debug!(conn_id, "registration session vanished before verify dial");
                    return;
                }
            }
        }
    }

    inner.directory.lock().unwrap().unreg.insert(conn_id, session);

    let writer = tokio::spawn(write_loop(write_half, out_rx));
    let reader = tokio::spawn(read_loop(read_half, in_tx));

    let mut registered = false;
    let mut ping_enabled = false;
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let idle = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(PeerCtrl::Promote { ping: do_ping }) => {
                    registered = true;
                    ping_enabled = do_ping;
                    idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);
                }
                Some(PeerCtrl::Close) | None => break,
            },
            inbound = in_rx.recv() => {
                let action = match inbound {
                    Some(Ok(doc)) => handle_frame(&inner, conn_id, doc),
                    Some(Err(err)) => {
                        // oversized or unparseable input from a registered
                        // peer is a protocol violation
                        if registered {
                            punish_conn(&inner, conn_id, &err);
                        }
                        Action::Close
                    }
                    None => Action::Close,
                };

                match action {
                    Action::Continue => {}
                    Action::ResetDeadline => {
                        idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);
                    }
                    Action::Close => break,
                }
            }
            _ = ping.tick(), if ping_enabled => {
                let _ = out_tx.send(Value::Object(envelope(MSG_SYS, SYS_PING)));
            }
            _ = &mut idle => {
                debug!(conn_id, "idle deadline expired");
                break;
            }
        }
    }

    reader.abort();
    writer.abort();
    cleanup_connection(&inner, conn_id);
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut out_rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(doc) = out_rx.recv().await {
        if let Err(err) = write_frame(&mut write_half, &doc).await {
            debug!(%err, "write failed, closing connection");
            break;
        }
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    in_tx: mpsc::UnboundedSender<Result<Value, NetError>>,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(doc) => {
                if in_tx.send(Ok(doc)).is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = in_tx.send(Err(err));
                break;
            }
        }
    }
}

/// Remove the session, debit the close and free its score entry.
fn cleanup_connection(inner: &Arc<NodeInner>, conn_id: u64) {
    let session = {
        let mut directory = inner.directory.lock().unwrap();
        directory
            .registered
            .remove(&conn_id)
            .or_else(|| directory.unreg.remove(&conn_id))
    };

    let Some(session) = session else { return };
    let key = session.key();

    if key.is_empty() {
        return;
    }

    debug!(peer = %key, conn_id, "connection closed");
    let mut scores = inner.scores.lock().unwrap();

    if let Some(entry) = scores.get(&key) {
        entry.state.store(peer_state::FREE, Ordering::Relaxed);
    }

    scores.adjust(&key, -1);
}

fn punish_conn(inner: &Arc<NodeInner>, conn_id: u64, err: &NetError) {
    let key = {
        let directory = inner.directory.lock().unwrap();
        directory.registered.get(&conn_id).map(|s| s.key())
    };

    if let Some(key) = key.filter(|k| !k.is_empty()) {
        warn!(peer = %key, %err, "protocol violation at the framing layer");
        let mut scores = inner.scores.lock().unwrap();
        scores.adjust(&key, -1000);
        scores.ban(&key, Instant::now());
    }
}

/// The dispatch entry point, run on the connection's own task.
fn handle_frame(inner: &Arc<NodeInner>, conn_id: u64, doc: Value) -> Action {
    let Some((msg_type, msg_cmd)) = type_and_cmd(&doc) else {
        return Action::Close;
    };

    let mut directory = inner.directory.lock().unwrap();

    if let Some(session) = directory.registered.get(&conn_id) {
        let passive = session.passive;
        let out_tx = session.out_tx.clone();
        let handle = session.handle();
        drop(directory);

        if msg_type != MSG_SYS {
            let _ = inner.events.send(NetworkEvent::PeerMessage { peer: handle, doc });
            return Action::Continue;
        }

        return match msg_cmd {
            SYS_PING if passive => {
                let _ = out_tx.send(Value::Object(envelope(MSG_SYS, SYS_PONG)));
                Action::ResetDeadline
            }
            SYS_PONG if !passive => Action::ResetDeadline,
            // a heartbeat flowing the wrong way
            _ => Action::Close,
        };
    }

    let Some(session) = directory.unreg.get(&conn_id) else {
        debug!(conn_id, "message for unknown connection");
        return Action::Close;
    };

    if msg_type != MSG_REG {
        debug!(conn_id, msg_type, "non-REG message from unregistered peer");
        return Action::Close;
    }

    let passive = session.passive;

    match (msg_cmd, passive) {
        (REG_RSP, false) => handle_reg_rsp(directory, conn_id, &doc),
        (REG_VERIFY_RSP, false) => handle_verify_rsp(inner, directory, conn_id, &doc),
        (REG_REQ, true) => handle_reg_req(inner, directory, conn_id, &doc),
        (REG_VERIFY_REQ, true) => handle_verify_req(inner, directory, conn_id, &doc),
        _ => Action::Close,
    }
}

fn get_u32(doc: &Value, field: &str) -> Option<u32> {
    doc.get(field)?.as_u64().filter(|&v| v <= u32::MAX as u64).map(|v| v as u32)
}

fn get_u64(doc: &Value, field: &str) -> Option<u64> {
    doc.get(field)?.as_u64()
}

/// REG_RSP on our outbound registration connection.
fn handle_reg_rsp(
    mut directory: std::sync::MutexGuard<'_, Directory>,
    conn_id: u64,
    doc: &Value,
) -> Action {
    let session = directory.unreg.get_mut(&conn_id).expect("checked by caller");

    if session.state != reg_state::REQ_SENT {
        debug!(conn_id, state = session.state, "REG_RSP in wrong state");
        return Action::Close;
    }

    let (Some(version), Some(id), Some(key)) = (
        get_u32(doc, "version"),
        get_u64(doc, "id"),
        get_u32(doc, "key"),
    ) else {
        return Action::Close;
    };

    if !version_compatible(version, ASKCOIN_VERSION) {
        debug!(conn_id, version, "incompatible peer version");
        return Action::Close;
    }

    session.remote_key = key;
    session.reg_conn_id = id;
    session.state = reg_state::RSP_RECEIVED;

    Action::Continue
}

/// REG_REQ on an accepted connection: answer, reserve the score entry and
/// dial the claimed address back for verification.
fn handle_reg_req(
    inner: &Arc<NodeInner>,
    mut directory: std::sync::MutexGuard<'_, Directory>,
    conn_id: u64,
    doc: &Value,
) -> Action {
    let session = directory.unreg.get_mut(&conn_id).expect("checked by caller");

    if session.state != reg_state::FRESH {
        debug!(conn_id, state = session.state, "REG_REQ in wrong state");
        return Action::Close;
    }

    let (Some(version), Some(id), Some(key), Some(host), Some(port)) = (
        get_u32(doc, "version"),
        get_u64(doc, "id"),
        get_u32(doc, "key"),
        doc.get("host").and_then(Value::as_str),
        get_u32(doc, "port").filter(|&p| p > 0 && p <= u16::MAX as u32),
    ) else {
        return Action::Close;
    };

    if !version_compatible(version, ASKCOIN_VERSION) {
        debug!(conn_id, version, "incompatible peer version");
        return Action::Close;
    }

    session.local_key = rand::thread_rng().gen();
    session.remote_key = key;
    session.reg_conn_id = id;
    session.addr = Some((host.to_string(), port as u16));
    let peer_key = session.key();
    let local_key = session.local_key;
    let out_tx = session.out_tx.clone();
    let ctrl_tx = session.ctrl_tx.clone();
    drop(directory);

    let entry = {
        let mut scores = inner.scores.lock().unwrap();

        if scores.is_banned(&peer_key, Instant::now()) {
            debug!(peer = %peer_key, "banned peer tried to register");
            return Action::Close;
        }

        scores.add_peer(host, port as u16);
        Arc::clone(scores.get(&peer_key).expect("just inserted"))
    };

    if entry
        .state
        .compare_exchange(
            peer_state::FREE,
            peer_state::RESERVED,
            Ordering::AcqRel,
            Ordering::Relaxed,
        )
        .is_err()
    {
        debug!(peer = %peer_key, "address already has a connection in flight");
        return Action::Close;
    }

    {
        let mut directory = inner.directory.lock().unwrap();
        if let Some(session) = directory.unreg.get_mut(&conn_id) {
            session.state = reg_state::RSP_SENT;
        }
    }

    let mut rsp = envelope(MSG_REG, REG_RSP);
    rsp.insert("id".into(), json!(conn_id));
    rsp.insert("key".into(), json!(local_key));
    rsp.insert("version".into(), json!(ASKCOIN_VERSION));
    let _ = out_tx.send(Value::Object(rsp));

    // dial the claimed address on a second connection to prove it
    let inner = Arc::clone(inner);
    let host = host.to_string();
    let port = port as u16;
    tokio::spawn(async move {
        let dial =
            tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port))).await;

        match dial {
            Ok(Ok(stream)) => {
                debug!(peer = %peer_key, "verify dial connected");
                run_connection(inner, stream, ConnKind::VerifyDial { reg_conn_id: conn_id }).await;
            }
            _ => {
                debug!(peer = %peer_key, "verify dial failed");
                let _ = ctrl_tx.send(PeerCtrl::Close);
                inner.scores.lock().unwrap().adjust(&peer_key, -100);
            }
        }
    });

    Action::Continue
}

/// REG_VERIFY_REQ arriving on the second connection: prove we issued the
/// original REG_REQ, promote the registration connection, answer the nonce.
fn handle_verify_req(
    inner: &Arc<NodeInner>,
    mut directory: std::sync::MutexGuard<'_, Directory>,
    conn_id: u64,
    doc: &Value,
) -> Action {
    // the verification connection itself must be untouched
    if directory.unreg.get(&conn_id).map(|s| s.state) != Some(reg_state::FRESH) {
        return Action::Close;
    }

    let (Some(id), Some(key)) = (get_u64(doc, "id"), get_u32(doc, "key")) else {
        return Action::Close;
    };

    let Some(reg_session) = directory.unreg.get(&id) else {
        debug!(id, "REG_VERIFY_REQ for unknown registration connection");
        return Action::Close;
    };

    if reg_session.state != reg_state::RSP_RECEIVED || key != reg_session.local_key {
        debug!(id, "REG_VERIFY_REQ nonce or state mismatch");
        return Action::Close;
    }

    let reg_session = directory.unreg.remove(&id).expect("present above");
    let remote_key = reg_session.remote_key;
    let reg_conn_id = reg_session.reg_conn_id;
    let peer_key = reg_session.key();
    // the registering side drives the heartbeat
    let _ = reg_session.ctrl_tx.send(PeerCtrl::Promote { ping: true });
    directory.registered.insert(id, reg_session);

    let out_tx = directory
        .unreg
        .get(&conn_id)
        .map(|s| s.out_tx.clone())
        .expect("checked by caller");
    drop(directory);

    info!(peer = %peer_key, "peer registered");

    {
        let mut scores = inner.scores.lock().unwrap();
        if let Some(entry) = scores.get(&peer_key) {
            entry.state.store(peer_state::CONNECTED, Ordering::Relaxed);
        }
    }

    let mut rsp = envelope(MSG_REG, REG_VERIFY_RSP);
    rsp.insert("key".into(), json!(remote_key));
    rsp.insert("id".into(), json!(reg_conn_id));
    let _ = out_tx.send(Value::Object(rsp));

    Action::Continue
}

/// REG_VERIFY_RSP on our verify dial: promote the registration connection
/// on this side and drop the verification connection.
fn handle_verify_rsp(
    inner: &Arc<NodeInner>,
    mut directory: std::sync::MutexGuard<'_, Directory>,
    conn_id: u64,
    doc: &Value,
) -> Action {
    // the verification connection itself must be untouched
    if directory.unreg.get(&conn_id).map(|s| s.state) != Some(reg_state::FRESH) {
        return Action::Close;
    }

    let (Some(id), Some(key)) = (get_u64(doc, "id"), get_u32(doc, "key")) else {
        return Action::Close;
    };

    let Some(reg_session) = directory.unreg.get(&id) else {
        debug!(id, "REG_VERIFY_RSP for unknown registration connection");
        return Action::Close;
    };

    if reg_session.state != reg_state::VERIFY_SENT || key != reg_session.local_key {
        debug!(id, "REG_VERIFY_RSP nonce or state mismatch");
        return Action::Close;
    }

    let reg_session = directory.unreg.remove(&id).expect("present above");
    let peer_key = reg_session.key();
    let _ = reg_session.ctrl_tx.send(PeerCtrl::Promote { ping: false });
    directory.registered.insert(id, reg_session);
    drop(directory);

    info!(peer = %peer_key, "peer registered");

    {
        let mut scores = inner.scores.lock().unwrap();
        if let Some(entry) = scores.get(&peer_key) {
            entry.state.store(peer_state::CONNECTED, Ordering::Relaxed);
        }
    }

    // verification connection has served its purpose
    Action::Close
}
