//! Connection hub
//!
//! The top-level orchestrator of the networking core: owns the listening
//! socket, the session map, per-IP connection counters, the outbound
//! connect queue and the recurring maintenance cycle. Sessions run as
//! tasks of one cancellable group so the whole hub fails and shuts down
//! atomically.

use crate::codec::{
    write_compact_size, ByteWriter, Message, MessageKind, MessagePayload, NetAddr, RejectCode,
    RejectMessage, Serializable, ServiceFlags, VersionMessage, HEADER_SIZE, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
use crate::network::config::HubConfig;
use crate::network::queue::ConnectQueue;
use crate::network::session::{
    ConnectionTarget, ConnectionType, SessionCommand, SessionEntry, SessionState, WireCodec,
};
use crate::network::NetError;
use crate::task::{TaskGroup, Worker};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Identifies one live session inside the hub's map
pub type SessionId = u64;

/// Most addresses returned for one `getaddr`
const MAX_GETADDR_RESPONSE: usize = 1_000;

/// State-change notifications pushed by the hub.
///
/// Listeners (metrics, logging) receive these over an explicit channel
/// handed out at construction; there is no implicit fan-out.
#[derive(Debug)]
pub enum HubEvent {
    SessionEstablished {
        id: SessionId,
        addr: SocketAddr,
        conn_type: ConnectionType,
        peer_version: u32,
        user_agent: String,
    },
    SessionClosed {
        id: SessionId,
        addr: SocketAddr,
        /// None for a clean local close, otherwise why the peer was dropped
        reason: Option<String>,
    },
    ConnectionRejected {
        addr: SocketAddr,
        why: &'static str,
    },
    TrafficUpdated {
        sessions: usize,
        total_bytes_in: u64,
        total_bytes_out: u64,
    },
}

/// Point-in-time counters for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub sessions: usize,
    pub established: usize,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub rejected_connections: u64,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<SessionId, SessionEntry>,
    per_ip: HashMap<IpAddr, usize>,
    next_session_id: SessionId,
    /// Bytes of sessions that have already closed
    drained_bytes_in: u64,
    drained_bytes_out: u64,
    rejected_connections: u64,
}

/// State shared between the hub, its session tasks and maintenance
struct HubShared {
    config: HubConfig,
    state: Mutex<HubState>,
    queue: ConnectQueue<ConnectionTarget>,
    events_tx: mpsc::UnboundedSender<HubEvent>,
}

impl HubShared {
    /// Admission control: global cap, per-IP cap, IPv4-only flag.
    ///
    /// Runs before any protocol bytes are exchanged. On success the session
    /// is registered and the per-IP counter incremented; a rejection only
    /// bumps a counter, capacity is never surfaced as an error.
    fn try_admit(
        &self,
        target: ConnectionTarget,
        cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    ) -> Result<SessionId, &'static str> {
        let ip = target.addr.ip();
        let mut st = self.state.lock().unwrap();
        let why = if self.config.ipv4_only && ip.is_ipv6() {
            Some("ipv6 peer with ipv4-only set")
        } else if st.sessions.len() >= self.config.max_connections {
            Some("connection cap reached")
        } else if st.per_ip.get(&ip).copied().unwrap_or(0) >= self.config.max_connections_per_ip {
            Some("per-ip cap reached")
        } else {
            None
        };
        if let Some(why) = why {
            st.rejected_connections += 1;
            return Err(why);
        }
        *st.per_ip.entry(ip).or_insert(0) += 1;
        let id = st.next_session_id;
        st.next_session_id += 1;
        st.sessions.insert(id, SessionEntry::new(target, cmd_tx));
        Ok(id)
    }

    /// Remove a session, decrement its per-IP counter, fold its traffic
    /// into the drained totals.
    fn release(&self, id: SessionId) -> Option<SessionEntry> {
        let mut st = self.state.lock().unwrap();
        let entry = st.sessions.remove(&id)?;
        let ip = entry.target.addr.ip();
        if let Some(count) = st.per_ip.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                st.per_ip.remove(&ip);
            }
        }
        st.drained_bytes_in += entry.bytes_in;
        st.drained_bytes_out += entry.bytes_out;
        Some(entry)
    }

    fn with_session<R>(&self, id: SessionId, f: impl FnOnce(&mut SessionEntry) -> R) -> Option<R> {
        self.state.lock().unwrap().sessions.get_mut(&id).map(f)
    }

    fn stats(&self) -> HubStats {
        let st = self.state.lock().unwrap();
        let mut total_in = st.drained_bytes_in;
        let mut total_out = st.drained_bytes_out;
        let mut established = 0;
        for entry in st.sessions.values() {
            total_in += entry.bytes_in;
            total_out += entry.bytes_out;
            if entry.state == SessionState::Established {
                established += 1;
            }
        }
        HubStats {
            sessions: st.sessions.len(),
            established,
            total_bytes_in: total_in,
            total_bytes_out: total_out,
            rejected_connections: st.rejected_connections,
        }
    }

    fn emit(&self, event: HubEvent) {
        // Nobody listening is fine
        let _ = self.events_tx.send(event);
    }
}

/// The connection hub.
///
/// Session-affecting mutations happen under one short-held lock, never
/// across a suspension point; acceptance and origination run as group
/// tasks so a stalled handshake cannot stall admission of other peers.
pub struct ConnectionHub {
    shared: Arc<HubShared>,
    group: TaskGroup,
    maintenance: Worker,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
}

impl ConnectionHub {
    /// Create a hub and the receiving end of its event channel
    pub fn new(config: HubConfig) -> (Self, mpsc::UnboundedReceiver<HubEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let capacity =
            NonZeroUsize::new(config.connect_queue_capacity.max(1)).expect("non-zero capacity");
        let hub = Self {
            shared: Arc::new(HubShared {
                config,
                state: Mutex::new(HubState::default()),
                queue: ConnectQueue::new(capacity),
                events_tx,
            }),
            group: TaskGroup::new(),
            maintenance: Worker::new("net-maintenance"),
            listener: None,
            local_addr: None,
        };
        (hub, events_rx)
    }

    /// Bind the listening socket; returns the actual local endpoint
    pub async fn bind(&mut self) -> Result<SocketAddr, NetError> {
        let listener = TcpListener::bind(self.shared.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("listening on {}", addr);
        self.listener = Some(listener);
        self.local_addr = Some(addr);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> HubStats {
        self.shared.stats()
    }

    /// Token cancelled by [`ConnectionHub::shutdown`]; external shutdown
    /// signals go through this single entry point.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.group.cancellation_token()
    }

    /// Cancel every session task and stop the hub
    pub fn shutdown(&self) {
        self.group.cancel();
    }

    /// Enqueue an outbound target; duplicates are refused.
    pub fn connect_to(&self, addr: SocketAddr, conn_type: ConnectionType) -> bool {
        if self.shared.config.ipv4_only && addr.ip().is_ipv6() {
            return false;
        }
        let pushed = self
            .shared
            .queue
            .push(ConnectionTarget::new(addr, conn_type));
        if pushed {
            self.maintenance.kick();
        }
        pushed
    }

    /// Drive the hub until shutdown: accept inbound connections, originate
    /// queued outbound ones, run the maintenance cycle.
    pub async fn run(&mut self) -> Result<(), NetError> {
        let listener = match self.listener.take() {
            Some(l) => l,
            None => {
                self.bind().await?;
                self.listener.take().expect("bound listener")
            }
        };

        for addr in self.shared.config.manual_peers.clone() {
            self.shared
                .queue
                .push(ConnectionTarget::new(addr, ConnectionType::ManualOutbound));
        }

        // Inbound acceptance and outbound connects both deliver streams here
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<(TcpStream, ConnectionTarget)>();

        let accept_tx = conn_tx.clone();
        self.group.spawn("accept", move |token| {
            accept_loop(listener, accept_tx, token)
        });

        // The maintenance timer runs on its own thread and forwards ticks
        // to the async driver below
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel::<()>();
        let interval = self.shared.config.maintenance_interval;
        self.maintenance.start(move |ctl| {
            while ctl.wait_for_kick(interval) {
                if tick_tx.send(()).is_err() {
                    break;
                }
            }
        });
        // Attempt manual peers without waiting a full interval
        self.maintenance.kick();

        let root = self.group.cancellation_token();
        loop {
            // Checked first so a pending connection never spawns into a
            // group that shutdown() has already closed
            tokio::select! {
                biased;
                _ = root.cancelled() => break,
                Some((stream, target)) = conn_rx.recv() => {
                    self.admit_connection(stream, target);
                }
                Some(()) = tick_rx.recv() => {
                    self.run_maintenance(&conn_tx);
                }
            }
        }

        log::info!("hub shutting down");
        self.maintenance.stop(true);
        self.group.wait().await
    }

    /// Run admission control on a fresh transport and either spawn its
    /// session task or drop it on the floor.
    fn admit_connection(&self, stream: TcpStream, target: ConnectionTarget) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        match self.shared.try_admit(target, cmd_tx) {
            Err(why) => {
                log::warn!("rejected {} ({}): {}", target.addr, kind_name(target), why);
                self.shared.emit(HubEvent::ConnectionRejected {
                    addr: target.addr,
                    why,
                });
                drop(stream);
            }
            Ok(id) => {
                log::info!(
                    "session #{} {} {}",
                    id,
                    if target.conn_type.is_outbound() { "to" } else { "from" },
                    target.addr
                );
                let shared = self.shared.clone();
                self.group.spawn(&format!("session-{id}"), move |token| {
                    session_task(shared, id, stream, target, token, cmd_rx)
                });
            }
        }
    }

    /// One maintenance cycle: originate queued targets, ping quiet
    /// sessions, drop idle or unresponsive ones, refresh traffic stats.
    fn run_maintenance(&self, conn_tx: &mpsc::UnboundedSender<(TcpStream, ConnectionTarget)>) {
        let config = &self.shared.config;
        let now = Instant::now();
        let mut commands: Vec<(mpsc::UnboundedSender<SessionCommand>, SessionCommand)> =
            Vec::new();
        let session_count;
        {
            let mut st = self.shared.state.lock().unwrap();
            for entry in st.sessions.values_mut() {
                if let Some(cmd) =
                    keepalive_command(entry, now, config.idle_timeout, config.ping_timeout)
                {
                    commands.push((entry.cmd_tx.clone(), cmd));
                }
            }
            session_count = st.sessions.len();
        }
        for (tx, cmd) in commands {
            // A session that already exited is fine
            let _ = tx.send(cmd);
        }

        let stats = self.shared.stats();
        self.shared.emit(HubEvent::TrafficUpdated {
            sessions: stats.sessions,
            total_bytes_in: stats.total_bytes_in,
            total_bytes_out: stats.total_bytes_out,
        });

        // Originate pending outbound targets, up to the free capacity
        let free = config.max_connections.saturating_sub(session_count);
        for _ in 0..free {
            let Some(target) = self.shared.queue.pop() else {
                break;
            };
            if config.ipv4_only && target.addr.ip().is_ipv6() {
                continue;
            }
            let shared = self.shared.clone();
            let conn_tx = conn_tx.clone();
            self.group
                .spawn(&format!("connect-{}", target.addr), move |token| {
                    connect_task(shared, target, conn_tx, token)
                });
        }
    }
}

/// Keepalive decision for one session, pure over the entry and the clock.
///
/// Quiet for half the idle window: ping. An outstanding ping unanswered
/// past the ping timeout, or no traffic at all for the full idle window:
/// disconnect. Only established sessions are considered.
fn keepalive_command(
    entry: &mut SessionEntry,
    now: Instant,
    idle_timeout: Duration,
    ping_timeout: Duration,
) -> Option<SessionCommand> {
    if entry.state != SessionState::Established {
        return None;
    }
    if let Some((_, sent_at)) = entry.outstanding_ping {
        if now.duration_since(sent_at) >= ping_timeout {
            entry.state = SessionState::Closing;
            return Some(SessionCommand::Disconnect("ping timeout"));
        }
        return None;
    }
    if entry.idle_for(now) >= idle_timeout {
        entry.state = SessionState::Closing;
        return Some(SessionCommand::Disconnect("idle"));
    }
    if entry.idle_for(now) >= idle_timeout / 2 {
        let nonce = rand::random();
        entry.outstanding_ping = Some((nonce, now));
        return Some(SessionCommand::SendPing(nonce));
    }
    None
}

fn kind_name(target: ConnectionTarget) -> &'static str {
    match target.conn_type {
        ConnectionType::Inbound => "inbound",
        ConnectionType::Outbound => "outbound",
        ConnectionType::ManualOutbound => "manual",
        ConnectionType::SeedOutbound => "seed",
    }
}

// =============================================================================
// Hub tasks
// =============================================================================

async fn accept_loop(
    listener: TcpListener,
    conn_tx: mpsc::UnboundedSender<(TcpStream, ConnectionTarget)>,
    token: CancellationToken,
) -> Result<(), NetError> {
    loop {
        tokio::select! {
            _ = token.cancelled() => return Err(NetError::Cancelled),
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    log::debug!("incoming connection from {}", addr);
                    let target = ConnectionTarget::new(addr, ConnectionType::Inbound);
                    if conn_tx.send((stream, target)).is_err() {
                        return Err(NetError::Cancelled);
                    }
                }
                Err(e) => {
                    // Transient (fd exhaustion, aborted handshake); keep going
                    log::error!("accept error: {}", e);
                }
            }
        }
    }
}

async fn connect_task(
    shared: Arc<HubShared>,
    target: ConnectionTarget,
    conn_tx: mpsc::UnboundedSender<(TcpStream, ConnectionTarget)>,
    token: CancellationToken,
) -> Result<(), NetError> {
    let attempt = tokio::time::timeout(
        shared.config.handshake_timeout,
        TcpStream::connect(target.addr),
    );
    let result = tokio::select! {
        _ = token.cancelled() => return Err(NetError::Cancelled),
        r = attempt => r,
    };
    match result {
        Ok(Ok(stream)) => {
            let _ = conn_tx.send((stream, target));
        }
        Ok(Err(e)) => log::debug!("connect to {} failed: {}", target.addr, e),
        Err(_) => log::debug!("connect to {} timed out", target.addr),
    }
    // A failed origination is not fatal to the hub
    Ok(())
}

/// Holds one admitted session's map entry; releasing runs on drop, so the
/// slot and its per-IP count are reclaimed even when the session body
/// unwinds by panic instead of returning.
struct SessionSlot {
    shared: Arc<HubShared>,
    id: SessionId,
    addr: SocketAddr,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        // No-op when the session already released and reported normally
        if self.shared.release(self.id).is_some() {
            log::warn!("session #{} ({}) aborted", self.id, self.addr);
            self.shared.emit(HubEvent::SessionClosed {
                id: self.id,
                addr: self.addr,
                reason: Some("session aborted".to_string()),
            });
        }
    }
}

/// Wrapper around the session body: whatever happens inside, the session
/// releases its map entry and reports, and protocol errors never unwind
/// into the task group.
async fn session_task(
    shared: Arc<HubShared>,
    id: SessionId,
    stream: TcpStream,
    target: ConnectionTarget,
    token: CancellationToken,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
) -> Result<(), NetError> {
    let _slot = SessionSlot {
        shared: shared.clone(),
        id,
        addr: target.addr,
    };
    let outcome = run_session(&shared, id, stream, target, &token, &mut cmd_rx).await;
    shared.release(id);

    let reason = match &outcome {
        Ok(()) => None,
        Err(NetError::Cancelled) => Some("shutdown".to_string()),
        Err(e) => Some(e.to_string()),
    };
    match &reason {
        None => log::info!("session #{} ({}) closed", id, target.addr),
        Some(why) => log::warn!("session #{} ({}) dropped: {}", id, target.addr, why),
    }
    shared.emit(HubEvent::SessionClosed {
        id,
        addr: target.addr,
        reason,
    });

    match outcome {
        // Cooperative unwinding must stay visible to the group
        Err(NetError::Cancelled) => Err(NetError::Cancelled),
        // Everything else is local and recoverable: the peer is gone,
        // the hub lives on
        _ => Ok(()),
    }
}

async fn run_session(
    shared: &Arc<HubShared>,
    id: SessionId,
    stream: TcpStream,
    target: ConnectionTarget,
    token: &CancellationToken,
    cmd_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
) -> Result<(), NetError> {
    let config = &shared.config;
    let mut framed = Framed::new(stream, WireCodec::new(config.magic));
    shared.with_session(id, |e| e.state = SessionState::Handshaking);

    if target.conn_type.is_outbound() {
        send_message(&mut framed, shared, id, build_version(config, target.addr)).await?;
    }

    // Version/verack exchange under the handshake timeout
    let mut got_version = false;
    let mut got_verack = false;
    let deadline = tokio::time::sleep(config.handshake_timeout);
    tokio::pin!(deadline);
    while !(got_version && got_verack) {
        tokio::select! {
            _ = token.cancelled() => return Err(NetError::Cancelled),
            _ = &mut deadline => return Err(NetError::HandshakeTimeout),
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Disconnect(why)) => {
                    log::debug!("session #{} disconnect during handshake: {}", id, why);
                    return Ok(());
                }
                Some(SessionCommand::SendPing(_)) | None => {}
            },
            frame = framed.next() => {
                let msg = match frame {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(msg)) => msg,
                };
                let wire_len = HEADER_SIZE + msg.payload().len();
                let within_budget = shared
                    .with_session(id, |e| e.record_recv(wire_len))
                    .unwrap_or(false);
                if !within_budget {
                    return Err(NetError::FloodingDetected);
                }
                match msg.decode_payload()? {
                    MessagePayload::Version(version) => {
                        if got_version {
                            return Err(NetError::DuplicateHandshake);
                        }
                        if version.nonce == config.nonce {
                            return Err(NetError::ConnectedToSelf);
                        }
                        if version.version < MIN_PROTOCOL_VERSION {
                            return Err(NetError::InvalidHandshake);
                        }
                        got_version = true;
                        framed.codec_mut().protocol_version =
                            Some(version.version.min(PROTOCOL_VERSION));
                        shared.with_session(id, |e| {
                            e.peer_version = Some(version.version);
                            e.user_agent = version.user_agent.clone();
                        });
                        if !target.conn_type.is_outbound() {
                            send_message(&mut framed, shared, id, build_version(config, target.addr))
                                .await?;
                        }
                        send_message(
                            &mut framed,
                            shared,
                            id,
                            Message::build(config.magic, MessageKind::VerAck, Vec::new()),
                        )
                        .await?;
                    }
                    MessagePayload::VerAck => {
                        if !got_version && !target.conn_type.is_outbound() {
                            // Acking a version we never sent
                            return Err(NetError::InvalidHandshake);
                        }
                        got_verack = true;
                    }
                    // No other protocol traffic before the handshake is done
                    _ => return Err(NetError::InvalidHandshake),
                }
            }
        }
    }

    let (user_agent, peer_version) = shared
        .with_session(id, |e| {
            e.state = SessionState::Established;
            (e.user_agent.clone(), e.peer_version.unwrap_or(0))
        })
        .unwrap_or_default();
    log::info!(
        "session #{} established with {} ({}, protocol {})",
        id,
        target.addr,
        user_agent,
        peer_version
    );
    shared.emit(HubEvent::SessionEstablished {
        id,
        addr: target.addr,
        conn_type: target.conn_type,
        peer_version,
        user_agent,
    });

    if target.conn_type.is_outbound() {
        send_message(
            &mut framed,
            shared,
            id,
            Message::build(config.magic, MessageKind::GetAddr, Vec::new()),
        )
        .await?;
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => return Err(NetError::Cancelled),
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::SendPing(nonce)) => {
                    send_message(
                        &mut framed,
                        shared,
                        id,
                        Message::build(config.magic, MessageKind::Ping, nonce.to_bytes()),
                    )
                    .await?;
                }
                Some(SessionCommand::Disconnect(why)) => {
                    log::debug!("session #{} disconnecting: {}", id, why);
                    return Ok(());
                }
                None => return Ok(()),
            },
            frame = framed.next() => {
                let msg = match frame {
                    None => return Ok(()),
                    Some(Err(NetError::Reject(reason))) => {
                        // Tell the peer why before dropping it; best effort
                        let reject = build_reject("", RejectCode::Malformed, &reason.to_string(), config.magic);
                        let _ = framed.send(reject).await;
                        return Err(NetError::Reject(reason));
                    }
                    Some(Err(e)) => return Err(e),
                    Some(Ok(msg)) => msg,
                };
                handle_established(shared, id, &mut framed, target, msg).await?;
            }
        }
    }
}

async fn handle_established(
    shared: &Arc<HubShared>,
    id: SessionId,
    framed: &mut Framed<TcpStream, WireCodec>,
    target: ConnectionTarget,
    msg: Message,
) -> Result<(), NetError> {
    let config = &shared.config;
    let wire_len = HEADER_SIZE + msg.payload().len();
    let within_budget = shared
        .with_session(id, |e| e.record_recv(wire_len))
        .unwrap_or(false);
    if !within_budget {
        return Err(NetError::FloodingDetected);
    }

    let payload = match msg.decode_payload() {
        Ok(payload) => payload,
        Err(reason) => {
            let reject = build_reject(
                msg.kind().label(),
                RejectCode::Malformed,
                &reason.to_string(),
                config.magic,
            );
            let _ = framed.send(reject).await;
            return Err(NetError::Reject(reason));
        }
    };

    match payload {
        MessagePayload::Version(_) => return Err(NetError::DuplicateHandshake),
        // A repeated verack is harmless
        MessagePayload::VerAck => {}
        MessagePayload::Ping(nonce) => {
            send_message(
                framed,
                shared,
                id,
                Message::build(config.magic, MessageKind::Pong, nonce.to_bytes()),
            )
            .await?;
        }
        MessagePayload::Pong(nonce) => {
            let outstanding =
                shared.with_session(id, |e| e.outstanding_ping.take()).flatten();
            match outstanding {
                None => return Err(NetError::UnsolicitedPong),
                Some((expected, _)) if expected != nonce => {
                    return Err(NetError::InvalidPingPongNonce)
                }
                Some(_) => {}
            }
        }
        MessagePayload::Addr(addrs) => {
            let mut queued = 0;
            for addr in &addrs {
                let sock = addr.socket_addr();
                if config.ipv4_only && sock.ip().is_ipv6() {
                    continue;
                }
                if shared
                    .queue
                    .push(ConnectionTarget::new(sock, ConnectionType::Outbound))
                {
                    queued += 1;
                }
            }
            log::debug!(
                "session #{}: {} addresses relayed, {} queued",
                id,
                addrs.len(),
                queued
            );
        }
        MessagePayload::GetAddr => {
            if let Some(response) = build_addr_response(shared, target.addr) {
                send_message(framed, shared, id, response).await?;
            }
        }
        MessagePayload::Inv(items) => {
            log::debug!("session #{}: inv with {} items", id, items.len());
        }
        MessagePayload::GetData(items) => {
            log::debug!("session #{}: getdata for {} items", id, items.len());
        }
        MessagePayload::GetHeaders(_) | MessagePayload::Headers(_) | MessagePayload::MemPool => {
            // Consumed by the sync layer, not the hub
            log::trace!("session #{}: {} passed through", id, msg.kind().label());
        }
        MessagePayload::Reject(reject) => {
            log::warn!(
                "session #{}: peer rejected {:?} ({:?}): {}",
                id,
                reject.message,
                reject.code,
                reject.reason
            );
        }
    }
    Ok(())
}

// =============================================================================
// Message builders
// =============================================================================

async fn send_message(
    framed: &mut Framed<TcpStream, WireCodec>,
    shared: &Arc<HubShared>,
    id: SessionId,
    msg: Message,
) -> Result<(), NetError> {
    let wire_len = HEADER_SIZE + msg.payload().len();
    framed.send(msg).await?;
    shared.with_session(id, |e| e.record_send(wire_len));
    Ok(())
}

fn build_version(config: &HubConfig, peer: SocketAddr) -> Message {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let version = VersionMessage {
        version: PROTOCOL_VERSION,
        services: config.services.bits(),
        timestamp,
        addr_recv: NetAddr::from_socket_addr(peer, 0, ServiceFlags::empty()),
        addr_from: NetAddr::from_socket_addr(config.listen_addr, 0, config.services),
        nonce: config.nonce,
        user_agent: config.user_agent.clone(),
        start_height: config.start_height,
        relay: true,
    };
    Message::build(config.magic, MessageKind::Version, version.to_bytes())
}

fn build_reject(command: &str, code: RejectCode, reason: &str, magic: [u8; 4]) -> Message {
    let mut reason = reason.to_string();
    if reason.len() > 111 {
        let mut cut = 111;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    let reject = RejectMessage {
        message: command.to_string(),
        code,
        reason,
    };
    Message::build(magic, MessageKind::Reject, reject.to_bytes())
}

/// Answer a `getaddr` with the endpoints of currently-established
/// sessions, excluding the requester. None when there is nothing to say
/// (an empty addr vector is not a valid wire message).
fn build_addr_response(shared: &Arc<HubShared>, requester: SocketAddr) -> Option<Message> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let addrs: Vec<NetAddr> = {
        let st = shared.state.lock().unwrap();
        st.sessions
            .values()
            .filter(|e| e.state == SessionState::Established && e.target.addr != requester)
            .take(MAX_GETADDR_RESPONSE)
            .map(|e| NetAddr::from_socket_addr(e.target.addr, now, ServiceFlags::NODE_NETWORK))
            .collect()
    };
    if addrs.is_empty() {
        return None;
    }
    let mut w = ByteWriter::new();
    write_compact_size(&mut w, addrs.len() as u64);
    for addr in &addrs {
        addr.serialize(&mut w);
    }
    Some(Message::build(
        shared.config.magic,
        MessageKind::Addr,
        w.into_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MAGIC;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::{sleep, timeout};

    fn test_config() -> HubConfig {
        HubConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: 8,
            max_connections_per_ip: 1,
            handshake_timeout: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(60),
            ..HubConfig::default()
        }
    }

    fn target(addr: &str) -> ConnectionTarget {
        ConnectionTarget::new(addr.parse().unwrap(), ConnectionType::Inbound)
    }

    fn cmd_tx() -> mpsc::UnboundedSender<SessionCommand> {
        mpsc::unbounded_channel().0
    }

    fn peer_version_msg(nonce: u64) -> Message {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let version = VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK.bits(),
            timestamp: 0,
            addr_recv: NetAddr::from_socket_addr(local, 0, ServiceFlags::empty()),
            addr_from: NetAddr::from_socket_addr(local, 0, ServiceFlags::NODE_NETWORK),
            nonce,
            user_agent: "/peer:0.1.0/".to_string(),
            start_height: 0,
            relay: true,
        };
        Message::build(MAGIC, MessageKind::Version, version.to_bytes())
    }

    /// Connect a bare wire-speaking peer and walk it through the
    /// version/verack exchange with the hub at `addr`.
    async fn establish_raw_peer(addr: SocketAddr, nonce: u64) -> Framed<TcpStream, WireCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, WireCodec::new(MAGIC));
        framed.send(peer_version_msg(nonce)).await.unwrap();
        framed
            .send(Message::build(MAGIC, MessageKind::VerAck, Vec::new()))
            .await
            .unwrap();
        // The hub answers with its own version, then verack
        loop {
            let msg = framed.next().await.expect("stream open").expect("valid frame");
            if msg.kind() == MessageKind::VerAck {
                return framed;
            }
        }
    }

    async fn next_close_reason(events: &mut mpsc::UnboundedReceiver<HubEvent>) -> String {
        timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await.expect("event stream") {
                    HubEvent::SessionClosed { reason: Some(reason), .. } => return reason,
                    _ => continue,
                }
            }
        })
        .await
        .expect("session closes with a reason")
    }

    #[test]
    fn test_per_ip_cap_at_admission() {
        let (hub, _events) = ConnectionHub::new(test_config());
        let first = hub
            .shared
            .try_admit(target("10.1.1.1:1000"), cmd_tx())
            .unwrap();
        // Same IP, different port: still over the per-IP cap
        assert!(hub.shared.try_admit(target("10.1.1.1:2000"), cmd_tx()).is_err());
        // A different IP is fine
        hub.shared
            .try_admit(target("10.1.1.2:1000"), cmd_tx())
            .unwrap();

        // Releasing the first slot frees the IP again
        assert!(hub.shared.release(first).is_some());
        hub.shared
            .try_admit(target("10.1.1.1:3000"), cmd_tx())
            .unwrap();
        assert_eq!(hub.stats().rejected_connections, 1);
    }

    #[test]
    fn test_global_cap_at_admission() {
        let mut config = test_config();
        config.max_connections = 2;
        config.max_connections_per_ip = 8;
        let (hub, _events) = ConnectionHub::new(config);
        hub.shared.try_admit(target("10.0.0.1:1000"), cmd_tx()).unwrap();
        hub.shared.try_admit(target("10.0.0.1:2000"), cmd_tx()).unwrap();
        assert!(hub.shared.try_admit(target("10.0.0.1:3000"), cmd_tx()).is_err());
        assert_eq!(hub.stats().sessions, 2);
    }

    #[test]
    fn test_ipv4_only_rejects_ipv6() {
        let mut config = test_config();
        config.ipv4_only = true;
        let (hub, _events) = ConnectionHub::new(config);
        assert!(hub.shared.try_admit(target("[::1]:1000"), cmd_tx()).is_err());
        assert!(!hub.connect_to("[::1]:1000".parse().unwrap(), ConnectionType::Outbound));
    }

    #[tokio::test]
    async fn test_second_inbound_from_same_ip_is_dropped() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (mut hub, _events) = ConnectionHub::new(test_config());
        let addr = hub.bind().await.unwrap();
        let shutdown = hub.shutdown_handle();
        let driver = tokio::spawn(async move { hub.run().await });

        let _first = TcpStream::connect(addr).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        // Over the per-IP cap: closed before any protocol bytes
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .expect("hub should close the capped connection")
            .unwrap();
        assert_eq!(n, 0);

        // Releasing the first admits a new one from the same IP
        drop(_first);
        sleep(Duration::from_millis(200)).await;
        let mut third = TcpStream::connect(addr).await.unwrap();
        let read_again = timeout(Duration::from_millis(300), third.read(&mut buf)).await;
        // Still open: the read times out instead of returning EOF
        assert!(read_again.is_err());

        shutdown.cancel();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_loopback_sessions_complete_handshake() {
        let _ = env_logger::builder().is_test(true).try_init();

        // Server hub
        let mut server_config = test_config();
        server_config.max_connections_per_ip = 4;
        let (mut server, mut server_events) = ConnectionHub::new(server_config);
        let server_addr = server.bind().await.unwrap();
        let server_shutdown = server.shutdown_handle();
        let server_driver = tokio::spawn(async move { server.run().await });

        // Client hub connecting out to the server
        let mut client_config = test_config();
        client_config.max_connections_per_ip = 4;
        client_config.maintenance_interval = Duration::from_millis(50);
        let (mut client, mut client_events) = ConnectionHub::new(client_config);
        client.bind().await.unwrap();
        assert!(client.connect_to(server_addr, ConnectionType::ManualOutbound));
        let client_shutdown = client.shutdown_handle();
        let client_driver = tokio::spawn(async move { client.run().await });

        let established = timeout(Duration::from_secs(10), async {
            loop {
                match client_events.recv().await.expect("client event stream") {
                    HubEvent::SessionEstablished { addr, conn_type, .. } => {
                        return (addr, conn_type)
                    }
                    _ => continue,
                }
            }
        })
        .await
        .expect("client session establishes");
        assert_eq!(established.0, server_addr);
        assert_eq!(established.1, ConnectionType::ManualOutbound);

        let server_side = timeout(Duration::from_secs(10), async {
            loop {
                match server_events.recv().await.expect("server event stream") {
                    HubEvent::SessionEstablished {
                        conn_type,
                        peer_version,
                        user_agent,
                        ..
                    } => return (conn_type, peer_version, user_agent),
                    _ => continue,
                }
            }
        })
        .await
        .expect("server session establishes");
        assert_eq!(server_side.0, ConnectionType::Inbound);
        assert_eq!(server_side.1, PROTOCOL_VERSION);
        assert!(server_side.2.starts_with("/mini-node:"));

        client_shutdown.cancel();
        server_shutdown.cancel();
        client_driver.await.unwrap().unwrap();
        server_driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_self_connection_detected() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = test_config();
        config.max_connections_per_ip = 4;
        config.maintenance_interval = Duration::from_millis(50);
        let (mut hub, mut events) = ConnectionHub::new(config);
        let addr = hub.bind().await.unwrap();
        let shutdown = hub.shutdown_handle();
        // Connect the hub to its own listening socket
        assert!(hub.connect_to(addr, ConnectionType::Outbound));
        let driver = tokio::spawn(async move { hub.run().await });

        let reason = timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await.expect("event stream") {
                    HubEvent::SessionClosed { reason: Some(reason), .. } => return reason,
                    _ => continue,
                }
            }
        })
        .await
        .expect("self-connection is closed");
        assert!(reason.contains("self"), "unexpected reason: {reason}");

        shutdown.cancel();
        driver.await.unwrap().unwrap();
    }

    #[test]
    fn test_aborted_session_releases_slot() {
        let (hub, mut events) = ConnectionHub::new(test_config());
        let addr: SocketAddr = "10.9.9.9:1000".parse().unwrap();
        let id = hub.shared.try_admit(target("10.9.9.9:1000"), cmd_tx()).unwrap();
        assert_eq!(hub.stats().sessions, 1);

        // A session body that unwinds never reaches its normal release;
        // the slot guard must reclaim the entry and the per-IP count
        drop(SessionSlot {
            shared: hub.shared.clone(),
            id,
            addr,
        });
        assert_eq!(hub.stats().sessions, 0);
        match events.try_recv() {
            Ok(HubEvent::SessionClosed { id: closed, reason: Some(reason), .. }) => {
                assert_eq!(closed, id);
                assert!(reason.contains("aborted"), "unexpected reason: {reason}");
            }
            other => panic!("expected a close event, got {:?}", other),
        }
        // The IP is admittable again
        hub.shared.try_admit(target("10.9.9.9:2000"), cmd_tx()).unwrap();

        // After a normal release the guard stays quiet
        let id = hub.shared.try_admit(target("10.9.9.8:1000"), cmd_tx()).unwrap();
        hub.shared.release(id);
        drop(SessionSlot {
            shared: hub.shared.clone(),
            id,
            addr: "10.9.9.8:1000".parse().unwrap(),
        });
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_keepalive_decisions() {
        let idle = Duration::from_secs(600);
        let ping_to = Duration::from_secs(60);
        let mut entry = SessionEntry::new(target("10.4.4.4:1000"), cmd_tx());
        let start = entry.last_activity;

        // Not yet established: left alone no matter how stale
        assert!(keepalive_command(&mut entry, start + idle, idle, ping_to).is_none());

        entry.state = SessionState::Established;
        // Fresh traffic: nothing to do
        assert!(keepalive_command(&mut entry, start, idle, ping_to).is_none());

        // Quiet for half the idle window: a ping goes out
        let cmd = keepalive_command(&mut entry, start + idle / 2, idle, ping_to);
        assert!(matches!(cmd, Some(SessionCommand::SendPing(_))));
        let (_, sent_at) = entry.outstanding_ping.expect("ping recorded as outstanding");

        // Outstanding but within the ping timeout: wait
        assert!(keepalive_command(&mut entry, sent_at + ping_to / 2, idle, ping_to).is_none());

        // Unanswered past the ping timeout: disconnect
        match keepalive_command(&mut entry, sent_at + ping_to, idle, ping_to) {
            Some(SessionCommand::Disconnect(why)) => assert_eq!(why, "ping timeout"),
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(entry.state, SessionState::Closing);

        // No ping outstanding and quiet for the full window: dropped outright
        let mut entry = SessionEntry::new(target("10.4.4.5:1000"), cmd_tx());
        entry.state = SessionState::Established;
        let start = entry.last_activity;
        match keepalive_command(&mut entry, start + idle, idle, ping_to) {
            Some(SessionCommand::Disconnect(why)) => assert_eq!(why, "idle"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsolicited_pong_disconnects() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = test_config();
        config.max_connections_per_ip = 4;
        let (mut hub, mut events) = ConnectionHub::new(config);
        let addr = hub.bind().await.unwrap();
        let shutdown = hub.shutdown_handle();
        let driver = tokio::spawn(async move { hub.run().await });

        let mut peer = establish_raw_peer(addr, 7).await;
        peer.send(Message::build(MAGIC, MessageKind::Pong, 9u64.to_bytes()))
            .await
            .unwrap();

        let reason = next_close_reason(&mut events).await;
        assert!(reason.contains("pong"), "unexpected reason: {reason}");

        shutdown.cancel();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_version_after_establishment() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = test_config();
        config.max_connections_per_ip = 4;
        let (mut hub, mut events) = ConnectionHub::new(config);
        let addr = hub.bind().await.unwrap();
        let shutdown = hub.shutdown_handle();
        let driver = tokio::spawn(async move { hub.run().await });

        let mut peer = establish_raw_peer(addr, 8).await;
        peer.send(peer_version_msg(8)).await.unwrap();

        let reason = next_close_reason(&mut events).await;
        assert!(reason.contains("duplicate"), "unexpected reason: {reason}");

        shutdown.cancel();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout_disconnects() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = test_config();
        config.max_connections_per_ip = 4;
        config.handshake_timeout = Duration::from_millis(200);
        let (mut hub, mut events) = ConnectionHub::new(config);
        let addr = hub.bind().await.unwrap();
        let shutdown = hub.shutdown_handle();
        let driver = tokio::spawn(async move { hub.run().await });

        // Connect and say nothing
        let _peer = TcpStream::connect(addr).await.unwrap();

        let reason = next_close_reason(&mut events).await;
        assert!(reason.contains("timed out"), "unexpected reason: {reason}");

        shutdown.cancel();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pong_nonce_mismatch_disconnects() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = test_config();
        config.max_connections_per_ip = 4;
        config.idle_timeout = Duration::from_millis(400);
        config.ping_timeout = Duration::from_secs(30);
        config.maintenance_interval = Duration::from_millis(50);
        let (mut hub, mut events) = ConnectionHub::new(config);
        let addr = hub.bind().await.unwrap();
        let shutdown = hub.shutdown_handle();
        let driver = tokio::spawn(async move { hub.run().await });

        let mut peer = establish_raw_peer(addr, 11).await;

        // Stay quiet until the keepalive ping arrives, then echo the
        // wrong nonce back
        let ping_nonce = timeout(Duration::from_secs(10), async {
            loop {
                let msg = peer.next().await.expect("stream open").expect("valid frame");
                if let Ok(MessagePayload::Ping(nonce)) = msg.decode_payload() {
                    return nonce;
                }
            }
        })
        .await
        .expect("keepalive ping arrives");
        peer.send(Message::build(
            MAGIC,
            MessageKind::Pong,
            (ping_nonce ^ 1).to_bytes(),
        ))
        .await
        .unwrap();

        let reason = next_close_reason(&mut events).await;
        assert!(reason.contains("nonce"), "unexpected reason: {reason}");

        shutdown.cancel();
        driver.await.unwrap().unwrap();
    }
}
