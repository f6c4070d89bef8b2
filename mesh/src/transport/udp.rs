//! UDP gossip membership
//!
//! Each node gossips every `gossip_interval` to a few random peers. A gossip
//! packet carries a heartbeat digest (own entry first, then a sample of known
//! members) and as many queued broadcasts as fit the packet. A peer whose
//! heartbeat has not advanced for `dead_timeout` is declared gone.
//!
//! Joining and full state exchange run over TCP on the same port with
//! length-prefixed bincode frames.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{lookup_host, TcpListener, TcpStream, UdpSocket},
    sync::{watch, Notify},
    task::JoinHandle,
    time::{interval, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use super::{random_subset, DEFAULT_PACKET_SIZE};
use crate::{
    error::MembershipError,
    membership::{
        Delegate, EventDelegate, MembershipFactory, MembershipProvider, Node, ProviderConfig,
    },
};

/// Bincode length prefix for each piggybacked payload.
const MESSAGE_OVERHEAD: usize = 8;
/// Members sampled into each gossip digest besides the sender.
const DIGEST_SAMPLE: usize = 8;
/// Upper bound on a TCP frame.
const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub dead_timeout: Duration,
    pub udp_buffer_size: usize,
    pub tcp_timeout: Duration,
    /// Periodic full state exchange with a random peer. Off when `None`.
    pub push_pull_interval: Option<Duration>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            dead_timeout: Duration::from_secs(5),
            udp_buffer_size: DEFAULT_PACKET_SIZE,
            tcp_timeout: Duration::from_secs(10),
            push_pull_interval: None,
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Digest {
    node: Node,
    heartbeat: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Packet {
    Gossip {
        from: Node,
        members: Vec<Digest>,
        messages: Vec<Vec<u8>>,
    },
    Leave {
        node: Node,
        seq: u64,
    },
    LeaveAck {
        seq: u64,
        from: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct JoinRequest {
    node: Node,
    join: bool,
    state: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JoinResponse {
    members: Vec<Node>,
    state: Vec<u8>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MembershipError> {
    bincode::serialize(value).map_err(|e| MembershipError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MembershipError> {
    bincode::deserialize(bytes).map_err(|e| MembershipError::Decode(e.to_string()))
}

async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), MembershipError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(value)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(MembershipError::Encode(format!(
            "frame of {} bytes exceeds {MAX_FRAME_SIZE}",
            bytes.len()
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R, T>(reader: &mut R) -> Result<T, MembershipError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(MembershipError::Decode(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_SIZE}"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    decode(&buf)
}

// ============================================================================
// Factory
// ============================================================================

/// Creates [`UdpMembership`] providers.
#[derive(Debug, Clone, Default)]
pub struct UdpTransport {
    config: UdpConfig,
}

impl UdpTransport {
    pub fn new(config: UdpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MembershipFactory for UdpTransport {
    async fn create(
        &self,
        config: ProviderConfig,
    ) -> Result<Arc<dyn MembershipProvider>, MembershipError> {
        let provider = UdpMembership::bind(config, self.config.clone()).await?;
        Ok(Arc::new(provider))
    }
}

// ============================================================================
// Provider
// ============================================================================

struct Peer {
    node: Node,
    heartbeat: u64,
    last_seen: Instant,
}

struct PendingLeave {
    seq: u64,
    waiting: HashSet<String>,
}

struct Shared {
    local: Node,
    config: UdpConfig,
    socket: UdpSocket,
    events: Arc<dyn EventDelegate>,
    delegate: Arc<dyn Delegate>,
    heartbeat: AtomicU64,
    peers: RwLock<HashMap<String, Peer>>,
    /// Recently departed members and when they went away.
    departed: Mutex<HashMap<String, Instant>>,
    leaving: AtomicBool,
    leave_seq: AtomicU64,
    pending_leave: Mutex<Option<PendingLeave>>,
    leave_acked: Notify,
    span: Span,
}

/// Gossip membership over UDP, with TCP for join and push/pull.
pub struct UdpMembership {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpMembership {
    /// Bind UDP and TCP on the node's address and start background tasks.
    /// Port 0 picks a free UDP port, and TCP binds the same one.
    pub async fn bind(config: ProviderConfig, udp: UdpConfig) -> Result<Self, MembershipError> {
        let ProviderConfig {
            node,
            events,
            delegate,
        } = config;

        let requested = node.socket_addr()?;
        let socket = UdpSocket::bind(requested)
            .await
            .map_err(|source| MembershipError::Bind {
                addr: requested.to_string(),
                source,
            })?;
        let bound = socket.local_addr()?;
        let listener = TcpListener::bind(bound)
            .await
            .map_err(|source| MembershipError::Bind {
                addr: bound.to_string(),
                source,
            })?;

        let local = Node::new(node.name, node.address, bound.port());
        let span = info_span!("udp_membership", node = %local.name, addr = %bound);

        let shared = Arc::new(Shared {
            local: local.clone(),
            config: udp,
            socket,
            events,
            delegate,
            heartbeat: AtomicU64::new(0),
            peers: RwLock::new(HashMap::new()),
            departed: Mutex::new(HashMap::new()),
            leaving: AtomicBool::new(false),
            leave_seq: AtomicU64::new(0),
            pending_leave: Mutex::new(None),
            leave_acked: Notify::new(),
            span: span.clone(),
        });

        shared.events.notify_join(&local);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![
            tokio::spawn(
                shared
                    .clone()
                    .receive_loop(shutdown_rx.clone())
                    .instrument(span.clone()),
            ),
            tokio::spawn(
                shared
                    .clone()
                    .gossip_loop(shutdown_rx.clone())
                    .instrument(span.clone()),
            ),
            tokio::spawn(
                shared
                    .clone()
                    .accept_loop(listener, shutdown_rx.clone())
                    .instrument(span.clone()),
            ),
        ];
        if let Some(period) = shared.config.push_pull_interval {
            tasks.push(tokio::spawn(
                shared
                    .clone()
                    .push_pull_loop(period, shutdown_rx)
                    .instrument(span.clone()),
            ));
        }

        span.in_scope(|| info!("Membership transport started"));

        Ok(Self {
            shared,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }
}

#[async_trait]
impl MembershipProvider for UdpMembership {
    async fn join(&self, seeds: &[String]) -> Result<usize, MembershipError> {
        if *self.shutdown_tx.borrow() {
            return Err(MembershipError::Closed);
        }
        if seeds.is_empty() {
            return Ok(0);
        }

        let attempts = seeds.iter().map(|seed| {
            let shared = self.shared.clone();
            async move { (seed, shared.exchange_with(seed, true).await) }
        });
        let results = futures::future::join_all(attempts).await;

        let mut contacted = 0;
        let mut last_error = None;
        for (seed, result) in results {
            match result {
                Ok(()) => contacted += 1,
                Err(e) => {
                    self.shared
                        .span
                        .in_scope(|| debug!(seed = %seed, error = %e, "Seed unreachable"));
                    last_error = Some(e.to_string());
                }
            }
        }

        if contacted == 0 {
            return Err(MembershipError::NoSeedsReachable {
                attempted: seeds.len(),
                last_error: last_error.unwrap_or_default(),
            });
        }
        Ok(contacted)
    }

    async fn leave(&self, wait: Duration) -> Result<(), MembershipError> {
        self.shared.leaving.store(true, Ordering::Release);
        let seq = self.shared.leave_seq.fetch_add(1, Ordering::AcqRel);

        let targets: HashMap<String, Node> = self
            .shared
            .peers
            .read()
            .values()
            .map(|p| (p.node.name.clone(), p.node.clone()))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        *self.shared.pending_leave.lock() = Some(PendingLeave {
            seq,
            waiting: targets.keys().cloned().collect(),
        });

        let notice = Packet::Leave {
            node: self.shared.local.clone(),
            seq,
        };
        let resend = self.shared.config.gossip_interval;
        let wait_for_acks = async {
            loop {
                let waiting = self.shared.waiting_for_ack(seq);
                if waiting.is_empty() {
                    break;
                }
                for name in &waiting {
                    if let Some(node) = targets.get(name) {
                        self.shared.send_to(node, &notice).await;
                    }
                }
                tokio::select! {
                    _ = self.shared.leave_acked.notified() => {}
                    _ = tokio::time::sleep(resend) => {}
                }
            }
        };

        let outcome = timeout(wait, wait_for_acks).await;
        let pending = self
            .shared
            .pending_leave
            .lock()
            .take()
            .map(|p| p.waiting.len())
            .unwrap_or(0);

        match outcome {
            Ok(()) => {
                self.shared
                    .span
                    .in_scope(|| info!(peers = targets.len(), "Leave acknowledged"));
                Ok(())
            }
            Err(_) => Err(MembershipError::LeaveTimeout {
                pending,
                timeout: wait,
            }),
        }
    }

    fn members(&self) -> Vec<Node> {
        let mut members: Vec<Node> = self
            .shared
            .peers
            .read()
            .values()
            .map(|p| p.node.clone())
            .collect();
        members.push(self.shared.local.clone());
        members.sort();
        members
    }

    fn local_node(&self) -> Node {
        self.shared.local.clone()
    }

    async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                self.shared
                    .span
                    .in_scope(|| warn!(error = %e, "Membership task failed"));
            }
        }
        self.shared
            .span
            .in_scope(|| info!("Membership transport stopped"));
    }
}

impl Drop for UdpMembership {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl Shared {
    // ------------------------------------------------------------------
    // Membership table
    // ------------------------------------------------------------------

    fn recently_departed(&self, name: &str) -> bool {
        let mut departed = self.departed.lock();
        match departed.get(name) {
            Some(at) if at.elapsed() < self.config.dead_timeout => true,
            Some(_) => {
                departed.remove(name);
                false
            }
            None => false,
        }
    }

    /// Record a heartbeat. Returns true if the node is new.
    fn observe(&self, digest: &Digest, direct: bool) -> bool {
        if digest.node.name == self.local.name {
            return false;
        }
        {
            let mut peers = self.peers.write();
            if let Some(peer) = peers.get_mut(&digest.node.name) {
                if digest.heartbeat > peer.heartbeat || direct {
                    peer.heartbeat = peer.heartbeat.max(digest.heartbeat);
                    peer.last_seen = Instant::now();
                }
                return false;
            }
        }
        if self.recently_departed(&digest.node.name) {
            trace!(member = %digest.node.name, "Ignoring recently departed member");
            return false;
        }
        self.admit(digest.node.clone(), digest.heartbeat)
    }

    /// Add a member learned through a join or state exchange.
    fn admit(&self, node: Node, heartbeat: u64) -> bool {
        if node.name == self.local.name {
            return false;
        }
        let inserted = {
            let mut peers = self.peers.write();
            if peers.contains_key(&node.name) {
                false
            } else {
                peers.insert(
                    node.name.clone(),
                    Peer {
                        node: node.clone(),
                        heartbeat,
                        last_seen: Instant::now(),
                    },
                );
                true
            }
        };
        if inserted {
            self.events.notify_join(&node);
        }
        inserted
    }

    fn remove(&self, name: &str) {
        let removed = self.peers.write().remove(name);
        self.departed.lock().insert(name.to_string(), Instant::now());
        if let Some(peer) = removed {
            self.events.notify_leave(&peer.node);
        }
    }

    fn expire_dead(&self) {
        let dead: Vec<String> = self
            .peers
            .read()
            .values()
            .filter(|p| p.last_seen.elapsed() > self.config.dead_timeout)
            .map(|p| p.node.name.clone())
            .collect();
        for name in dead {
            warn!(member = %name, "Member unresponsive, removing");
            self.remove(&name);
        }
        self.departed
            .lock()
            .retain(|_, at| at.elapsed() < self.config.dead_timeout);
    }

    fn alive_nodes(&self) -> Vec<Node> {
        self.peers.read().values().map(|p| p.node.clone()).collect()
    }

    fn waiting_for_ack(&self, seq: u64) -> Vec<String> {
        match &*self.pending_leave.lock() {
            Some(pending) if pending.seq == seq => pending.waiting.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // UDP
    // ------------------------------------------------------------------

    async fn send_to(&self, node: &Node, packet: &Packet) {
        let addr = match node.socket_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(member = %node.name, error = %e, "Cannot address member");
                return;
            }
        };
        self.send_addr(addr, packet).await;
    }

    async fn send_addr(&self, addr: SocketAddr, packet: &Packet) {
        let bytes = match encode(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode packet");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            debug!(%addr, error = %e, "Failed to send packet");
        }
    }

    fn digest(&self) -> Vec<Digest> {
        let own = Digest {
            node: self.local.clone(),
            heartbeat: self.heartbeat.load(Ordering::Acquire),
        };
        let known: Vec<Digest> = self
            .peers
            .read()
            .values()
            .map(|p| Digest {
                node: p.node.clone(),
                heartbeat: p.heartbeat,
            })
            .collect();
        let mut digest = vec![own];
        digest.extend(random_subset(&known, DIGEST_SAMPLE));
        digest
    }

    fn gossip_packet(&self) -> Packet {
        let from = self.local.clone();
        let members = self.digest();
        let header = Packet::Gossip {
            from: from.clone(),
            members: members.clone(),
            messages: Vec::new(),
        };
        let header_len = bincode::serialized_size(&header).unwrap_or(0) as usize;
        let limit = self.config.udp_buffer_size.saturating_sub(header_len);
        Packet::Gossip {
            from,
            members,
            messages: self.delegate.get_broadcasts(MESSAGE_OVERHEAD, limit),
        }
    }

    async fn gossip_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.gossip_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if self.leaving.load(Ordering::Acquire) {
                        continue;
                    }
                    self.heartbeat.fetch_add(1, Ordering::AcqRel);
                    self.expire_dead();

                    let targets = random_subset(&self.alive_nodes(), self.config.gossip_nodes);
                    for target in targets {
                        let packet = self.gossip_packet();
                        self.send_to(&target, &packet).await;
                    }
                }
            }
        }
        debug!("Gossip loop stopped");
    }

    async fn receive_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; self.config.udp_buffer_size.max(DEFAULT_PACKET_SIZE) * 2];
        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, from)) => self.handle_packet(&buf[..len], from).await,
                Err(e) => debug!(error = %e, "UDP receive failed"),
            }
        }
        debug!("Receive loop stopped");
    }

    async fn handle_packet(&self, bytes: &[u8], addr: SocketAddr) {
        let packet: Packet = match decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(%addr, error = %e, "Dropping undecodable packet");
                return;
            }
        };

        match packet {
            Packet::Gossip {
                from,
                members,
                messages,
            } => {
                for digest in &members {
                    self.observe(digest, digest.node.name == from.name);
                }
                for message in &messages {
                    self.delegate.notify_msg(message);
                }
            }
            Packet::Leave { node, seq } => {
                if node.name != self.local.name {
                    info!(member = %node.name, "Member announced leave");
                    self.remove(&node.name);
                }
                let ack = Packet::LeaveAck {
                    seq,
                    from: self.local.name.clone(),
                };
                self.send_addr(addr, &ack).await;
            }
            Packet::LeaveAck { seq, from } => {
                let mut pending = self.pending_leave.lock();
                if let Some(p) = pending.as_mut().filter(|p| p.seq == seq) {
                    p.waiting.remove(&from);
                    if p.waiting.is_empty() {
                        self.leave_acked.notify_one();
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // TCP join and push/pull
    // ------------------------------------------------------------------

    /// Connect to `seed`, send our state and merge the reply.
    async fn exchange_with(&self, seed: &str, join: bool) -> Result<(), MembershipError> {
        let addr = lookup_host(seed)
            .await?
            .next()
            .ok_or_else(|| MembershipError::InvalidAddress(seed.to_string()))?;

        let request = JoinRequest {
            node: self.local.clone(),
            join,
            state: self.delegate.local_state(join),
        };
        let response: JoinResponse = timeout(self.config.tcp_timeout, async {
            let mut stream = TcpStream::connect(addr).await?;
            write_frame(&mut stream, &request).await?;
            read_frame::<_, JoinResponse>(&mut stream).await
        })
        .await
        .map_err(|_| {
            MembershipError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("exchange with {seed} timed out"),
            ))
        })??;

        let mut added = 0;
        for node in response.members {
            if join {
                self.departed.lock().remove(&node.name);
            }
            if self.admit(node, 0) {
                added += 1;
            }
        }
        self.delegate.merge_remote_state(&response.state, join);
        debug!(%seed, added, join, "State exchange complete");
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let shared = self.clone();
                        tokio::spawn(
                            async move {
                                if let Err(e) = shared.serve_exchange(stream).await {
                                    debug!(%addr, error = %e, "State exchange failed");
                                }
                            }
                            .in_current_span(),
                        );
                    }
                    Err(e) => warn!(error = %e, "TCP accept failed"),
                },
            }
        }
        debug!("Accept loop stopped");
    }

    async fn serve_exchange(&self, mut stream: TcpStream) -> Result<(), MembershipError> {
        let request: JoinRequest = timeout(
            self.config.tcp_timeout,
            read_frame::<_, JoinRequest>(&mut stream),
        )
            .await
            .map_err(|_| {
                MembershipError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "reading exchange request timed out",
                ))
            })??;

        if request.join && request.node.name != self.local.name {
            self.departed.lock().remove(&request.node.name);
            info!(member = %request.node.name, address = %request.node.endpoint(), "Member joining");
        }
        self.admit(request.node, 0);
        self.delegate.merge_remote_state(&request.state, request.join);

        let mut members = self.alive_nodes();
        members.push(self.local.clone());
        let response = JoinResponse {
            members,
            state: self.delegate.local_state(request.join),
        };
        write_frame(&mut stream, &response).await
    }

    async fn push_pull_loop(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if self.leaving.load(Ordering::Acquire) {
                        continue;
                    }
                    let Some(peer) = random_subset(&self.alive_nodes(), 1).pop() else {
                        continue;
                    };
                    if let Err(e) = self.exchange_with(&peer.endpoint(), false).await {
                        debug!(member = %peer.name, error = %e, "Push/pull failed");
                    }
                }
            }
        }
        debug!("Push/pull loop stopped");
    }
}
