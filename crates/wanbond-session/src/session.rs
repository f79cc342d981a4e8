//! # Session supervisor
//!
//! Owns the UDP socket per WAN uplink, the send queue, the receive queue,
//! and every long-lived task: one send task, one receive task per uplink,
//! one probe task per uplink, and one health-event consumer. Tasks talk
//! exclusively through bounded channels and a `tokio::sync::watch` shutdown
//! signal: shared `Arc` state, one `tokio::spawn` per long-lived task, and a
//! `watch::Receiver<bool>` each task polls at its next suspension point.
//! `Session` itself stays a thin, cheaply cloned handle wrapping channel
//! senders and a handle to the background task set.
//!
//! FEC grouping: when the router flags a packet for redundancy, its data
//! shard is tagged with a group id (the wire header's `group_id` field) and
//! a shard index (repurposing the otherwise-unused `priority` field for
//! grouped packets). Once `k` shards have accumulated, `m` parity shards are
//! computed and sent as separate `Fec`-typed packets carrying the same
//! group id and the group's first sequence number (bit-cast losslessly into
//! the parity packet's `timestamp_ns`, which Data/Fec packets don't
//! otherwise use). A group that stalls short of `k` shards past its
//! deadline is abandoned with no parity sent — the data shards already went
//! out individually, so nothing is lost, only that group's redundancy.
//! On receive, once at least `k` of a group's `k + m` slots have arrived
//! the group is decoded and its data shards delivered with sequence numbers
//! `base_seq + shard_index`, through the same dedup/reorder path a plain
//! `Data` packet takes.

use bytes::Bytes;
use quanta::Instant;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use wanbond_bonding::config::{BondConfig, ConfigError};
use wanbond_bonding::health::{HealthConfig, HealthEvent, HealthProber, HealthState, ProbeMethod};
use wanbond_bonding::router::{Router, RouterConfig, WanCandidate};
use wanbond_bonding::wan::{WanConfig, WanState};
use wanbond_transport::clock::{SequenceGenerator, TimestampClock};
use wanbond_transport::codec::{FecDecoder, FecEncoder};
use wanbond_transport::dedup::DedupCache;
use wanbond_transport::reorder::ReorderBuffer;
use wanbond_transport::stats::Ewma;
use wanbond_transport::wire::{DecodeError, Flags, Packet, PacketHeader, PacketType, PROTOCOL_VERSION};

use crate::plugins::{AlertLevel, Direction, PluginManager};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("send queue is full")]
    BufferFull,
    #[error("session is already running")]
    AlreadyRunning,
    #[error("session is not running")]
    NotRunning,
    #[error("no WAN registered with id {0}")]
    UnknownWan(u8),
    #[error("failed to bind WAN socket: {0}")]
    Bind(#[source] std::io::Error),
}

/// FEC shaping applied when the router flags a packet for redundancy.
#[derive(Debug, Clone, Copy)]
pub struct FecSessionConfig {
    pub k: usize,
    pub m: usize,
    pub group_deadline: Duration,
}

impl Default for FecSessionConfig {
    fn default() -> Self {
        FecSessionConfig {
            k: 8,
            m: 2,
            group_deadline: Duration::from_millis(50),
        }
    }
}

/// Static, operator-supplied configuration for one bonded uplink, including
/// the socket endpoints `WanConfig` itself has no opinion on.
#[derive(Debug, Clone)]
pub struct WanEndpoint {
    pub config: WanConfig,
    pub bind_addr: SocketAddr,
    pub remote_addr: Option<SocketAddr>,
}

/// Top-level session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: u64,
    pub wans: Vec<WanEndpoint>,
    pub router: RouterConfig,
    pub health: HealthConfig,
    pub fec: FecSessionConfig,
    pub reorder_capacity: usize,
    pub reorder_timeout: Duration,
    pub dedup_max_size: usize,
    pub dedup_ttl: Duration,
    pub send_queue_capacity: usize,
    pub recv_queue_capacity: usize,
    pub probe_timeout: Duration,
}

impl SessionConfig {
    pub fn new(session_id: u64) -> Self {
        SessionConfig {
            session_id,
            wans: Vec::new(),
            router: RouterConfig::default(),
            health: HealthConfig::default(),
            fec: FecSessionConfig::default(),
            reorder_capacity: 256,
            reorder_timeout: Duration::from_millis(200),
            dedup_max_size: 4096,
            dedup_ttl: Duration::from_millis(1000),
            send_queue_capacity: 1000,
            recv_queue_capacity: 1000,
            probe_timeout: Duration::from_millis(500),
        }
    }

    /// Builds a session configuration from a validated bond config plus the
    /// socket endpoints the bond config has no opinion on (bind/remote
    /// addresses are a deployment concern, not a routing/FEC/health one).
    ///
    /// `endpoints` is looked up by WAN id; every WAN in `bond.wans` must have
    /// an entry or this returns [`ConfigError::MissingEndpoint`].
    pub fn from_bond_config(
        bond: &BondConfig,
        session_id: u64,
        endpoints: &HashMap<u8, (SocketAddr, Option<SocketAddr>)>,
    ) -> Result<Self, ConfigError> {
        bond.validate()?;

        let mut wans = Vec::with_capacity(bond.wans.len());
        for wan_config in &bond.wans {
            let (bind_addr, remote_addr) = *endpoints
                .get(&wan_config.id)
                .ok_or(ConfigError::MissingEndpoint(wan_config.id))?;
            wans.push(WanEndpoint {
                config: wan_config.clone(),
                bind_addr,
                remote_addr,
            });
        }

        Ok(SessionConfig {
            session_id,
            wans,
            router: RouterConfig {
                mode: bond.route_mode.into(),
                fec_loss_threshold: bond.fec_loss_threshold,
                fec_enabled: bond.fec.enabled,
            },
            health: bond.health_config(),
            fec: FecSessionConfig {
                k: bond.fec.k,
                m: bond.fec.m,
                group_deadline: Duration::from_millis(bond.fec.group_deadline_ms),
            },
            reorder_capacity: bond.reorder.capacity,
            reorder_timeout: Duration::from_millis(bond.reorder.timeout_ms),
            dedup_max_size: bond.dedup.max_size,
            dedup_ttl: Duration::from_millis(bond.dedup.ttl_ms),
            ..SessionConfig::new(session_id)
        })
    }

    /// Reads and parses a [`BondConfig`] from a TOML file on disk, then
    /// builds a [`SessionConfig`] from it. Collapses the file-IO, TOML, and
    /// validation error types a CLI caller would otherwise have to match on
    /// individually into one reportable chain.
    pub fn from_bond_config_file(
        path: &std::path::Path,
        session_id: u64,
        endpoints: &HashMap<u8, (SocketAddr, Option<SocketAddr>)>,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading bond config from {}", path.display()))?;
        let bond: BondConfig = toml::from_str(&text)
            .with_context(|| format!("parsing bond config at {}", path.display()))?;
        SessionConfig::from_bond_config(&bond, session_id, endpoints)
            .with_context(|| format!("building session config from {}", path.display()))
    }
}

/// Tracks in-flight shards for one outgoing FEC group.
struct SendGroup {
    group_id: u32,
    base_seq: Option<u64>,
    shards: Vec<Bytes>,
    started_at: Instant,
}

impl SendGroup {
    fn new(group_id: u32) -> Self {
        SendGroup {
            group_id,
            base_seq: None,
            shards: Vec::new(),
            started_at: Instant::now(),
        }
    }

    fn push(&mut self, seq: u64, payload: Bytes) -> usize {
        if self.shards.is_empty() {
            self.base_seq = Some(seq);
        }
        self.shards.push(payload);
        self.shards.len() - 1
    }

    fn ready(&self, k: usize) -> bool {
        self.shards.len() >= k
    }

    fn stale(&self, deadline: Duration) -> bool {
        self.started_at.elapsed() >= deadline
    }
}

/// Reassembly state for one incoming FEC group on one uplink. Sized to the
/// session's configured `k + m` — both ends run with the same shape, so
/// nothing extra needs to travel on the wire.
struct RecvGroup {
    slots: Vec<Option<Bytes>>,
    base_seq: Option<u64>,
    started_at: Instant,
}

impl RecvGroup {
    fn new(k: usize, m: usize) -> Self {
        RecvGroup {
            slots: vec![None; k + m],
            base_seq: None,
            started_at: Instant::now(),
        }
    }

    fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn stale(&self, deadline: Duration) -> bool {
        self.started_at.elapsed() >= deadline * 2
    }
}

/// Rolling RTT/loss smoothing fed by each probe round, independent of the
/// health prober's own hysteresis counters — this is the telemetry the
/// router's candidate scoring and FEC loss gate read.
struct ProbeStats {
    rtt_ewma: Ewma,
    loss_ewma: Ewma,
}

impl ProbeStats {
    fn new() -> Self {
        ProbeStats {
            rtt_ewma: Ewma::new(0.2),
            loss_ewma: Ewma::new(0.2),
        }
    }
}

struct WanEntry {
    endpoint: WanEndpoint,
    socket: Arc<UdpSocket>,
    remote_addr: StdRwLock<Option<SocketAddr>>,
    state: StdRwLock<WanState>,
    dedup: AsyncMutex<DedupCache>,
    reorder: AsyncMutex<ReorderBuffer>,
    recv_groups: AsyncMutex<HashMap<u32, RecvGroup>>,
    pending_probes: StdMutex<HashMap<u64, oneshot::Sender<()>>>,
    probe_stats: StdMutex<ProbeStats>,
    shutdown_tx: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

struct SessionInner {
    session_id: u64,
    config: SessionConfig,
    clock: TimestampClock,
    seq: StdMutex<SequenceGenerator>,
    wans: StdRwLock<HashMap<u8, Arc<WanEntry>>>,
    router: StdMutex<Router>,
    health: StdMutex<HealthProber>,
    plugins: Arc<PluginManager>,
    recv_tx: mpsc::Sender<Bytes>,
    send_rx: StdMutex<Option<mpsc::Receiver<Bytes>>>,
    send_group: StdMutex<Option<SendGroup>>,
    next_group_id: AtomicU32,
    dead_drops: AtomicU32,
}

/// A running (or not-yet-started) bonded session.
///
/// Cloning a `Session` is cheap — it's a thin handle over an `Arc`-shared
/// inner.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    send_tx: mpsc::Sender<Bytes>,
    running: Arc<AtomicBool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    session_tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    health_tx: Arc<StdMutex<Option<mpsc::Sender<HealthEvent>>>>,
}

impl Session {
    /// Builds a session and its initial WAN set. Returns the session handle
    /// plus the receive queue the application drains delivered payloads
    /// from. Sockets are bound immediately; tasks don't start until
    /// [`Session::start`].
    pub async fn new(config: SessionConfig) -> Result<(Session, mpsc::Receiver<Bytes>), SessionError> {
        let (recv_tx, recv_rx) = mpsc::channel(config.recv_queue_capacity);
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_capacity);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let mut health = HealthProber::new(config.health.clone());
        let router = Router::new(config.router.clone());

        let mut wans = HashMap::new();
        for endpoint in &config.wans {
            health.register(endpoint.config.id);
            let entry = bind_wan(endpoint.clone(), &config).await?;
            wans.insert(endpoint.config.id, entry);
        }

        let inner = Arc::new(SessionInner {
            session_id: config.session_id,
            clock: TimestampClock::new(),
            seq: StdMutex::new(SequenceGenerator::new()),
            wans: StdRwLock::new(wans),
            router: StdMutex::new(router),
            health: StdMutex::new(health),
            plugins: Arc::new(PluginManager::new()),
            recv_tx,
            send_rx: StdMutex::new(Some(send_rx)),
            send_group: StdMutex::new(None),
            next_group_id: AtomicU32::new(1),
            dead_drops: AtomicU32::new(0),
            config,
        });

        let session = Session {
            inner,
            send_tx,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Arc::new(shutdown_tx),
            session_tasks: Arc::new(StdMutex::new(Vec::new())),
            health_tx: Arc::new(StdMutex::new(None)),
        };

        Ok((session, recv_rx))
    }

    pub fn plugins(&self) -> Arc<PluginManager> {
        self.inner.plugins.clone()
    }

    /// Idempotent: starts the send task, one receive+probe task pair per
    /// currently-registered WAN, and the health-event consumer.
    pub fn start(&self) -> Result<(), SessionError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyRunning);
        }

        let Some(mut send_rx) = self.inner.send_rx.lock().unwrap().take() else {
            // Only reachable after a prior start()/stop() cycle — a session
            // is single-use, since send_rx can only be taken once.
            self.running.store(false, Ordering::SeqCst);
            return Err(SessionError::AlreadyRunning);
        };
        let (health_tx, mut health_rx) = mpsc::channel::<HealthEvent>(256);

        let inner = self.inner.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let send_task = tokio::spawn(async move {
            run_send_task(inner, &mut send_rx, shutdown_rx).await;
        });

        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let health_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    Some(event) = health_rx.recv() => {
                        handle_health_event(&inner, event);
                    }
                }
            }
        });

        self.session_tasks.lock().unwrap().push(send_task);
        self.session_tasks.lock().unwrap().push(health_task);
        *self.health_tx.lock().unwrap() = Some(health_tx.clone());

        let wans: Vec<Arc<WanEntry>> = self.inner.wans.read().unwrap().values().cloned().collect();
        for entry in wans {
            self.spawn_wan_tasks(entry, health_tx.clone());
        }

        Ok(())
    }

    /// Signals cancellation to every task and waits for them to exit.
    pub async fn stop(&self) -> Result<(), SessionError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SessionError::NotRunning);
        }
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.session_tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }

        let wans: Vec<Arc<WanEntry>> = self.inner.wans.read().unwrap().values().cloned().collect();
        for entry in wans {
            let _ = entry.shutdown_tx.send(true);
            let tasks = std::mem::take(&mut *entry.tasks.lock().unwrap());
            for task in tasks {
                let _ = task.await;
            }
        }

        Ok(())
    }

    /// Enqueues a payload for transmission. Non-blocking; returns
    /// [`SessionError::BufferFull`] if the send queue is saturated.
    pub fn try_send(&self, payload: Bytes) -> Result<(), SessionError> {
        self.send_tx
            .try_send(payload)
            .map_err(|_| SessionError::BufferFull)
    }

    /// Registers and binds a new WAN uplink, starting its tasks immediately
    /// if the session is already running.
    pub async fn add_wan(&self, endpoint: WanEndpoint) -> Result<(), SessionError> {
        let id = endpoint.config.id;
        self.inner.health.lock().unwrap().register(id);
        let entry = bind_wan(endpoint, &self.inner.config).await?;
        self.inner.wans.write().unwrap().insert(id, entry.clone());

        if self.running.load(Ordering::SeqCst) {
            if let Some(health_tx) = self.health_tx.lock().unwrap().clone() {
                self.spawn_wan_tasks(entry, health_tx);
            }
        }
        Ok(())
    }

    pub fn remove_wan(&self, wan_id: u8) -> Result<(), SessionError> {
        let entry = self
            .inner
            .wans
            .write()
            .unwrap()
            .remove(&wan_id)
            .ok_or(SessionError::UnknownWan(wan_id))?;
        self.inner.health.lock().unwrap().remove(wan_id);
        let _ = entry.shutdown_tx.send(true);
        Ok(())
    }

    fn spawn_wan_tasks(&self, entry: Arc<WanEntry>, health_tx: mpsc::Sender<HealthEvent>) {
        let inner = self.inner.clone();
        let recv_entry = entry.clone();
        let recv_shutdown = entry.shutdown_tx.subscribe();
        let recv_task = tokio::spawn(async move {
            run_receive_task(inner, recv_entry, recv_shutdown).await;
        });

        let inner = self.inner.clone();
        let probe_entry = entry.clone();
        let probe_shutdown = entry.shutdown_tx.subscribe();
        let probe_task = tokio::spawn(async move {
            run_probe_task(inner, probe_entry, probe_shutdown, health_tx).await;
        });

        entry.tasks.lock().unwrap().push(recv_task);
        entry.tasks.lock().unwrap().push(probe_task);
    }
}

async fn bind_wan(
    endpoint: WanEndpoint,
    config: &SessionConfig,
) -> Result<Arc<WanEntry>, SessionError> {
    let socket = UdpSocket::bind(endpoint.bind_addr)
        .await
        .map_err(SessionError::Bind)?;
    if let Some(remote) = endpoint.remote_addr {
        let _ = socket.connect(remote).await;
    }

    let wan_config = endpoint.config.clone();
    let (shutdown_tx, _) = watch::channel(false);
    Ok(Arc::new(WanEntry {
        remote_addr: StdRwLock::new(endpoint.remote_addr),
        state: StdRwLock::new(WanState::new(wan_config)),
        dedup: AsyncMutex::new(DedupCache::new(config.dedup_max_size, config.dedup_ttl)),
        reorder: AsyncMutex::new(ReorderBuffer::new(
            config.reorder_capacity,
            0,
            config.reorder_timeout,
        )),
        recv_groups: AsyncMutex::new(HashMap::new()),
        pending_probes: StdMutex::new(HashMap::new()),
        probe_stats: StdMutex::new(ProbeStats::new()),
        shutdown_tx,
        tasks: StdMutex::new(Vec::new()),
        endpoint,
        socket: Arc::new(socket),
    }))
}

fn severity_for(state: HealthState) -> AlertLevel {
    match state {
        HealthState::Up | HealthState::Recovering | HealthState::Testing | HealthState::Unknown => {
            AlertLevel::Info
        }
        HealthState::Degraded => AlertLevel::Warning,
        HealthState::Down => AlertLevel::Error,
    }
}

fn handle_health_event(inner: &Arc<SessionInner>, event: HealthEvent) {
    let HealthEvent::StateChanged { wan_id, from, to } = event;
    if let Some(entry) = inner.wans.read().unwrap().get(&wan_id) {
        entry.state.write().unwrap().health = to;
    }
    let level = severity_for(to);
    inner.plugins.notify_alert(
        level,
        &format!("wan {wan_id} health changed"),
        &format!("{} -> {}", from.as_str(), to.as_str()),
    );
}

fn build_candidates(wans: &HashMap<u8, Arc<WanEntry>>) -> Vec<WanCandidate> {
    wans.values()
        .map(|entry| {
            let state = entry.state.read().unwrap();
            WanCandidate {
                id: state.id(),
                priority: state.config.priority,
                weight: state.config.weight,
                eligible: state.is_eligible(),
                rtt_ms: state.metrics.rtt_ms,
                loss_rate: state.metrics.loss_rate,
                bytes_sent: state.metrics.bytes_sent,
            }
        })
        .collect()
}

async fn run_send_task(
    inner: Arc<SessionInner>,
    send_rx: &mut mpsc::Receiver<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
            maybe_payload = send_rx.recv() => {
                match maybe_payload {
                    Some(payload) => handle_outgoing(&inner, payload).await,
                    None => break,
                }
            }
        }
    }
}

async fn handle_outgoing(inner: &Arc<SessionInner>, payload: Bytes) {
    let sequence_id = inner.seq.lock().unwrap().next();
    let header = PacketHeader {
        version: PROTOCOL_VERSION,
        packet_type: PacketType::Data,
        flags: Flags::empty(),
        session_id: inner.session_id,
        sequence_id,
        timestamp_ns: inner.clock.now_ns(),
        wan_id: 0,
        priority: 0,
        data_len: 0,
        group_id: 0,
    };
    let packet = Packet::new(header, payload.clone());
    let Some(packet) = inner.plugins.filter_outgoing(packet) else {
        trace!(sequence_id, "outgoing packet dropped by filter chain");
        return;
    };

    let candidates = build_candidates(&inner.wans.read().unwrap());
    let Some(decision) = inner.router.lock().unwrap().route(&candidates, None) else {
        // Escalates with sustained outage length rather than logging every
        // drop at the same level: a single bad packet is a debug line, a
        // blip worth a human's attention is a warning, and an outage long
        // enough to matter operationally is an error.
        let drops = inner.dead_drops.fetch_add(1, Ordering::Relaxed) + 1;
        match drops {
            1 => warn!(drops, "no eligible WAN to route on, dropping packet"),
            d if d % 1000 == 0 => error!(drops = d, "sustained total WAN outage, still dropping packets"),
            d if d % 100 == 0 => warn!(drops = d, "no eligible WAN to route on, dropping packet"),
            _ => debug!(drops, "no eligible WAN to route on, dropping packet"),
        }
        inner
            .plugins
            .notify_alert(AlertLevel::Error, "no eligible WAN", "all links down or ineligible");
        return;
    };
    if inner.dead_drops.swap(0, Ordering::Relaxed) > 0 {
        debug!("eligible WAN found again, outage cleared");
    }

    let mut packet = packet;
    packet.header.wan_id = decision.primary;

    if decision.use_fec {
        let (group_id, shard_idx, group_ready) = {
            let mut guard = inner.send_group.lock().unwrap();
            if let Some(stale) = guard.as_ref() {
                if stale.stale(inner.config.fec.group_deadline) && !stale.ready(inner.config.fec.k) {
                    debug!(
                        group_id = stale.group_id,
                        shards = stale.shards.len(),
                        "dropping stale incomplete FEC group, no parity sent"
                    );
                    *guard = None;
                }
            }
            let group = guard.get_or_insert_with(|| {
                SendGroup::new(inner.next_group_id.fetch_add(1, Ordering::Relaxed))
            });
            let idx = group.push(sequence_id, payload.clone());
            let ready = group.ready(inner.config.fec.k);
            (group.group_id, idx, ready)
        };
        packet.header.group_id = group_id;
        packet.header.priority = shard_idx as u8;
        send_on(inner, decision.primary, &decision.backups, &packet).await;

        if group_ready {
            flush_fec_group(inner, &candidates).await;
        }
    } else {
        send_on(inner, decision.primary, &[], &packet).await;
    }
}

async fn flush_fec_group(inner: &Arc<SessionInner>, candidates: &[WanCandidate]) {
    let group = { inner.send_group.lock().unwrap().take() };
    let Some(group) = group else { return };
    let k = inner.config.fec.k;
    let m = inner.config.fec.m;
    let Some(base_seq) = group.base_seq else { return };
    debug_assert_eq!(group.shards.len(), k, "flush is only triggered once k shards are collected");

    let encoder = match FecEncoder::new(k, m) {
        Ok(e) => e,
        Err(err) => {
            warn!(?err, "failed to build FEC encoder, dropping group parity");
            return;
        }
    };
    let parity = match encoder.encode(&group.shards) {
        Ok(p) => p,
        Err(err) => {
            warn!(?err, "FEC encode failed, dropping group parity");
            return;
        }
    };

    for (i, shard) in parity.into_iter().enumerate() {
        let sequence_id = inner.seq.lock().unwrap().next();
        let header = PacketHeader {
            version: PROTOCOL_VERSION,
            packet_type: PacketType::Fec,
            flags: Flags::FEC,
            session_id: inner.session_id,
            sequence_id,
            timestamp_ns: base_seq as i64,
            wan_id: 0,
            priority: (k + i) as u8,
            data_len: 0,
            group_id: group.group_id,
        };
        let packet = Packet::new(header, shard);
        if let Some(decision) = inner.router.lock().unwrap().route(candidates, None) {
            let mut packet = packet;
            packet.header.wan_id = decision.primary;
            send_on(inner, decision.primary, &decision.backups, &packet).await;
        }
    }
}

async fn send_on(inner: &Arc<SessionInner>, primary: u8, backups: &[u8], packet: &Packet) {
    let wans = inner.wans.read().unwrap();
    let encoded = packet.encode();

    if let Some(entry) = wans.get(&primary) {
        deliver(entry, &encoded).await;
        entry.state.write().unwrap().metrics.bytes_sent += encoded.len() as u64;
        inner
            .plugins
            .notify_packet(primary, &packet.payload, Direction::Outgoing);
    }

    if packet.header.packet_type == PacketType::Fec || packet.header.flags.contains(Flags::FEC) {
        for &backup_id in backups {
            if let Some(entry) = wans.get(&backup_id) {
                deliver(entry, &encoded).await;
            }
        }
    }
}

async fn deliver(entry: &Arc<WanEntry>, encoded: &Bytes) {
    let target = *entry.remote_addr.read().unwrap();
    let result = match target {
        Some(addr) => entry.socket.send_to(encoded, addr).await,
        None => entry.socket.send(encoded).await,
    };
    if let Err(err) = result {
        warn!(wan_id = entry.endpoint.config.id, %err, "send failed");
    }
}

async fn run_receive_task(
    inner: Arc<SessionInner>,
    entry: Arc<WanEntry>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut sweep = tokio::time::interval(inner.config.reorder_timeout);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
            _ = sweep.tick() => {
                let expired = entry.reorder.lock().await.cleanup_expired(Instant::now());
                if !expired.is_empty() {
                    debug!(
                        wan_id = entry.endpoint.config.id,
                        dropped = expired.len(),
                        "reorder buffer swept stale entries"
                    );
                }
            }
            result = tokio::time::timeout(Duration::from_secs(1), entry.socket.recv_from(&mut buf)) => {
                match result {
                    Err(_) => continue, // read deadline elapsed, re-check shutdown
                    Ok(Err(err)) => {
                        warn!(wan_id = entry.endpoint.config.id, %err, "recv failed");
                        continue;
                    }
                    Ok(Ok((n, peer))) => {
                        if entry.remote_addr.read().unwrap().is_none() {
                            *entry.remote_addr.write().unwrap() = Some(peer);
                        }
                        handle_datagram(&inner, &entry, &buf[..n], peer).await;
                    }
                }
            }
        }
    }
}

async fn handle_datagram(inner: &Arc<SessionInner>, entry: &Arc<WanEntry>, data: &[u8], peer: SocketAddr) {
    let packet = match Packet::decode(data) {
        Ok(p) => p,
        Err(err) => {
            match err {
                DecodeError::TooShort | DecodeError::UnsupportedVersion | DecodeError::BadLength => {
                    debug!(wan_id = entry.endpoint.config.id, ?err, "dropping malformed datagram")
                }
                DecodeError::ChecksumMismatch => {
                    debug!(wan_id = entry.endpoint.config.id, "dropping corrupt datagram")
                }
            }
            return;
        }
    };

    let Some(packet) = inner.plugins.filter_incoming(packet) else {
        return;
    };
    inner
        .plugins
        .notify_packet(entry.endpoint.config.id, &packet.payload, Direction::Incoming);

    match packet.header.packet_type {
        PacketType::Heartbeat => handle_heartbeat(entry, packet, peer).await,
        PacketType::Control => {
            trace!(wan_id = entry.endpoint.config.id, "control packet received, no dispatcher configured");
        }
        PacketType::Data => {
            if packet.header.group_id != 0 {
                handle_grouped_shard(inner, entry, packet).await;
            } else {
                deliver_data(inner, entry, packet.header.sequence_id, packet.payload).await;
            }
        }
        PacketType::Fec => handle_grouped_shard(inner, entry, packet).await,
        PacketType::Multicast => {
            trace!(wan_id = entry.endpoint.config.id, "multicast packet received, no dispatcher configured");
        }
        PacketType::Ack => {}
    }
}

async fn handle_heartbeat(entry: &Arc<WanEntry>, packet: Packet, peer: SocketAddr) {
    let pending = entry
        .pending_probes
        .lock()
        .unwrap()
        .remove(&packet.header.sequence_id);
    if let Some(tx) = pending {
        let _ = tx.send(());
        return;
    }

    // Not one of ours — echo it back verbatim, per the heartbeat contract.
    let encoded = packet.encode();
    let _ = entry.socket.send_to(&encoded, peer).await;
}

async fn deliver_data(inner: &Arc<SessionInner>, entry: &Arc<WanEntry>, sequence_id: u64, payload: Bytes) {
    let mut dedup = entry.dedup.lock().await;
    if dedup.is_duplicate(sequence_id, Instant::now()) {
        return;
    }
    drop(dedup);

    let mut reorder = entry.reorder.lock().await;
    let (released, evicted) = reorder.insert(sequence_id, payload, Instant::now());
    drop(reorder);

    if let Some((seq, _)) = evicted {
        debug!(wan_id = entry.endpoint.config.id, seq, "reorder buffer evicted oldest entry");
    }
    for item in released {
        if inner.recv_tx.try_send(item).is_err() {
            debug!(wan_id = entry.endpoint.config.id, "application receive queue full, dropping");
        }
    }
}

/// Accumulates one shard of an incoming FEC group and, once at least `k`
/// of its `k + m` slots have arrived, decodes the group and delivers its
/// `k` recovered data shards through the same dedup/reorder path a
/// plain (non-grouped) `Data` packet would take.
///
/// `k`/`m` are not carried on the wire — both ends of a session run with
/// the same configured shape, so the group is sized from
/// `inner.config.fec` rather than inferred from the first shard seen.
async fn handle_grouped_shard(inner: &Arc<SessionInner>, entry: &Arc<WanEntry>, packet: Packet) {
    let k = inner.config.fec.k;
    let m = inner.config.fec.m;
    let idx = packet.header.priority as usize;
    if idx >= k + m {
        debug!(
            wan_id = entry.endpoint.config.id,
            idx,
            k,
            m,
            "shard index outside configured FEC shape, dropping"
        );
        return;
    }

    let group_id = packet.header.group_id;
    let (base_seq, slots) = {
        let mut groups = entry.recv_groups.lock().await;
        groups.retain(|_, g| !g.stale(inner.config.fec.group_deadline));

        let group = groups
            .entry(group_id)
            .or_insert_with(|| RecvGroup::new(k, m));
        group.slots[idx] = Some(packet.payload.clone());
        if packet.header.packet_type == PacketType::Fec {
            group.base_seq.get_or_insert(packet.header.timestamp_ns as u64);
        } else if idx == 0 {
            group.base_seq.get_or_insert(packet.header.sequence_id);
        }

        if group.filled() < k {
            return;
        }
        let group = groups.remove(&group_id).expect("just inserted above");
        (group.base_seq, group.slots)
    };

    let Some(base_seq) = base_seq else {
        // Enough shards to attempt recovery, but shard 0 (which carries the
        // group's base sequence number) was itself lost and not recovered
        // by any parity shard's echo of it — nothing to anchor delivery to.
        debug!(wan_id = entry.endpoint.config.id, group_id, "FEC group missing base sequence, dropping");
        return;
    };

    let decoder = match FecDecoder::new(k, m) {
        Ok(d) => d,
        Err(err) => {
            warn!(?err, k, m, "failed to build FEC decoder");
            return;
        }
    };
    match decoder.decode(&slots) {
        Ok(data_shards) => {
            for (i, shard) in data_shards.into_iter().enumerate() {
                deliver_data(inner, entry, base_seq.wrapping_add(i as u64), shard).await;
            }
        }
        Err(err) => {
            debug!(
                wan_id = entry.endpoint.config.id,
                group_id,
                ?err,
                "FEC group unrecoverable, data shards lost"
            );
        }
    }
}

async fn run_probe_task(
    inner: Arc<SessionInner>,
    entry: Arc<WanEntry>,
    mut shutdown_rx: watch::Receiver<bool>,
    health_tx: mpsc::Sender<HealthEvent>,
) {
    let wan_id = entry.endpoint.config.id;
    loop {
        let interval = inner.health.lock().unwrap().next_interval(wan_id);
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
            _ = tokio::time::sleep(interval) => {}
        }
        if *shutdown_rx.borrow() {
            break;
        }

        let method = inner.health.lock().unwrap().select_method(wan_id);
        let (success, rtt_ms) = run_probe(&inner, &entry, method).await;

        let (rtt_avg, loss_avg) = {
            let mut stats = entry.probe_stats.lock().unwrap();
            let loss_avg = stats.loss_ewma.update(if success { 0.0 } else { 1.0 });
            let rtt_avg = if success {
                stats.rtt_ewma.update(rtt_ms)
            } else {
                stats.rtt_ewma.value()
            };
            (rtt_avg, loss_avg)
        };
        {
            let mut state = entry.state.write().unwrap();
            state.metrics.rtt_ms = rtt_avg;
            state.metrics.loss_rate = loss_avg;
        }

        let event = inner
            .health
            .lock()
            .unwrap()
            .record_result(wan_id, method, success, rtt_avg, loss_avg);
        if let Some(event) = event {
            let _ = health_tx.send(event).await;
        }
    }
}

/// Every [`ProbeMethod`] resolves to the same mechanism here: a heartbeat
/// sent on the WAN's own UDP socket, echoed verbatim by the remote end.
/// Distinguishing Ping/Tcp/Http/Dns would need raw sockets, a TCP connect
/// target, and a DNS resolver respectively, none of which are meaningful
/// without an operator-supplied target beyond the bonded remote endpoint
/// itself, so probing simply exercises the path the data plane uses.
/// Returns whether the heartbeat was echoed within the probe timeout, and
/// the round-trip time in milliseconds observed (0.0 on failure/timeout —
/// callers smooth through an EWMA rather than trust a single sample).
async fn run_probe(inner: &Arc<SessionInner>, entry: &Arc<WanEntry>, _method: ProbeMethod) -> (bool, f64) {
    let Some(remote) = *entry.remote_addr.read().unwrap() else {
        return (false, 0.0);
    };

    let sequence_id = inner.seq.lock().unwrap().next();
    let header = PacketHeader {
        version: PROTOCOL_VERSION,
        packet_type: PacketType::Heartbeat,
        flags: Flags::empty(),
        session_id: inner.session_id,
        sequence_id,
        timestamp_ns: inner.clock.now_ns(),
        wan_id: entry.endpoint.config.id,
        priority: 0,
        data_len: 0,
        group_id: 0,
    };
    let packet = Packet::new(header, Bytes::new());

    let (tx, rx) = oneshot::channel();
    entry.pending_probes.lock().unwrap().insert(sequence_id, tx);

    let sent_at = Instant::now();
    if entry.socket.send_to(&packet.encode(), remote).await.is_err() {
        entry.pending_probes.lock().unwrap().remove(&sequence_id);
        return (false, 0.0);
    }

    match tokio::time::timeout(inner.config.probe_timeout, rx).await {
        Ok(Ok(())) => {
            let rtt_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
            (true, rtt_ms)
        }
        _ => {
            entry.pending_probes.lock().unwrap().remove(&sequence_id);
            (false, 0.0)
        }
    }
}
