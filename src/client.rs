//! The top-level orchestrator: node registry, gateway voice demux, load
//! balancing, region affinity, migration, worker failover, and the broken-
//! players recovery pool.
//!
//! Mirrors the shape of `twilight-lavalink`'s own `Lavalink` client (a
//! `DashMap`-backed registry behind an `Arc`, cheap to clone and share across
//! tasks) and `songbird`'s `Songbird` manager (one `Arc<Mutex<_>>` per guild,
//! `get_or_insert` registry semantics); this module generalizes both to a
//! multi-node, REST-driven worker pool instead of a single local voice
//! driver.

use crate::{
    connection::{ConnectionEvent, ServerUpdate, StateUpdate, NULL_CHANNEL_GRACE},
    error::{AquaError, RestError},
    events::{AquaEvent, EventSender},
    http::RestClient,
    model::incoming::{
        Event as WireEvent, EventData, IncomingEvent, Stats as WireStats, TrackEnd, TrackException, TrackStart,
        TrackStuck,
    },
    node::{websocket_url, CloseAction, Node, NodeConfig},
    player::{LoopMode, Player, SocketClosedAction, TrackEndAction},
    track::Track,
};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver},
    Mutex as AsyncMutex,
};
use tracing::{debug, warn};
use twilight_model::id::{
    marker::{ChannelMarker, GuildMarker, UserMarker},
    Id,
};

/// How long a cached, policy-sorted node list remains valid.
pub const NODE_LIST_CACHE_TTL: Duration = Duration::from_secs(12);
/// How long an individual node's composite score is memoized.
pub const NODE_SCORE_CACHE_TTL: Duration = Duration::from_secs(5);
/// Timeout for a node to become ready during [`Aqua::init`].
pub const NODE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a captured broken-player entry remains eligible for rebuild.
pub const BROKEN_PLAYER_TTL: Duration = Duration::from_secs(300);
/// Default per-node cooldown between failover attempts.
pub const DEFAULT_FAILOVER_COOLDOWN: Duration = Duration::from_secs(5);
/// Default cap on failover attempts for a single player before giving up.
pub const DEFAULT_MAX_FAILOVER_ATTEMPTS: u32 = 5;
/// Default number of migrations run concurrently during a failover batch.
pub const DEFAULT_MAX_CONCURRENT_OPS: usize = 10;
/// Default capacity of the diagnostic trace ring buffer.
pub const DEFAULT_TRACE_CAPACITY: usize = 3000;

/// How new players are assigned to nodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadBalancer {
    /// Ascending by node's composite load score (CPU, memory, player count,
    /// REST call volume).
    LeastLoad,
    /// Ascending by the number of REST calls the node has served.
    LeastRest,
    /// Uniformly shuffled.
    Random,
}

/// Tuning knobs for worker failover, see [`Aqua::handle_node_disconnected`].
#[derive(Clone, Debug)]
pub struct FailoverOptions {
    /// Minimum time between failover attempts for the same node.
    pub cooldown: Duration,
    /// Maximum number of failover attempts tolerated for a single player.
    pub max_attempts: u32,
    /// Maximum number of migrations run concurrently.
    pub max_concurrent_ops: usize,
    /// Whether a restored player resumes its previous playback position.
    pub preserve_position: bool,
}

impl Default for FailoverOptions {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_FAILOVER_COOLDOWN,
            max_attempts: DEFAULT_MAX_FAILOVER_ATTEMPTS,
            max_concurrent_ops: DEFAULT_MAX_CONCURRENT_OPS,
            preserve_position: true,
        }
    }
}

/// Orchestrator-wide configuration.
#[derive(Clone, Debug)]
pub struct AquaOptions {
    /// Destroy a player once its queue drains rather than idling.
    pub leave_on_end: bool,
    /// Search prefix applied to bare, unresolved queries.
    pub default_search_platform: Box<str>,
    /// Enable worker session resumption and persisted-player reload.
    pub auto_resume: bool,
    /// Move a player to a region-affine node when its voice endpoint changes.
    pub auto_region_migrate: bool,
    /// Node selection policy for new players.
    pub load_balancer: LoadBalancer,
    /// Tuning for the failover path.
    pub failover: FailoverOptions,
    /// Maximum queued track URIs persisted per player.
    pub max_queue_save: usize,
    /// Maximum queued tracks resolved when restoring a persisted player.
    pub max_tracks_restore: usize,
}

impl Default for AquaOptions {
    fn default() -> Self {
        Self {
            leave_on_end: false,
            default_search_platform: "ytsearch".into(),
            auto_resume: false,
            auto_region_migrate: false,
            load_balancer: LoadBalancer::LeastLoad,
            failover: FailoverOptions::default(),
            max_queue_save: 20,
            max_tracks_restore: 20,
        }
    }
}

/// Everything needed to register a node with an [`Aqua`] instance.
#[derive(Clone, Debug)]
pub struct NodeSpec {
    /// The node's unique name within this orchestrator.
    pub name: Arc<str>,
    /// The node's REST/websocket base URL, e.g. `https://node.example:2333`.
    pub base_url: Box<str>,
    /// The node's static authorization password.
    pub authorization: Box<str>,
    /// Voice regions this node claims to serve, lowercase 3-letter codes.
    pub regions: Vec<Box<str>>,
    /// Websocket reconnect/backoff configuration.
    pub config: NodeConfig,
}

/// The registry entry backing a connected node: its REST client, websocket
/// lifecycle handle, and the metadata the load balancer scores it by.
#[derive(Debug)]
pub struct NodeInfo {
    name: Arc<str>,
    regions: Vec<Box<str>>,
    rest: Arc<RestClient>,
    node: AsyncMutex<Node>,
    rest_calls: AtomicU64,
    last_stats: StdMutex<Option<WireStats>>,
    score_cache: StdMutex<Option<(Instant, f64)>>,
    failed_attempts: AtomicU64,
    last_failover: StdMutex<Option<Instant>>,
    lifecycle: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NodeInfo {
    /// The node's name.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// The node's declared voice regions.
    #[must_use]
    pub fn regions(&self) -> &[Box<str>] {
        &self.regions
    }

    /// The node's REST client, for callers that need direct access (track
    /// resolution, lyrics, route planner).
    #[must_use]
    pub fn rest(&self) -> &Arc<RestClient> {
        &self.rest
    }

    /// Record that a REST call was issued against this node, for the
    /// `leastRest` load-balancing policy.
    pub fn record_rest_call(&self) {
        self.rest_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Merge a freshly received stats frame onto the previous one, keeping
    /// any field the new frame omits at its previous value.
    pub fn set_stats(&self, stats: WireStats) {
        let mut last_stats = self.last_stats.lock().unwrap_or_else(|e| e.into_inner());
        let merged = match last_stats.take() {
            Some(previous) => stats.merge(&previous),
            None => stats,
        };
        *last_stats = Some(merged);
    }

    /// This node's composite load score, memoized for [`NODE_SCORE_CACHE_TTL`].
    #[must_use]
    pub fn score(&self) -> f64 {
        let mut cache = self.score_cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((at, score)) = *cache {
            if at.elapsed() < NODE_SCORE_CACHE_TTL {
                return score;
            }
        }

        let stats = self.last_stats.lock().unwrap_or_else(|e| e.into_inner());
        let score = stats
            .as_ref()
            .map(|stats| composite_score(stats, self.rest_calls.load(Ordering::Relaxed)))
            .unwrap_or(f64::MAX);

        *cache = Some((Instant::now(), score));
        score
    }
}

/// A composite load score: `100·systemLoad/cores + 0.75·playingPlayers +
/// 40·mem.used/mem.reservable + 0.001·rest.calls`.
#[must_use]
pub fn composite_score(stats: &WireStats, rest_calls: u64) -> f64 {
    let cores = stats.cpu.cores.unwrap_or(1).max(1) as f64;
    let reservable = stats.memory.reservable.unwrap_or(1).max(1) as f64;
    let system_load = stats.cpu.system_load.unwrap_or(0.0);
    let playing_players = stats.playing_players.unwrap_or(0);
    let used = stats.memory.used.unwrap_or(0);

    100.0 * system_load / cores
        + 0.75 * playing_players as f64
        + 40.0 * used as f64 / reservable
        + 0.001 * rest_calls as f64
}

/// A captured, disconnected-node player awaiting rebuild, see §4.9.6.
#[derive(Debug)]
struct BrokenPlayer {
    original_node: Arc<str>,
    broken_at: Instant,
    snapshot: PlayerSnapshot,
}

/// A point-in-time capture of a player's user-visible state, used by both
/// migration and durable persistence.
#[derive(Clone, Debug)]
pub struct PlayerSnapshot {
    /// The guild this snapshot belongs to.
    pub guild_id: Id<GuildMarker>,
    /// Text channel bound for playback notifications.
    pub text_channel_id: Option<Id<ChannelMarker>>,
    /// Voice channel the player is (or was) connected to.
    pub voice_channel_id: Option<Id<ChannelMarker>>,
    /// Playback volume, `0..=200`.
    pub volume: i64,
    /// Whether playback was paused.
    pub paused: bool,
    /// Position adjusted for elapsed wall-clock time since the last known
    /// timestamp, see [`position_adjusted`].
    pub position_adjusted: i64,
    /// The track that was playing, if any.
    pub current: Option<Track>,
    /// A snapshot of the pending queue.
    pub queue_snapshot: Vec<Track>,
    /// The loop mode in effect.
    pub loop_mode: LoopMode,
    /// Whether the queue was shuffled. This player doesn't track a
    /// persistent shuffle toggle (shuffling is a one-shot reorder), so this
    /// is always `false`; kept for parity with the persisted record shape.
    pub shuffle: bool,
    /// Whether the connection was server-deafened. `Connection` only sees
    /// `selfDeaf` on the gateway state update itself and doesn't retain it,
    /// so this is always `false`; kept for parity with the persisted record
    /// shape.
    pub deaf: bool,
    /// Whether the player believed it was connected to voice.
    pub connected: bool,
}

/// `position + (playing && !paused ? now - timestamp : 0)`, clamped to
/// `[0, duration]` when a duration is known.
#[must_use]
pub fn position_adjusted(
    position_ms: i64,
    playing: bool,
    paused: bool,
    timestamp_ms: i64,
    now_ms: i64,
    duration_ms: Option<i64>,
) -> i64 {
    let adjusted = if playing && !paused {
        position_ms + (now_ms - timestamp_ms)
    } else {
        position_ms
    };

    match duration_ms {
        Some(duration) => adjusted.clamp(0, duration),
        None => adjusted.max(0),
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// A single entry in the diagnostic trace ring buffer, see §4.9.9.
#[derive(Clone, Debug)]
pub struct TraceEntry {
    /// Monotonic sequence number, unique within one `Aqua` instance.
    pub seq: u64,
    /// Unix timestamp, in milliseconds, when the entry was recorded.
    pub timestamp_ms: i64,
    /// A short event name, e.g. `"nodeFailover"`, `"playerMigrated"`.
    pub event: &'static str,
    /// Free-form event payload.
    pub data: serde_json::Value,
}

/// A `VOICE_STATE_UPDATE` gateway payload, pre-filtered to the bot's own
/// user id by the caller... actually filtered here against `client_id`.
#[derive(Clone, Debug)]
pub struct GatewayVoiceState {
    /// The guild the update concerns.
    pub guild_id: Id<GuildMarker>,
    /// The user the update concerns; updates for any other user are ignored.
    pub user_id: Id<UserMarker>,
    /// The voice channel now occupied, or `None` if the user left.
    pub channel_id: Option<Id<ChannelMarker>>,
    /// The Discord voice session id.
    pub session_id: String,
    /// Whether the user is server-deafened.
    pub self_deaf: bool,
    /// Whether the user is server-muted.
    pub self_mute: bool,
}

/// A `VOICE_SERVER_UPDATE` gateway payload.
#[derive(Clone, Debug)]
pub struct GatewayVoiceServer {
    /// The guild the update concerns.
    pub guild_id: Id<GuildMarker>,
    /// The voice authentication token.
    pub token: String,
    /// The voice server endpoint hostname, `None` while the voice region is
    /// being renegotiated.
    pub endpoint: Option<String>,
}

/// Either half of a Discord voice handshake, dispatched through
/// [`Aqua::update_voice_state`].
#[derive(Clone, Debug)]
pub enum GatewayEvent {
    /// A `VOICE_STATE_UPDATE` payload.
    State(GatewayVoiceState),
    /// A `VOICE_SERVER_UPDATE` payload.
    Server(GatewayVoiceServer),
}

/// The outbound voice-join packet emitted to the host gateway.
#[derive(Clone, Debug)]
pub struct VoiceJoinPacket {
    /// Discord gateway opcode, always `4`.
    pub op: u8,
    /// The guild to join or leave a voice channel in.
    pub guild_id: Id<GuildMarker>,
    /// The channel to join, or `None` to leave.
    pub channel_id: Option<Id<ChannelMarker>>,
    /// Whether to join server-deafened.
    pub self_deaf: bool,
    /// Whether to join server-muted.
    pub self_mute: bool,
}

/// Caller-provided sink for outbound voice-join packets.
pub type GatewaySender = Arc<dyn Fn(VoiceJoinPacket) + Send + Sync>;

/// Parameters for [`Aqua::create_connection`].
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// The guild to connect a player for.
    pub guild_id: Id<GuildMarker>,
    /// The voice channel to join.
    pub voice_channel_id: Id<ChannelMarker>,
    /// Text channel to bind for playback notifications.
    pub text_channel_id: Option<Id<ChannelMarker>>,
    /// Whether to join server-deafened.
    pub self_deaf: bool,
    /// Whether to join server-muted.
    pub self_mute: bool,
}

/// The distributed player runtime: owns every [`Node`] and [`Player`] and
/// routes gateway/worker traffic between them.
///
/// Cheap to clone; internally `Arc`-backed, following the same pattern as
/// `twilight-lavalink`'s `Lavalink` client.
#[derive(Clone)]
pub struct Aqua {
    inner: Arc<AquaInner>,
}

struct AquaInner {
    client_id: Id<UserMarker>,
    options: AquaOptions,
    nodes: DashMap<Arc<str>, Arc<NodeInfo>>,
    players: DashMap<Id<GuildMarker>, Arc<AsyncMutex<Player>>>,
    broken_players: DashMap<Id<GuildMarker>, BrokenPlayer>,
    rebuild_locks: DashMap<Id<GuildMarker>, Arc<AsyncMutex<()>>>,
    tx_ids: DashMap<Id<GuildMarker>, AtomicU64>,
    list_cache: StdMutex<Option<(Instant, Vec<Arc<str>>)>>,
    trace: StdMutex<VecDeque<TraceEntry>>,
    trace_seq: AtomicU64,
    trace_capacity: usize,
    gateway: GatewaySender,
    disconnect_timers: DashMap<Id<GuildMarker>, tokio::task::JoinHandle<()>>,
    events: EventSender,
}

impl Aqua {
    /// Create a new, node-less orchestrator for the given client (bot) user
    /// id. Nodes are registered afterwards via [`Self::add_node`].
    #[must_use]
    pub fn new(
        client_id: Id<UserMarker>,
        options: AquaOptions,
        gateway: GatewaySender,
        events: EventSender,
    ) -> Self {
        Self {
            inner: Arc::new(AquaInner {
                client_id,
                options,
                nodes: DashMap::new(),
                players: DashMap::new(),
                broken_players: DashMap::new(),
                rebuild_locks: DashMap::new(),
                tx_ids: DashMap::new(),
                list_cache: StdMutex::new(None),
                trace: StdMutex::new(VecDeque::new()),
                trace_seq: AtomicU64::new(0),
                trace_capacity: DEFAULT_TRACE_CAPACITY,
                gateway,
                disconnect_timers: DashMap::new(),
                events,
            }),
        }
    }

    fn emit(&self, event: AquaEvent) {
        (self.inner.events)(event);
    }

    /// Register a node and open its REST client, then spawn the task that
    /// drives its websocket lifecycle (connect, `ready`/`playerUpdate`/
    /// `event`/`stats` dispatch, reconnect backoff) for as long as the node
    /// stays registered. `client_name` is sent in the `Client-Name` header
    /// of every handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the node's REST client could not be built (for
    /// example, if native TLS roots could not be loaded).
    pub fn add_node(&self, spec: NodeSpec, client_name: impl Into<Arc<str>>) -> Result<Arc<NodeInfo>, RestError> {
        let rest = Arc::new(RestClient::new(spec.base_url.clone(), spec.authorization.clone())?);
        let node = Node::new(Arc::clone(&spec.name), Arc::clone(&rest), spec.config);

        let info = Arc::new(NodeInfo {
            name: spec.name.clone(),
            regions: spec.regions,
            rest,
            node: AsyncMutex::new(node),
            rest_calls: AtomicU64::new(0),
            last_stats: StdMutex::new(None),
            score_cache: StdMutex::new(None),
            failed_attempts: AtomicU64::new(0),
            last_failover: StdMutex::new(None),
            lifecycle: StdMutex::new(None),
        });

        self.inner.nodes.insert(spec.name, Arc::clone(&info));
        self.invalidate_node_list_cache();

        let aqua = self.clone();
        let lifecycle_info = Arc::clone(&info);
        let client_name = client_name.into();
        let handle = tokio::spawn(async move { aqua.run_node_lifecycle(lifecycle_info, client_name).await });
        *info.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(info)
    }

    /// Remove a node from the registry, aborting its websocket-driving task.
    /// Its players are left to the caller to migrate or destroy; use
    /// [`Self::handle_node_disconnected`] for the usual disconnect-and-
    /// fail-over path.
    pub fn remove_node(&self, name: &str) -> Option<Arc<NodeInfo>> {
        let removed = self.inner.nodes.remove(name).map(|(_, info)| info);
        if let Some(info) = &removed {
            if let Some(handle) = info.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).take() {
                handle.abort();
            }
        }
        self.invalidate_node_list_cache();
        removed
    }

    fn invalidate_node_list_cache(&self) {
        *self.inner.list_cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// This orchestrator's configuration.
    #[must_use]
    pub fn options(&self) -> &AquaOptions {
        &self.inner.options
    }

    /// Direct access to the registry entry for a node, for callers that need
    /// its REST client or load metadata directly.
    #[must_use]
    pub fn node_handle(&self, name: &str) -> Option<Arc<NodeInfo>> {
        self.inner.nodes.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Drive one node's websocket for as long as it stays registered:
    /// connect, dispatch frames through [`Self::run_dispatch_loop`], and on
    /// disconnect either reconnect with backoff or give up and fail its
    /// players over, per [`Node::classify_close`] and [`Node::next_backoff`].
    async fn run_node_lifecycle(&self, info: Arc<NodeInfo>, client_name: Arc<str>) {
        let ws_url = websocket_url(info.rest.base_url());

        loop {
            let (tx, rx) = unbounded_channel();
            let dispatch_aqua = self.clone();
            let dispatch_task = tokio::spawn(async move { dispatch_aqua.run_dispatch_loop(rx).await });

            let run_result = {
                let mut node = info.node.lock().await;
                node.run(&ws_url, info.rest.authorization(), self.inner.client_id, &client_name, tx)
                    .await
            };
            let _ = dispatch_task.await;

            let close_code = match run_result {
                Ok(code) => code,
                Err(error) => {
                    warn!(node = %info.name, %error, "node connection attempt failed");
                    None
                }
            };

            let action = {
                let node = info.node.lock().await;
                close_code.map(|code| node.classify_close(code))
            }
            .unwrap_or(CloseAction::Reconnect {
                delay: Duration::ZERO,
                keep_session: false,
            });

            self.handle_node_close(&info.name, action).await;

            let CloseAction::Reconnect { keep_session, .. } = action else {
                info.node.lock().await.mark_idle();
                break;
            };

            let next_delay = {
                let mut node = info.node.lock().await;
                node.begin_reconnect(!keep_session);
                node.next_backoff()
            };

            match next_delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    self.handle_node_disconnected(&info.name).await;
                    info.node.lock().await.mark_idle();
                    break;
                }
            }
        }
    }

    /// Drain a node's parsed-frame channel, translating each
    /// [`IncomingEvent`] into the corresponding [`Player`] reaction and
    /// [`AquaEvent`].
    async fn run_dispatch_loop(&self, mut rx: UnboundedReceiver<(Arc<str>, IncomingEvent)>) {
        while let Some((node, event)) = rx.recv().await {
            self.handle_node_event(node, event).await;
        }
    }

    async fn handle_node_event(&self, node: Arc<str>, event: IncomingEvent) {
        match event {
            IncomingEvent::Ready(ready) => {
                let Some(info) = self.node_handle(&node) else { return };
                let session_invalidated = {
                    let mut n = info.node.lock().await;
                    n.on_ready(&ready.session_id, ready.resumed)
                };
                self.handle_node_ready(&node, session_invalidated).await;
            }
            IncomingEvent::Stats(stats) => {
                if let Some(info) = self.node_handle(&node) {
                    info.set_stats(stats);
                }
            }
            IncomingEvent::PlayerUpdate(update) => {
                if let Some(player) = self.inner.players.get(&update.guild_id).map(|e| Arc::clone(e.value())) {
                    player.lock().await.apply_player_update(&update.state);
                }
            }
            IncomingEvent::Event(event) => self.handle_track_event(&node, event).await,
            IncomingEvent::Lyrics(lyrics) => {
                self.emit(AquaEvent::Lyrics {
                    guild_id: lyrics.guild_id,
                    op: lyrics.op,
                    data: lyrics.data,
                });
            }
            IncomingEvent::Unknown(frame) => {
                self.emit(AquaEvent::Unknown { node, frame });
            }
        }
    }

    async fn handle_track_event(&self, node: &str, event: WireEvent) {
        let Ok(guild_id) = event.guild_id.parse::<u64>().map(Id::new) else {
            warn!(node, guild_id = %event.guild_id, "event frame had an unparseable guild id");
            return;
        };

        let Some(player) = self.inner.players.get(&guild_id).map(|e| Arc::clone(e.value())) else {
            return;
        };

        match event.data {
            EventData::TrackStartEvent(TrackStart { track }) => {
                self.emit(AquaEvent::TrackStart {
                    guild_id,
                    track: Track::from_wire(track, None),
                });
            }
            EventData::TrackEndEvent(TrackEnd { track, reason }) => {
                let action = player.lock().await.handle_track_end(&track, reason);
                let advanced = matches!(action, TrackEndAction::PlayNext(_));

                match action {
                    TrackEndAction::PlayNext(next) => {
                        let _ = player.lock().await.play(next, false).await;
                    }
                    TrackEndAction::QueueEnded => self.emit(AquaEvent::QueueEnd { guild_id }),
                    TrackEndAction::None | TrackEndAction::Idle => {}
                }

                self.emit(AquaEvent::TrackEnd {
                    guild_id,
                    track: Track::from_wire(track, None),
                    reason,
                    advanced,
                });
            }
            EventData::TrackExceptionEvent(TrackException { track, exception }) => {
                player.lock().await.handle_track_failure();
                self.emit(AquaEvent::TrackException {
                    guild_id,
                    track: Track::from_wire(track, None),
                    message: exception.message.unwrap_or(exception.cause),
                });
            }
            EventData::TrackStuckEvent(TrackStuck { track, threshold_ms }) => {
                player.lock().await.handle_track_failure();
                self.emit(AquaEvent::TrackStuck {
                    guild_id,
                    track: Track::from_wire(track, None),
                    threshold_ms,
                });
            }
            EventData::TrackChangeEvent(change) => {
                debug!(node, %guild_id, has_track = change.track.is_some(), "track change event");
            }
            EventData::WebSocketClosedEvent(closed) => {
                let action = player.lock().await.handle_socket_closed(closed.code);

                match action {
                    SocketClosedAction::Destroy | SocketClosedAction::GiveUp => {
                        let _ = self.destroy_player(guild_id).await;
                    }
                    SocketClosedAction::AttemptResume | SocketClosedAction::ReconnectSequence { .. } => {
                        let mut guard = player.lock().await;
                        if guard.connection().can_attempt_resume(Instant::now()) {
                            guard.connection_mut().begin_resume_attempt();
                        } else {
                            drop(guard);
                            let _ = self.destroy_player(guild_id).await;
                        }
                    }
                    SocketClosedAction::Ignore => {}
                }

                self.emit(AquaEvent::SocketClosed { guild_id, close: closed });
            }
        }
    }

    // -- 4.9.1 Registry & lookup -----------------------------------------

    /// Fetch an existing player for a guild, erroring if none is registered.
    ///
    /// # Errors
    ///
    /// Returns [`AquaError::PlayerNotFound`] if no player is registered for
    /// the guild.
    pub fn get(&self, guild_id: Id<GuildMarker>) -> Result<Arc<AsyncMutex<Player>>, AquaError> {
        self.inner
            .players
            .get(&guild_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(AquaError::PlayerNotFound)
    }

    /// Create (or reuse) a player connected to `options.voice_channel_id`.
    ///
    /// If a player already exists for the guild and its voice channel
    /// matches, it is returned unchanged. If the channel differs, a fresh
    /// join packet is sent to move it. Otherwise a node is chosen via the
    /// configured load-balancing policy and a new player is created.
    ///
    /// # Errors
    ///
    /// Returns [`AquaError::NodesUnconfigured`] if no node is registered.
    pub async fn create_connection(
        &self,
        options: ConnectOptions,
    ) -> Result<Arc<AsyncMutex<Player>>, AquaError> {
        if let Some(existing) = self.inner.players.get(&options.guild_id) {
            let player = Arc::clone(existing.value());
            drop(existing);

            let needs_move = {
                let guard = player.lock().await;
                guard.connection().voice_channel_id() != Some(options.voice_channel_id)
            };

            if needs_move {
                self.send_join(&options);
            }

            if let Some(text_channel_id) = options.text_channel_id {
                let mut guard = player.lock().await;
                let _ = guard.set_text_channel(Some(text_channel_id));
            }

            return Ok(player);
        }

        let node_name = self.choose_node().ok_or(AquaError::NodesUnconfigured)?;
        let info = self.node_handle(&node_name).ok_or(AquaError::NodesUnconfigured)?;

        let mut player = Player::new(
            options.guild_id,
            self.inner.client_id,
            node_name,
            Arc::clone(&info.rest),
        );
        let _ = player.set_text_channel(options.text_channel_id);

        let player = Arc::new(AsyncMutex::new(player));
        self.inner.players.insert(options.guild_id, Arc::clone(&player));

        self.send_join(&options);

        Ok(player)
    }

    fn send_join(&self, options: &ConnectOptions) {
        (self.inner.gateway)(VoiceJoinPacket {
            op: 4,
            guild_id: options.guild_id,
            channel_id: Some(options.voice_channel_id),
            self_deaf: options.self_deaf,
            self_mute: options.self_mute,
        });
    }

    /// Destroy the player for a guild, leaving its voice channel and
    /// deleting its remote counterpart.
    ///
    /// Removes the registry entry before calling [`Player::destroy`] so a
    /// concurrent lookup can never observe a half-destroyed player.
    ///
    /// # Errors
    ///
    /// Returns [`AquaError::PlayerNotFound`] if no player is registered.
    /// Errors from the underlying REST delete are swallowed into the
    /// `Ok` path once the player is already removed from the registry,
    /// matching the "remote state gone" error policy.
    pub async fn destroy_player(&self, guild_id: Id<GuildMarker>) -> Result<(), AquaError> {
        let (_, player) = self
            .inner
            .players
            .remove(&guild_id)
            .ok_or(AquaError::PlayerNotFound)?;

        (self.inner.gateway)(VoiceJoinPacket {
            op: 4,
            guild_id,
            channel_id: None,
            self_deaf: false,
            self_mute: false,
        });

        let _ = player.lock().await.destroy().await;
        Ok(())
    }

    // -- 4.9.2 Gateway voice demux -----------------------------------------

    fn next_tx_id(&self, guild_id: Id<GuildMarker>) -> u64 {
        self.inner
            .tx_ids
            .entry(guild_id)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Arm the null-channel disconnect grace timer for a guild, replacing
    /// any timer already running for it. On expiry, tears the connection
    /// down and destroys the player, since the user never rejoined.
    fn arm_disconnect_grace(&self, guild_id: Id<GuildMarker>) {
        let aqua = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(NULL_CHANNEL_GRACE).await;

            if let Some(player) = aqua.inner.players.get(&guild_id).map(|e| Arc::clone(e.value())) {
                player.lock().await.connection_mut().disconnect();
            }

            let _ = aqua.destroy_player(guild_id).await;
            aqua.inner.disconnect_timers.remove(&guild_id);
        });

        if let Some(previous) = self.inner.disconnect_timers.insert(guild_id, handle) {
            previous.abort();
        }
    }

    /// Cancel a previously armed disconnect grace timer, if one is running.
    fn cancel_disconnect_grace(&self, guild_id: Id<GuildMarker>) {
        if let Some((_, handle)) = self.inner.disconnect_timers.remove(&guild_id) {
            handle.abort();
        }
    }

    /// Route a Discord voice gateway packet to the player it concerns.
    ///
    /// `VOICE_STATE_UPDATE`s for any user other than this orchestrator's
    /// own client id are ignored; updates for guilds with no registered
    /// player are also silently dropped (nothing is listening yet).
    pub async fn update_voice_state(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::State(state) => {
                if state.user_id != self.inner.client_id {
                    return;
                }

                let Some(player) = self.inner.players.get(&state.guild_id).map(|e| Arc::clone(e.value())) else {
                    return;
                };

                let tx_id = self.next_tx_id(state.guild_id);
                let client_id = self.inner.client_id;
                let mut guard = player.lock().await;
                let event = guard.connection_mut().set_state_update(
                    client_id,
                    StateUpdate {
                        session_id: state.session_id,
                        channel_id: state.channel_id,
                        self_deaf: state.self_deaf,
                        self_mute: state.self_mute,
                        tx_id: Some(tx_id),
                    },
                    Instant::now(),
                );

                let _ = guard.flush_voice_update().await;
                drop(guard);

                match event {
                    ConnectionEvent::StartDisconnectGrace => self.arm_disconnect_grace(state.guild_id),
                    ConnectionEvent::DisconnectGraceCancelled => self.cancel_disconnect_grace(state.guild_id),
                    _ => {}
                }
            }
            GatewayEvent::Server(server) => {
                let Some(player) = self.inner.players.get(&server.guild_id).map(|e| Arc::clone(e.value())) else {
                    return;
                };

                let tx_id = self.next_tx_id(server.guild_id);
                let mut guard = player.lock().await;
                let channel_id = guard.connection().voice_channel_id();
                let event = guard.connection_mut().set_server_update(
                    ServerUpdate {
                        endpoint: server.endpoint,
                        token: server.token,
                        channel_id,
                        tx_id: Some(tx_id),
                    },
                    Instant::now(),
                );

                let _ = guard.flush_voice_update().await;

                if event == ConnectionEvent::ScheduleVoiceUpdateAndUnpause {
                    let _ = guard.pause(false).await;
                }

                let region_migration = self.inner.options.auto_region_migrate.then(|| {
                    guard
                        .connection()
                        .region()
                        .map(|region| (region.to_owned(), guard.node_name().to_owned()))
                });
                drop(guard);

                if let Some(Some((region, current_node))) = region_migration {
                    self.maybe_region_migrate(server.guild_id, &region, &current_node).await;
                }
            }
        }
    }

    async fn maybe_region_migrate(&self, guild_id: Id<GuildMarker>, region: &str, current_node: &str) {
        let on_matching_node = self
            .node_handle(current_node)
            .is_some_and(|info| info.regions.iter().any(|r| &**r == region));

        if on_matching_node {
            return;
        }

        if let Some(target) = self.find_best_node_for_region(region, Some(current_node)) {
            self.migrate(guild_id, &target, "region").await;
        }
    }

    // -- 4.9.3 Load balancing -----------------------------------------------

    /// Select the least-loaded node per the configured policy, consulting a
    /// 12 s cache of the full sorted node list.
    #[must_use]
    pub fn choose_node(&self) -> Option<Arc<str>> {
        self.ordered_nodes().into_iter().next()
    }

    fn ordered_nodes(&self) -> Vec<Arc<str>> {
        {
            let cache = self.inner.list_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((at, list)) = cache.as_ref() {
                if at.elapsed() < NODE_LIST_CACHE_TTL {
                    return list.clone();
                }
            }
        }

        let mut names: Vec<Arc<str>> = self.inner.nodes.iter().map(|e| Arc::clone(e.key())).collect();

        match self.inner.options.load_balancer {
            LoadBalancer::LeastRest => names.sort_by_key(|name| {
                self.node_handle(name)
                    .map(|info| info.rest_calls.load(Ordering::Relaxed))
                    .unwrap_or(u64::MAX)
            }),
            LoadBalancer::Random => names.shuffle(&mut rand::thread_rng()),
            LoadBalancer::LeastLoad => names.sort_by(|a, b| {
                let score_a = self.node_handle(a).map(|info| info.score()).unwrap_or(f64::MAX);
                let score_b = self.node_handle(b).map(|info| info.score()).unwrap_or(f64::MAX);
                score_a.total_cmp(&score_b)
            }),
        }

        *self.inner.list_cache.lock().unwrap_or_else(|e| e.into_inner()) = Some((Instant::now(), names.clone()));

        names
    }

    // -- 4.9.4 Region affinity ----------------------------------------------

    /// Connected nodes whose regions include `region`, ascending by load.
    #[must_use]
    pub fn fetch_region(&self, region: &str) -> Vec<Arc<str>> {
        let mut matches: Vec<Arc<str>> = self
            .inner
            .nodes
            .iter()
            .filter(|e| e.value().regions.iter().any(|r| &**r == region))
            .map(|e| Arc::clone(e.key()))
            .collect();

        matches.sort_by(|a, b| {
            let score_a = self.node_handle(a).map(|info| info.score()).unwrap_or(f64::MAX);
            let score_b = self.node_handle(b).map(|info| info.score()).unwrap_or(f64::MAX);
            score_a.total_cmp(&score_b)
        });

        matches
    }

    /// The least-busy node serving `region`, if any, excluding `exclude`.
    #[must_use]
    pub fn find_best_node_for_region(&self, region: &str, exclude: Option<&str>) -> Option<Arc<str>> {
        self.fetch_region(region)
            .into_iter()
            .find(|name| exclude.is_none_or(|excluded| &**name != excluded))
    }

    // -- 4.9.5 Migration & worker failover -----------------------------------

    /// Move the guild's player to `target`, preserving playback state.
    ///
    /// Captures the old player's state, destroys it locally (without a
    /// remote delete, since the new player reuses or replaces it), creates a
    /// new player on `target`, copies voice credentials, and restores
    /// playback. Emits a `playerMigrated` trace entry exactly once.
    pub async fn migrate(&self, guild_id: Id<GuildMarker>, target: &str, reason: &str) {
        let Some(old) = self.inner.players.get(&guild_id).map(|e| Arc::clone(e.value())) else {
            return;
        };

        let Some(target_info) = self.node_handle(target) else {
            return;
        };

        let snapshot = {
            let guard = old.lock().await;
            capture_snapshot(&guard)
        };

        let old_node = {
            let mut guard = old.lock().await;
            let old_node = guard.node_name().to_owned();
            guard.destroy_local();
            old_node
        };

        let mut new_player = Player::new(
            guild_id,
            self.inner.client_id,
            Arc::clone(target_info.name()),
            Arc::clone(target_info.rest()),
        );

        restore_snapshot(&mut new_player, &snapshot, self.inner.options.failover.preserve_position).await;

        let new_player = Arc::new(AsyncMutex::new(new_player));
        self.inner.players.insert(guild_id, Arc::clone(&new_player));

        debug!(%guild_id, from = %old_node, to = %target, reason, "player migrated");

        self.trace_push(
            crate::events::trace_labels::PLAYER_MIGRATED,
            serde_json::json!({ "guildId": guild_id.to_string(), "from": old_node, "to": target, "reason": reason }),
        );
    }

    /// React to a node going offline: capture its players into the broken-
    /// players pool and fail them over to other nodes in bounded-size
    /// concurrent batches.
    ///
    /// Respects [`FailoverOptions::cooldown`] between consecutive attempts
    /// for the same node and gives up once [`FailoverOptions::max_attempts`]
    /// is reached, leaving the node's players in the broken pool for a
    /// human or a later `ready` to rebuild.
    pub async fn handle_node_disconnected(&self, node_name: &str) {
        let Some(info) = self.node_handle(node_name) else {
            return;
        };

        {
            let mut last = info.last_failover.lock().unwrap_or_else(|e| e.into_inner());
            if last.is_some_and(|at| at.elapsed() < self.inner.options.failover.cooldown) {
                return;
            }
            *last = Some(Instant::now());
        }

        if info.failed_attempts.fetch_add(1, Ordering::Relaxed) >= u64::from(self.inner.options.failover.max_attempts) {
            warn!(node = %node_name, "node failover attempts exhausted, abandoning");
            self.trace_push(
                crate::events::trace_labels::NODE_FAILOVER_ABANDONED,
                serde_json::json!({ "node": node_name }),
            );
            return;
        }

        warn!(node = %node_name, "node disconnected, failing players over");

        self.trace_push(crate::events::trace_labels::NODE_FAILOVER, serde_json::json!({ "node": node_name }));

        let affected: Vec<Id<GuildMarker>> = self
            .inner
            .players
            .iter()
            .filter(|e| e.value().try_lock().ok().is_some_and(|p| p.node_name() == node_name))
            .map(|e| *e.key())
            .collect();

        let mut ok = 0usize;
        let mut failed = 0usize;

        for batch in affected.chunks(self.inner.options.failover.max_concurrent_ops) {
            for &guild_id in batch {
                if self.capture_broken_player(guild_id, node_name).await {
                    ok += 1;
                } else {
                    failed += 1;
                }
            }
        }

        self.trace_push(
            crate::events::trace_labels::NODE_FAILOVER_COMPLETE,
            serde_json::json!({ "node": node_name, "ok": ok, "failed": failed }),
        );
    }

    async fn capture_broken_player(&self, guild_id: Id<GuildMarker>, node_name: &str) -> bool {
        let Some((_, player)) = self.inner.players.remove(&guild_id) else {
            return false;
        };

        let snapshot = {
            let mut guard = player.lock().await;
            let snapshot = capture_snapshot(&guard);
            guard.destroy_local();
            snapshot
        };

        self.inner.broken_players.insert(
            guild_id,
            BrokenPlayer {
                original_node: node_name.into(),
                broken_at: Instant::now(),
                snapshot,
            },
        );

        true
    }

    // -- 4.9.6 Broken-players pool -------------------------------------------

    /// Rebuild every broken player captured from `node_name`, now that the
    /// node is ready again. Rebuilds are serialized per-guild by a lock set
    /// so a concurrent rebuild attempt for the same guild cannot race.
    pub async fn rebuild_broken_players(&self, node_name: &str) {
        let candidates: Vec<Id<GuildMarker>> = self
            .inner
            .broken_players
            .iter()
            .filter(|e| &*e.value().original_node == node_name)
            .filter(|e| e.value().broken_at.elapsed() < BROKEN_PLAYER_TTL)
            .map(|e| *e.key())
            .collect();

        for guild_id in candidates {
            let lock = self
                .inner
                .rebuild_locks
                .entry(guild_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone();
            let _guard = lock.lock().await;

            let Some((_, broken)) = self.inner.broken_players.remove(&guild_id) else {
                continue;
            };

            if broken.broken_at.elapsed() >= BROKEN_PLAYER_TTL {
                continue;
            }

            let _ = self.restore_player(node_name, broken.snapshot).await;
        }

        self.inner.rebuild_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Re-create a player on `node_name` from a captured or persisted
    /// snapshot, replacing any existing registry entry for its guild.
    ///
    /// # Errors
    ///
    /// Returns [`AquaError::NodeNotFound`] if `node_name` is not registered.
    pub async fn restore_player(&self, node_name: &str, snapshot: PlayerSnapshot) -> Result<(), AquaError> {
        let info = self.node_handle(node_name).ok_or(AquaError::NodeNotFound)?;
        let guild_id = snapshot.guild_id;

        let mut player = Player::new(guild_id, self.inner.client_id, Arc::clone(info.name()), Arc::clone(info.rest()));
        restore_snapshot(&mut player, &snapshot, self.inner.options.failover.preserve_position).await;

        self.inner.players.insert(guild_id, Arc::new(AsyncMutex::new(player)));
        Ok(())
    }

    /// Every registered node's name paired with its current REST session
    /// id, for the header line of a durable save.
    #[must_use]
    pub fn node_sessions(&self) -> Vec<(Arc<str>, Option<Box<str>>)> {
        self.inner
            .nodes
            .iter()
            .map(|e| (Arc::clone(e.key()), e.value().rest.session_id()))
            .collect()
    }

    /// Apply a previously-persisted session id to a registered node, so its
    /// next websocket connection attempts a resume rather than a cold start.
    pub fn set_node_session(&self, node_name: &str, session_id: &str) {
        if let Some(info) = self.node_handle(node_name) {
            info.rest.set_session_id(session_id.to_owned());
        }
    }

    /// Snapshot every currently registered player, for durable persistence.
    pub async fn capture_all(&self) -> Vec<PlayerSnapshot> {
        let players: Vec<Arc<AsyncMutex<Player>>> =
            self.inner.players.iter().map(|e| Arc::clone(e.value())).collect();

        let mut snapshots = Vec::with_capacity(players.len());
        for player in players {
            let guard = player.lock().await;
            snapshots.push(capture_snapshot(&guard));
        }
        snapshots
    }

    /// Call after a node's websocket reports its close code, dispatching
    /// to the appropriate side effect (reconnect, destroy-and-failover).
    pub async fn handle_node_close(&self, node_name: &str, action: CloseAction) {
        match action {
            CloseAction::Destroy { .. } => {
                self.handle_node_disconnected(node_name).await;
            }
            CloseAction::Reconnect { .. } => {}
        }
    }

    /// Call after a node's websocket reports a `ready` frame, rebuilding any
    /// broken players and, if the session was not resumed, destroying every
    /// player still locally bound to it (its remote state is gone).
    pub async fn handle_node_ready(&self, node_name: &str, session_invalidated: bool) {
        if let Some(info) = self.node_handle(node_name) {
            info.failed_attempts.store(0, Ordering::Relaxed);
        }

        self.trace_push(
            crate::events::trace_labels::NODE_READY,
            serde_json::json!({ "node": node_name, "sessionInvalidated": session_invalidated }),
        );

        if session_invalidated {
            let stale: Vec<Id<GuildMarker>> = self
                .inner
                .players
                .iter()
                .filter(|e| e.value().try_lock().ok().is_some_and(|p| p.node_name() == node_name))
                .map(|e| *e.key())
                .collect();

            for guild_id in stale {
                let _ = self.destroy_player(guild_id).await;
            }
        }

        self.rebuild_broken_players(node_name).await;
    }

    // -- 4.9.9 Tracing --------------------------------------------------------

    fn trace_push(&self, event: &'static str, data: serde_json::Value) {
        let mut trace = self.inner.trace.lock().unwrap_or_else(|e| e.into_inner());
        trace.push_back(TraceEntry {
            seq: self.inner.trace_seq.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: now_ms(),
            event,
            data,
        });

        while trace.len() > self.inner.trace_capacity {
            trace.pop_front();
        }
    }

    /// The last `n` trace entries, oldest first.
    #[must_use]
    pub fn get_trace(&self, n: usize) -> Vec<TraceEntry> {
        let trace = self.inner.trace.lock().unwrap_or_else(|e| e.into_inner());
        trace.iter().rev().take(n).rev().cloned().collect()
    }
}

/// Capture `player`'s user-visible state for migration or persistence.
#[must_use]
pub fn capture_snapshot(player: &Player) -> PlayerSnapshot {
    let playing = player.current().is_some();
    let duration_ms = player
        .current()
        .and_then(Track::info)
        .map(|info| info.length as i64);

    PlayerSnapshot {
        guild_id: player.guild_id(),
        text_channel_id: player.text_channel_id(),
        voice_channel_id: player.connection().voice_channel_id(),
        volume: player.volume(),
        paused: player.is_paused(),
        position_adjusted: position_adjusted(
            player.position(),
            playing,
            player.is_paused(),
            now_ms(),
            now_ms(),
            duration_ms,
        ),
        current: player.current().cloned(),
        queue_snapshot: player.queue().to_array(),
        loop_mode: player.loop_mode(),
        shuffle: false,
        deaf: false,
        connected: !player.connection().is_disconnecting() && player.connection().voice_channel_id().is_some(),
    }
}

/// Restore a freshly-created player from a captured snapshot: volume first,
/// then the queue, then (if `preserve_position` and a current track was
/// captured) play it and seek once it reports a start. Errors are ignored
/// here; the caller observes them via the usual node event stream once
/// play/seek requests land.
pub async fn restore_snapshot(player: &mut Player, snapshot: &PlayerSnapshot, preserve_position: bool) {
    let _ = player.set_text_channel(snapshot.text_channel_id);
    let _ = player.set_loop(snapshot.loop_mode);

    for track in &snapshot.queue_snapshot {
        player.queue_mut().enqueue(track.clone());
    }

    let _ = player.set_volume(snapshot.volume).await;

    if preserve_position {
        if let Some(current) = snapshot.current.clone() {
            if player.play(current, false).await.is_ok() {
                let _ = player.seek(snapshot.position_adjusted).await;
                if snapshot.paused {
                    let _ = player.pause(true).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(system_load: f64, cores: usize, playing: u64, used: u64, reservable: u64) -> WireStats {
        use crate::model::incoming::{Opcode, StatsCpu, StatsMemory};

        WireStats {
            op: Opcode::Stats,
            cpu: StatsCpu {
                cores: Some(cores),
                lavalink_load: Some(0.0),
                system_load: Some(system_load),
            },
            frame_stats: None,
            memory: StatsMemory {
                allocated: Some(0),
                free: Some(0),
                reservable: Some(reservable),
                used: Some(used),
            },
            players: Some(playing),
            playing_players: Some(playing),
            uptime: Some(0),
        }
    }

    #[test]
    fn composite_score_matches_formula() {
        let s = stats(2.0, 4, 3, 500, 1000);
        let score = composite_score(&s, 200);
        let expected = 100.0 * 2.0 / 4.0 + 0.75 * 3.0 + 40.0 * 0.5 + 0.001 * 200.0;
        assert!((score - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn position_adjusted_accounts_for_elapsed_time_while_playing() {
        let adjusted = position_adjusted(1_000, true, false, 10_000, 13_500, Some(60_000));
        assert_eq!(adjusted, 4_500);
    }

    #[test]
    fn position_adjusted_freezes_while_paused() {
        let adjusted = position_adjusted(1_000, true, true, 10_000, 13_500, Some(60_000));
        assert_eq!(adjusted, 1_000);
    }

    #[test]
    fn position_adjusted_clamps_to_duration() {
        let adjusted = position_adjusted(59_000, true, false, 0, 5_000, Some(60_000));
        assert_eq!(adjusted, 60_000);
    }

    #[test]
    fn stats_merge_keeps_previous_value_for_missing_fields() {
        use crate::model::incoming::Opcode;

        let full = stats(1.0, 4, 2, 500, 1000);
        let sparse = WireStats {
            op: Opcode::Stats,
            cpu: crate::model::incoming::StatsCpu {
                cores: None,
                lavalink_load: None,
                system_load: Some(3.0),
            },
            frame_stats: None,
            memory: crate::model::incoming::StatsMemory {
                allocated: None,
                free: None,
                reservable: None,
                used: None,
            },
            players: None,
            playing_players: None,
            uptime: None,
        };

        let merged = sparse.merge(&full);
        assert_eq!(merged.cpu.system_load, Some(3.0));
        assert_eq!(merged.cpu.cores, Some(4));
        assert_eq!(merged.memory.used, Some(500));
        assert_eq!(merged.playing_players, Some(2));
    }

    #[test]
    fn trace_ring_buffer_is_bounded() {
        let aqua = Aqua::new(Id::new(1), AquaOptions::default(), Arc::new(|_| {}), Arc::new(|_| {}));
        for i in 0..5 {
            aqua.trace_push("test", serde_json::json!({ "i": i }));
        }
        let all = aqua.get_trace(100);
        assert_eq!(all.len(), 5);
        assert_eq!(all.first().unwrap().seq, 0);
    }
}
