//! The per-player voice state machine: reconciles gateway voice credentials
//! with a worker and schedules voice updates.

use crate::model::incoming::VoiceState as WireVoiceState;
use crate::payload_pool::PayloadPool;
use bitflags::bitflags;
use std::time::{Duration, Instant};
use twilight_model::id::{
    marker::{ChannelMarker, GuildMarker},
    Id,
};

/// How long voice credentials remain valid without a refresh.
pub const VOICE_DATA_TIMEOUT: Duration = Duration::from_secs(90);
/// Grace period after a null-channel state update before treating the
/// player as disconnected.
pub const NULL_CHANNEL_GRACE: Duration = Duration::from_millis(15_000);
/// Debounce window collapsing bursts of voice-update triggers into one send.
pub const VOICE_FLUSH_DELAY: Duration = Duration::from_millis(50);
/// Maximum number of resume attempts before giving up and disconnecting.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Maximum number of consecutive resume failures tolerated before
/// disconnecting, independent of the attempt counter.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Base delay used by the resume backoff formula.
pub const RECONNECT_DELAY_BASE: Duration = Duration::from_millis(1000);
/// Ceiling on the resume backoff delay.
pub const RESUME_BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Minimum spacing between repeated voice-state re-request asks.
pub const VOICE_STATE_REQUEST_INTERVAL: Duration = Duration::from_millis(1500);

bitflags! {
    /// Bitset of transient connection states.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ConnectionFlags: u8 {
        /// The connection currently believes it is connected to voice.
        const CONNECTED = 1 << 0;
        /// A voice update has been scheduled and is awaiting its flush.
        const UPDATE_SCHEDULED = 1 << 1;
        /// The connection is in the process of tearing down.
        const DISCONNECTING = 1 << 2;
        /// A resume attempt is currently in flight.
        const ATTEMPTING_RESUME = 1 << 3;
        /// Voice credentials have gone stale and must not be trusted.
        const VOICE_DATA_STALE = 1 << 4;
        /// Waiting out the null-channel grace period before disconnecting.
        const WAITING_FOR_DISCONNECT = 1 << 5;
    }
}

/// A gateway `VOICE_SERVER_UPDATE` payload.
#[derive(Clone, Debug)]
pub struct ServerUpdate {
    /// The new voice endpoint hostname.
    pub endpoint: Option<String>,
    /// The new voice token.
    pub token: String,
    /// The voice channel id, if the gateway included one.
    pub channel_id: Option<Id<ChannelMarker>>,
    /// A per-generation stamp used to drop stale packets.
    pub tx_id: Option<u64>,
}

/// A gateway `VOICE_STATE_UPDATE` payload, pre-filtered to the bot's own
/// user id.
#[derive(Clone, Debug)]
pub struct StateUpdate {
    /// The Discord voice session id.
    pub session_id: String,
    /// The voice channel the user is now in, or `None` if they left.
    pub channel_id: Option<Id<ChannelMarker>>,
    /// Whether the user is server-deafened.
    pub self_deaf: bool,
    /// Whether the user is server-muted.
    pub self_mute: bool,
    /// A per-generation stamp used to drop stale packets.
    pub tx_id: Option<u64>,
}

/// What the owning player should do in reaction to a `setServerUpdate` or
/// `setStateUpdate` call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    /// Nothing observable changed; no action required.
    Ignored,
    /// The update was applied; schedule a voice update flush.
    ScheduleVoiceUpdate,
    /// A voice server update was applied; schedule a voice update flush and,
    /// if the owning player was paused, unpause it, since the server change
    /// means the stream must be reopened.
    ScheduleVoiceUpdateAndUnpause,
    /// The voice channel changed; the player should emit a move event in
    /// addition to scheduling a voice update.
    ChannelMoved,
    /// The user left the voice channel; a disconnect grace timer should be
    /// started (or, if already running, left alone).
    StartDisconnectGrace,
    /// A previously started disconnect grace period was cancelled because
    /// the user rejoined a channel.
    DisconnectGraceCancelled,
}

/// The per-player voice state machine described in the component design as
/// `Connection`.
#[derive(Debug)]
pub struct Connection {
    guild_id: Id<GuildMarker>,
    client_id: Id<twilight_model::id::marker::UserMarker>,
    session_id: Option<String>,
    endpoint: Option<String>,
    token: Option<String>,
    region: Option<String>,
    voice_channel_id: Option<Id<ChannelMarker>>,
    sequence: u64,
    tx_id: u64,
    state_generation: u64,
    flags: ConnectionFlags,
    last_endpoint: Option<String>,
    last_voice_data_update: Option<Instant>,
    reconnect_attempts: u32,
    consecutive_failures: u32,
    last_sent_voice_key: Option<String>,
    last_voice_state_request: Option<Instant>,
    voice_payload_pool: PayloadPool<WireVoiceState>,
}

impl Connection {
    /// Create a fresh, unconnected state machine for `guild_id`.
    #[must_use]
    pub fn new(
        guild_id: Id<GuildMarker>,
        client_id: Id<twilight_model::id::marker::UserMarker>,
    ) -> Self {
        Self {
            guild_id,
            client_id,
            session_id: None,
            endpoint: None,
            token: None,
            region: None,
            voice_channel_id: None,
            sequence: 0,
            tx_id: 0,
            state_generation: 0,
            flags: ConnectionFlags::empty(),
            last_endpoint: None,
            last_voice_data_update: None,
            reconnect_attempts: 0,
            consecutive_failures: 0,
            last_sent_voice_key: None,
            last_voice_state_request: None,
            voice_payload_pool: PayloadPool::new(),
        }
    }

    /// The guild this connection belongs to.
    #[must_use]
    pub const fn guild_id(&self) -> Id<GuildMarker> {
        self.guild_id
    }

    /// The current voice channel, if known.
    #[must_use]
    pub const fn voice_channel_id(&self) -> Option<Id<ChannelMarker>> {
        self.voice_channel_id
    }

    /// The region code derived from the current endpoint, if connected.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Whether voice credentials are present and not expired.
    #[must_use]
    pub fn has_valid_voice_data(&self, now: Instant) -> bool {
        self.session_id.is_some()
            && self.endpoint.is_some()
            && self.token.is_some()
            && self
                .last_voice_data_update
                .is_some_and(|updated| now.saturating_duration_since(updated) <= VOICE_DATA_TIMEOUT)
    }

    /// Whether this connection has been marked as disconnecting.
    #[must_use]
    pub fn is_disconnecting(&self) -> bool {
        self.flags.contains(ConnectionFlags::DISCONNECTING)
    }

    /// Whether a resume attempt is currently in flight.
    #[must_use]
    pub fn is_attempting_resume(&self) -> bool {
        self.flags.contains(ConnectionFlags::ATTEMPTING_RESUME)
    }

    /// Apply a `VOICE_SERVER_UPDATE`, per the gating rules in order.
    pub fn set_server_update(&mut self, data: ServerUpdate, now: Instant) -> ConnectionEvent {
        if self.flags.contains(ConnectionFlags::DISCONNECTING) {
            return ConnectionEvent::Ignored;
        }

        let Some(endpoint) = data.endpoint.filter(|endpoint| !endpoint.is_empty()) else {
            return ConnectionEvent::Ignored;
        };

        if data.token.is_empty() {
            return ConnectionEvent::Ignored;
        }

        if let Some(tx_id) = data.tx_id {
            if tx_id < self.tx_id {
                return ConnectionEvent::Ignored;
            }
        }

        if self.endpoint.as_deref() == Some(endpoint.as_str())
            && self.token.as_deref() == Some(data.token.as_str())
        {
            return ConnectionEvent::Ignored;
        }

        self.state_generation += 1;

        if self.last_endpoint.as_deref() != Some(endpoint.as_str()) {
            self.sequence = 0;
            self.reconnect_attempts = 0;
            self.consecutive_failures = 0;
            self.region = Some(extract_region(&endpoint));
        }

        self.token = Some(data.token);
        self.last_endpoint = Some(endpoint.clone());
        self.endpoint = Some(endpoint);
        self.last_voice_data_update = Some(now);
        self.flags.remove(ConnectionFlags::VOICE_DATA_STALE);

        if let Some(channel_id) = data.channel_id {
            self.voice_channel_id = Some(channel_id);
        }

        ConnectionEvent::ScheduleVoiceUpdateAndUnpause
    }

    /// Apply a `VOICE_STATE_UPDATE`, already pre-filtered to this client's
    /// own user id by the orchestrator.
    pub fn set_state_update(
        &mut self,
        user_id: Id<twilight_model::id::marker::UserMarker>,
        data: StateUpdate,
        now: Instant,
    ) -> ConnectionEvent {
        if user_id != self.client_id {
            return ConnectionEvent::Ignored;
        }

        if data.channel_id.is_none() {
            let already_waiting = self.flags.contains(ConnectionFlags::WAITING_FOR_DISCONNECT);
            self.flags.insert(ConnectionFlags::WAITING_FOR_DISCONNECT);

            return if already_waiting {
                ConnectionEvent::Ignored
            } else {
                ConnectionEvent::StartDisconnectGrace
            };
        }

        let was_waiting = self.flags.remove(ConnectionFlags::WAITING_FOR_DISCONNECT);
        let channel_moved = self.voice_channel_id != data.channel_id;
        let session_changed = self.session_id.as_deref() != Some(data.session_id.as_str());

        self.voice_channel_id = data.channel_id;
        self.session_id = Some(data.session_id);

        if session_changed {
            self.last_voice_data_update = Some(now);
        }

        self.flags.insert(ConnectionFlags::CONNECTED);

        if was_waiting {
            ConnectionEvent::DisconnectGraceCancelled
        } else if channel_moved {
            ConnectionEvent::ChannelMoved
        } else if session_changed {
            ConnectionEvent::ScheduleVoiceUpdate
        } else {
            ConnectionEvent::Ignored
        }
    }

    /// Build the wire voice payload to send, and the fingerprint it would
    /// be sent under. Returns `None` if credentials aren't valid yet.
    ///
    /// The payload is acquired from and released back to this connection's
    /// [`PayloadPool`] rather than allocated fresh each call; the value
    /// returned to the caller is a clone of the pooled, filled-in payload.
    ///
    /// The caller is responsible for comparing the fingerprint against
    /// [`Self::last_sent_voice_key`] and calling [`Self::mark_voice_sent`]
    /// once the update actually reaches the worker.
    #[must_use]
    pub fn pending_voice_payload(&mut self, volume: i64) -> Option<(WireVoiceState, String)> {
        let session_id = self.session_id.clone()?;
        let endpoint = self.endpoint.clone()?;
        let token = self.token.clone()?;

        let fingerprint = format!(
            "{session_id}:{token}:{endpoint}:{:?}:{volume}",
            self.voice_channel_id
        );

        let mut payload = self.voice_payload_pool.acquire();
        payload.token = token;
        payload.endpoint = endpoint;
        payload.session_id = session_id;

        let outgoing = payload.clone();
        self.voice_payload_pool.release(payload);

        Some((outgoing, fingerprint))
    }

    /// Whether `fingerprint` differs from the last one actually sent.
    #[must_use]
    pub fn should_send(&self, fingerprint: &str) -> bool {
        self.last_sent_voice_key.as_deref() != Some(fingerprint)
    }

    /// Record that a voice update with `fingerprint` was sent.
    pub fn mark_voice_sent(&mut self, fingerprint: String) {
        self.last_sent_voice_key = Some(fingerprint);
        self.flags.remove(ConnectionFlags::UPDATE_SCHEDULED);
    }

    /// Mark that a voice update flush has been scheduled, to avoid
    /// re-arming the debounce timer redundantly.
    pub fn mark_update_scheduled(&mut self) -> bool {
        let already = self.flags.contains(ConnectionFlags::UPDATE_SCHEDULED);
        self.flags.insert(ConnectionFlags::UPDATE_SCHEDULED);
        !already
    }

    /// Whether an `attemptResume` call should proceed given current state.
    #[must_use]
    pub fn can_attempt_resume(&self, now: Instant) -> bool {
        !self.flags.contains(ConnectionFlags::DISCONNECTING)
            && !self.flags.contains(ConnectionFlags::ATTEMPTING_RESUME)
            && self.reconnect_attempts < MAX_RECONNECT_ATTEMPTS
            && self.has_valid_voice_data(now)
    }

    /// Whether enough time has passed to re-ask for a fresh voice state.
    #[must_use]
    pub fn should_request_voice_state(&self, now: Instant) -> bool {
        self.last_voice_state_request
            .is_none_or(|last| now.saturating_duration_since(last) >= VOICE_STATE_REQUEST_INTERVAL)
    }

    /// Record that a voice-state re-request was just sent.
    pub fn mark_voice_state_requested(&mut self, now: Instant) {
        self.last_voice_state_request = Some(now);
    }

    /// Snapshot the generation counter before starting a resume attempt, and
    /// mark a resume as in flight.
    pub fn begin_resume_attempt(&mut self) -> u64 {
        self.flags.insert(ConnectionFlags::ATTEMPTING_RESUME);
        self.reconnect_attempts += 1;
        self.state_generation
    }

    /// Whether the state generation changed since a resume attempt began,
    /// meaning the attempt's result should be discarded.
    #[must_use]
    pub fn generation_changed(&self, snapshot: u64) -> bool {
        self.state_generation != snapshot
    }

    /// Record a successful resume: clears all failure counters.
    pub fn resume_succeeded(&mut self) {
        self.flags.remove(ConnectionFlags::ATTEMPTING_RESUME);
        self.reconnect_attempts = 0;
        self.consecutive_failures = 0;
    }

    /// Record a failed resume attempt, returning the backoff delay to wait
    /// before the next attempt, or `None` if limits have been exhausted and
    /// the connection should disconnect instead.
    pub fn resume_failed(&mut self) -> Option<Duration> {
        self.flags.remove(ConnectionFlags::ATTEMPTING_RESUME);
        self.consecutive_failures += 1;

        if self.reconnect_attempts < MAX_RECONNECT_ATTEMPTS
            && self.consecutive_failures < MAX_CONSECUTIVE_FAILURES
        {
            let exponent = self.reconnect_attempts.saturating_sub(1);
            let scaled = RECONNECT_DELAY_BASE.saturating_mul(1u32 << exponent.min(16));
            Some(scaled.min(RESUME_BACKOFF_MAX))
        } else {
            None
        }
    }

    /// Tear the connection down: clears credentials and timers, marks the
    /// state stale.
    pub fn disconnect(&mut self) {
        self.flags.insert(ConnectionFlags::DISCONNECTING);
        self.session_id = None;
        self.endpoint = None;
        self.token = None;
        self.flags.insert(ConnectionFlags::VOICE_DATA_STALE);
        self.flags.remove(ConnectionFlags::CONNECTED);
        self.flags.remove(ConnectionFlags::DISCONNECTING);
    }
}

/// Extract a short region code from a worker-observed voice endpoint
/// hostname, e.g. `c-gru20-abc.example` → `gru`.
///
/// Strips scheme, path, and port, lowercases the first label, and tries in
/// order: the canonical `c-<aaa><digits>-` pattern, any bare
/// `-<aaa><digits>-` token, or the first label with trailing digits
/// stripped. Falls back to `"unknown"`.
#[must_use]
pub fn extract_region(endpoint: &str) -> String {
    let without_scheme = endpoint.split("://").next_back().unwrap_or(endpoint);
    let host = without_scheme
        .split(['/', '?'])
        .next()
        .unwrap_or(without_scheme);
    let host = host.rsplit_once(':').map_or(host, |(host, _)| host);
    let first_label = host.split('.').next().unwrap_or(host).to_lowercase();

    if let Some(region) = extract_canonical(&first_label) {
        return region;
    }

    if let Some(region) = extract_bare_token(&first_label) {
        return region;
    }

    let trimmed = first_label.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() >= 3 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return trimmed.to_owned();
    }

    "unknown".to_owned()
}

fn extract_canonical(label: &str) -> Option<String> {
    let rest = label.strip_prefix("c-")?;
    extract_bare_token(&format!("-{rest}"))
}

fn extract_bare_token(label: &str) -> Option<String> {
    for part in label.split('-') {
        let letters: String = part.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
        let digits_follow = part[letters.len()..].chars().all(|c| c.is_ascii_digit());

        if letters.len() == 3 && digits_follow && !letters.is_empty() {
            return Some(letters);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_extraction_is_stable() {
        assert_eq!(extract_region("c-gru20-abc.example"), "gru");
        assert_eq!(
            extract_region("c-gru20-abc.example"),
            extract_region("c-gru20-abc.example")
        );
    }

    #[test]
    fn region_extraction_falls_back_to_unknown() {
        assert_eq!(extract_region("1.2.3.4"), "unknown");
    }

    #[test]
    fn region_extraction_strips_trailing_digits() {
        assert_eq!(extract_region("iad123.example.com"), "iad");
    }

    fn connection() -> Connection {
        Connection::new(Id::new(1), Id::new(2))
    }

    #[test]
    fn stale_tx_id_is_ignored() {
        let mut conn = connection();
        let now = Instant::now();

        let first = ServerUpdate {
            endpoint: Some("c-iad01-x.example".into()),
            token: "T1".into(),
            channel_id: None,
            tx_id: Some(5),
        };
        assert_eq!(
            conn.set_server_update(first, now),
            ConnectionEvent::ScheduleVoiceUpdateAndUnpause
        );

        let stale = ServerUpdate {
            endpoint: Some("c-gru20-y.example".into()),
            token: "T2".into(),
            channel_id: None,
            tx_id: Some(1),
        };
        assert_eq!(conn.set_server_update(stale, now), ConnectionEvent::Ignored);
    }

    #[test]
    fn unchanged_server_update_is_ignored() {
        let mut conn = connection();
        let now = Instant::now();
        let update = ServerUpdate {
            endpoint: Some("c-iad01-x.example".into()),
            token: "T1".into(),
            channel_id: None,
            tx_id: None,
        };

        assert_eq!(
            conn.set_server_update(update.clone(), now),
            ConnectionEvent::ScheduleVoiceUpdateAndUnpause
        );
        assert_eq!(conn.set_server_update(update, now), ConnectionEvent::Ignored);
    }

    #[test]
    fn voice_data_is_valid_only_within_timeout() {
        let mut conn = connection();
        let now = Instant::now();
        conn.set_server_update(
            ServerUpdate {
                endpoint: Some("c-iad01-x.example".into()),
                token: "T1".into(),
                channel_id: None,
                tx_id: None,
            },
            now,
        );
        conn.set_state_update(
            Id::new(2),
            StateUpdate {
                session_id: "S1".into(),
                channel_id: Some(Id::new(3)),
                self_deaf: false,
                self_mute: false,
                tx_id: None,
            },
            now,
        );

        assert!(conn.has_valid_voice_data(now));
        assert!(!conn.has_valid_voice_data(now + VOICE_DATA_TIMEOUT + Duration::from_secs(1)));
    }

    #[test]
    fn voice_update_fingerprint_dedupes_identical_sends() {
        let mut conn = connection();
        let now = Instant::now();
        conn.set_server_update(
            ServerUpdate {
                endpoint: Some("c-iad01-x.example".into()),
                token: "T1".into(),
                channel_id: None,
                tx_id: None,
            },
            now,
        );
        conn.set_state_update(
            Id::new(2),
            StateUpdate {
                session_id: "S1".into(),
                channel_id: Some(Id::new(3)),
                self_deaf: false,
                self_mute: false,
                tx_id: None,
            },
            now,
        );

        let (_, fingerprint) = conn.pending_voice_payload(100).unwrap();
        assert!(conn.should_send(&fingerprint));
        conn.mark_voice_sent(fingerprint.clone());
        assert!(!conn.should_send(&fingerprint));
    }

    #[test]
    fn null_channel_then_rejoin_starts_then_cancels_grace() {
        let mut conn = connection();
        let now = Instant::now();

        conn.set_state_update(
            Id::new(2),
            StateUpdate {
                session_id: "S1".into(),
                channel_id: Some(Id::new(3)),
                self_deaf: false,
                self_mute: false,
                tx_id: None,
            },
            now,
        );

        assert_eq!(
            conn.set_state_update(
                Id::new(2),
                StateUpdate {
                    session_id: "S1".into(),
                    channel_id: None,
                    self_deaf: false,
                    self_mute: false,
                    tx_id: None,
                },
                now,
            ),
            ConnectionEvent::StartDisconnectGrace
        );

        assert_eq!(
            conn.set_state_update(
                Id::new(2),
                StateUpdate {
                    session_id: "S1".into(),
                    channel_id: None,
                    self_deaf: false,
                    self_mute: false,
                    tx_id: None,
                },
                now,
            ),
            ConnectionEvent::Ignored
        );

        assert_eq!(
            conn.set_state_update(
                Id::new(2),
                StateUpdate {
                    session_id: "S1".into(),
                    channel_id: Some(Id::new(3)),
                    self_deaf: false,
                    self_mute: false,
                    tx_id: None,
                },
                now,
            ),
            ConnectionEvent::DisconnectGraceCancelled
        );
    }

    #[test]
    fn resume_backoff_is_bounded() {
        let mut conn = connection();
        conn.reconnect_attempts = 1;
        let first = conn.resume_failed().unwrap();
        assert_eq!(first, Duration::from_millis(1000));

        conn.reconnect_attempts = 2;
        let second = conn.resume_failed().unwrap();
        assert_eq!(second, Duration::from_millis(2000));

        conn.reconnect_attempts = MAX_RECONNECT_ATTEMPTS;
        conn.consecutive_failures = MAX_CONSECUTIVE_FAILURES - 1;
        assert!(conn.resume_failed().is_none());
    }
}
