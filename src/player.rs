//! A single guild's playback session: queue, currently playing track, and
//! the REST-driven reconciliation of that state with a worker node.
//!
//! A [`Player`] owns its [`Connection`] and is meant to live behind a single
//! task's mailbox; none of its methods take `&self` behind a lock; the
//! owning task calls them serially as commands and node events arrive.

use crate::{
    batcher::{BatchOutcome, UpdateBatcher},
    circular_buffer::CircularBuffer,
    connection::Connection,
    error::{PlayerError, PlayerErrorType},
    http::{RestClient, Track as WireTrack, UpdatePlayerTrack},
    model::{
        incoming::{PlayerUpdateState, TrackEndReason},
        outgoing::UpdatePlayer,
    },
    queue::Queue,
    track::Track,
};
use std::{sync::Arc, time::Duration};
use twilight_model::id::{
    marker::{ChannelMarker, GuildMarker, UserMarker},
    Id,
};

/// Number of previously played tracks retained for [`Player::replay`].
pub const HISTORY_CAPACITY: usize = 50;

/// Maximum number of consecutive autoplay advances attempted after a track
/// ends with an empty queue, before autoplay gives up for this player.
///
/// Bounds a pathological loop where every "related track" lookup itself
/// fails to load.
pub const AUTOPLAY_MAX: u32 = 3;

/// Base delay for the socket-closed reconnection backoff.
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(1500);
/// Ceiling on the socket-closed reconnection backoff.
pub const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(5000);
/// Maximum number of socket-closed reconnection attempts before the player
/// gives up and disconnects.
pub const RECONNECT_MAX: u32 = 3;

/// How often the voice watchdog checks connection health.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);
/// How long voice data may go unrefreshed before the watchdog considers the
/// connection down.
pub const VOICE_DOWN_THRESHOLD: Duration = Duration::from_secs(10);
/// Multiplier applied to [`VOICE_DOWN_THRESHOLD`] before the watchdog gives
/// up and abandons the player outright.
pub const VOICE_ABANDON_MULTIPLIER: u32 = 3;

/// How a player loops its queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum LoopMode {
    /// Play through the queue once.
    #[default]
    None,
    /// Repeat the current track indefinitely.
    Track,
    /// Replay the queue from the top once it's exhausted.
    Queue,
}

impl LoopMode {
    /// Parse a loop mode from its wire/CLI name (`"none"`, `"track"`,
    /// `"queue"`, case-insensitively).
    pub fn parse(value: &str) -> Result<Self, PlayerError> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "track" => Ok(Self::Track),
            "queue" => Ok(Self::Queue),
            _ => Err(PlayerError::from_kind(PlayerErrorType::InvalidLoopMode)),
        }
    }
}

/// What the owning task should do after a track-end style event has been
/// handled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TrackEndAction {
    /// Nothing further to do; a replacement is already playing.
    None,
    /// The next queued track should be sent with [`Player::play`].
    PlayNext(Track),
    /// The queue was empty going into a `loadFailed`/`cleanup` end; all
    /// player data was cleared and a `queueEnd` should be surfaced.
    QueueEnded,
    /// The queue is empty and autoplay is disabled, exhausted, or the
    /// ending reason was a replacement; playback has stopped.
    Idle,
}

/// Voice-gateway close codes that a node forwards via `socketClosed`.
mod voice_close_code {
    /// The voice session was invalidated; the node's side is gone.
    pub const SESSION_INVALIDATED: u64 = 4022;
    /// The voice server crashed; a resume may still succeed.
    pub const SERVER_CRASHED: u64 = 4015;
    /// Codes that call for the full voice-session reconnection sequence.
    pub const RECONNECT_SEQUENCE: [u64; 3] = [4014, 4009, 4006];
}

/// What the owning task should do after a `socketClosed` event, per the
/// close-code reaction table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketClosedAction {
    /// Surface the event and destroy the player; the remote session is
    /// gone.
    Destroy,
    /// Attempt `Connection::attemptResume`; fall through to
    /// [`Self::ReconnectSequence`] on failure.
    AttemptResume,
    /// Run the full voice-session reconnection sequence, retrying up to
    /// [`RECONNECT_MAX`] times with the given backoff.
    ReconnectSequence {
        /// How long to wait before this attempt.
        delay: Duration,
    },
    /// Reconnection attempts are exhausted; the player should disconnect.
    GiveUp,
    /// Surface the event; no action required.
    Ignore,
}

/// A single guild's playback session.
#[derive(Debug)]
pub struct Player {
    guild_id: Id<GuildMarker>,
    node_name: Arc<str>,
    rest: Arc<RestClient>,
    connection: Connection,
    queue: Queue,
    history: CircularBuffer<Track, HISTORY_CAPACITY>,
    batcher: UpdateBatcher,
    current: Option<Track>,
    position: i64,
    paused: bool,
    volume: i64,
    loop_mode: LoopMode,
    text_channel_id: Option<Id<ChannelMarker>>,
    autoplay: bool,
    autoplay_attempts: u32,
    destroyed: bool,
    socket_closed_attempts: u32,
}

impl Player {
    /// Create a new, disconnected player for `guild_id` bound to the node
    /// named `node_name`.
    #[must_use]
    pub fn new(
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        node_name: Arc<str>,
        rest: Arc<RestClient>,
    ) -> Self {
        Self {
            guild_id,
            node_name,
            rest,
            connection: Connection::new(guild_id, user_id),
            queue: Queue::new(),
            history: CircularBuffer::new(),
            batcher: UpdateBatcher::new(),
            current: None,
            position: 0,
            paused: false,
            volume: 100,
            loop_mode: LoopMode::None,
            text_channel_id: None,
            autoplay: false,
            autoplay_attempts: 0,
            destroyed: false,
            socket_closed_attempts: 0,
        }
    }

    /// The guild this player belongs to.
    #[must_use]
    pub const fn guild_id(&self) -> Id<GuildMarker> {
        self.guild_id
    }

    /// The name of the node this player is bound to.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The voice state machine backing this player.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Mutable access to the voice state machine, for the owning task to
    /// feed gateway events into.
    #[must_use]
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// The pending queue.
    #[must_use]
    pub const fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Mutable access to the pending queue.
    #[must_use]
    pub fn queue_mut(&mut self) -> &mut Queue {
        &mut self.queue
    }

    /// The track currently playing, if any.
    #[must_use]
    pub const fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    /// Last known playback position, in milliseconds.
    #[must_use]
    pub const fn position(&self) -> i64 {
        self.position
    }

    /// Whether the player is paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Current playback volume, `0..=200`.
    #[must_use]
    pub const fn volume(&self) -> i64 {
        self.volume
    }

    /// Current loop mode.
    #[must_use]
    pub const fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// The text channel bound to this player for notifications, if any.
    #[must_use]
    pub const fn text_channel_id(&self) -> Option<Id<ChannelMarker>> {
        self.text_channel_id
    }

    /// Whether this player has been destroyed.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn ensure_alive(&self) -> Result<(), PlayerError> {
        if self.destroyed {
            Err(PlayerError::from_kind(PlayerErrorType::Destroyed))
        } else {
            Ok(())
        }
    }

    /// Bind the text channel used for playback notifications.
    pub fn set_text_channel(&mut self, channel_id: Option<Id<ChannelMarker>>) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        self.text_channel_id = channel_id;
        Ok(())
    }

    /// Enable or disable autoplay (automatically advancing when the queue is
    /// exhausted is always on; autoplay additionally resolves a follow-up
    /// track when nothing is queued).
    pub fn set_autoplay(&mut self, enabled: bool) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        self.autoplay = enabled;
        if !enabled {
            self.autoplay_attempts = 0;
        }
        Ok(())
    }

    /// Whether autoplay is enabled.
    #[must_use]
    pub const fn autoplay(&self) -> bool {
        self.autoplay
    }

    /// Play `track` immediately, replacing whatever is currently playing.
    ///
    /// This does not touch the queue; callers that want queue-then-play
    /// semantics should enqueue first and pull from [`Self::queue_mut`].
    pub async fn play(&mut self, track: Track, no_replace: bool) -> Result<(), PlayerError> {
        self.ensure_alive()?;

        let update_track = UpdatePlayerTrack {
            encoded: track.encoded().map(str::to_owned),
            identifier: track.encoded().is_none().then(|| track.uri().unwrap_or_default().to_owned()),
            user_data: None,
        };

        self.current = Some(track);
        self.position = 0;
        self.paused = false;
        self.autoplay_attempts = 0;

        self.send_immediate(UpdatePlayer::new().track(update_track), no_replace)
            .await
    }

    /// Pause or resume playback.
    pub async fn pause(&mut self, paused: bool) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        self.paused = paused;
        self.send_immediate(UpdatePlayer::new().paused(paused), false).await
    }

    /// Seek to `position_ms` within the current track, clamped to
    /// `[0, duration]` when the track's duration is known.
    pub async fn seek(&mut self, position_ms: i64) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        let Some(current) = self.current.as_ref() else {
            return Err(PlayerError::from_kind(PlayerErrorType::NotPlaying));
        };

        let duration_ms = current.info().map(|info| info.length as i64);
        let clamped = match duration_ms {
            Some(duration) => position_ms.clamp(0, duration),
            None => position_ms.max(0),
        };

        self.position = clamped;
        self.send_immediate(UpdatePlayer::new().position(clamped), false).await
    }

    /// Stop playback, clearing the current track but leaving the queue
    /// intact.
    pub async fn stop(&mut self) -> Result<(), PlayerError> {
        self.ensure_alive()?;

        if let Some(track) = self.current.take() {
            self.history.push(track);
        }
        self.position = 0;
        self.paused = false;

        self.send_immediate(
            UpdatePlayer::new().track(UpdatePlayerTrack::default()),
            false,
        )
        .await
    }

    /// Set playback volume, clamped to `0..=200`.
    pub async fn set_volume(&mut self, volume: i64) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        self.volume = volume.clamp(0, 200);
        self.batch(UpdatePlayer::new().volume(self.volume), false).await
    }

    /// Set the loop mode.
    pub fn set_loop(&mut self, mode: LoopMode) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        self.loop_mode = mode;
        Ok(())
    }

    /// Shuffle the pending queue in place.
    pub fn shuffle(&mut self) -> Result<(), PlayerError> {
        self.ensure_alive()?;
        self.queue.shuffle();
        Ok(())
    }

    /// Skip the current track, returning what the caller should play next.
    pub fn skip(&mut self) -> Result<TrackEndAction, PlayerError> {
        self.ensure_alive()?;

        if let Some(current) = self.current.take() {
            self.history.push(current);
        }
        self.position = 0;

        Ok(self.advance_from_queue())
    }

    /// Restart the most recently played track from the beginning, if any
    /// history is available.
    pub async fn replay(&mut self) -> Result<(), PlayerError> {
        self.ensure_alive()?;

        let track = self
            .history
            .last()
            .cloned()
            .ok_or_else(|| PlayerError::from_kind(PlayerErrorType::NotPlaying))?;

        self.play(track, false).await
    }

    /// React to a `playerUpdate` frame, refreshing the locally tracked
    /// position from the node's authoritative report.
    pub fn apply_player_update(&mut self, state: &PlayerUpdateState) {
        if let Some(position) = state.position {
            self.position = position;
        }
    }

    /// React to a node's `trackEnd` event, choosing what plays next per the
    /// reason-keyed reaction table. Does not itself issue a play; the
    /// caller is expected to act on the returned [`TrackEndAction`].
    pub fn handle_track_end(&mut self, ended: &WireTrack, reason: TrackEndReason) -> TrackEndAction {
        if let Some(current) = self.current.take() {
            self.history.push(current);
        }
        self.position = 0;

        if !reason.may_advance_queue() {
            return TrackEndAction::None;
        }

        if matches!(reason, TrackEndReason::LoadFailed | TrackEndReason::Cleanup) {
            return if self.queue.is_empty() {
                self.clear_data();
                TrackEndAction::QueueEnded
            } else if let Some(next) = self.queue.dequeue() {
                TrackEndAction::PlayNext(next)
            } else {
                TrackEndAction::QueueEnded
            };
        }

        match self.loop_mode {
            LoopMode::Track => self.queue.enqueue_front(Track::from_wire(ended.clone(), None)),
            LoopMode::Queue => self.queue.enqueue(Track::from_wire(ended.clone(), None)),
            LoopMode::None => {}
        }

        self.advance_from_queue()
    }

    /// React to a `trackException` or `trackStuck` event: stop the current
    /// track without advancing.
    pub fn handle_track_failure(&mut self) -> TrackEndAction {
        if let Some(current) = self.current.take() {
            self.history.push(current);
        }
        self.position = 0;
        TrackEndAction::Idle
    }

    fn clear_data(&mut self) {
        self.queue.clear();
        self.history.clear();
        self.autoplay_attempts = 0;
    }

    fn advance_from_queue(&mut self) -> TrackEndAction {
        if let Some(next) = self.queue.dequeue() {
            self.autoplay_attempts = 0;
            return TrackEndAction::PlayNext(next);
        }

        if self.autoplay && self.autoplay_attempts < AUTOPLAY_MAX {
            self.autoplay_attempts += 1;
            // The actual candidate-track lookup is provider-specific and is
            // performed by the owning task, which calls back into `play`
            // once it has resolved one; this just tracks the attempt
            // budget so repeated lookup failures eventually give up.
        }

        TrackEndAction::Idle
    }

    /// React to a `socketClosed` event, dispatching on the voice close
    /// code per the reaction table.
    pub fn handle_socket_closed(&mut self, code: u64) -> SocketClosedAction {
        if code == voice_close_code::SESSION_INVALIDATED {
            return SocketClosedAction::Destroy;
        }

        if code == voice_close_code::SERVER_CRASHED {
            return SocketClosedAction::AttemptResume;
        }

        if !voice_close_code::RECONNECT_SEQUENCE.contains(&code) {
            return SocketClosedAction::Ignore;
        }

        self.socket_closed_attempts += 1;

        if self.socket_closed_attempts > RECONNECT_MAX {
            return SocketClosedAction::GiveUp;
        }

        let delay = RETRY_BACKOFF_BASE
            .saturating_mul(self.socket_closed_attempts)
            .min(RETRY_BACKOFF_MAX);

        SocketClosedAction::ReconnectSequence { delay }
    }

    /// Reset the socket-closed reconnection counter after a successful
    /// reconnect.
    pub fn reset_reconnect_attempts(&mut self) {
        self.socket_closed_attempts = 0;
    }

    /// Tear this player down: clears the queue and history and marks it
    /// unusable. The caller is responsible for issuing the REST delete and
    /// dropping any gateway voice state.
    pub async fn destroy(&mut self) -> Result<(), PlayerError> {
        if self.destroyed {
            return Ok(());
        }

        self.destroyed = true;
        self.current = None;
        self.queue.clear();
        self.connection.disconnect();

        if let Some(session_id) = self.rest.session_id() {
            self.rest
                .destroy_player(&session_id, self.guild_id.get())
                .await
                .map_err(|source| PlayerError::new(PlayerErrorType::Rest, source))?;
        }

        Ok(())
    }

    /// Tear this player down locally without notifying the node, for use
    /// when the remote player is being replaced rather than abandoned (for
    /// example during a migration to another node).
    pub fn destroy_local(&mut self) {
        self.destroyed = true;
        self.current = None;
        self.queue.clear();
        self.connection.disconnect();
    }

    /// Merge `fields` into the pending update, flushing immediately if
    /// warranted (see [`UpdateBatcher::batch`]), and perform the flush here
    /// synchronously rather than leaving it to a timer.
    async fn send_immediate(&mut self, fields: UpdatePlayer, no_replace: bool) -> Result<(), PlayerError> {
        match self.batcher.batch(fields, true) {
            BatchOutcome::FlushNow => self.flush(no_replace).await,
            _ => Ok(()),
        }
    }

    /// Merge `fields` into the pending update without forcing an immediate
    /// flush; returns once the batcher decides what should happen.
    async fn batch(&mut self, fields: UpdatePlayer, no_replace: bool) -> Result<(), PlayerError> {
        match self.batcher.batch(fields, false) {
            BatchOutcome::FlushNow => self.flush(no_replace).await,
            _ => Ok(()),
        }
    }

    /// Called by the owning task's debounce timer to promote a scheduled
    /// flush, if one is pending.
    pub async fn flush_scheduled(&mut self) -> Result<(), PlayerError> {
        if self.batcher.take_scheduled_flush() {
            self.flush(false).await
        } else {
            Ok(())
        }
    }

    /// Force an immediate flush of whatever is pending, typically just a
    /// freshly-arrived voice payload. Used by the orchestrator's gateway
    /// demux, which reacts to [`Connection`] state changes rather than
    /// player commands.
    pub async fn flush_voice_update(&mut self) -> Result<(), PlayerError> {
        self.flush(false).await
    }

    async fn flush(&mut self, no_replace: bool) -> Result<(), PlayerError> {
        let Some(mut fields) = self.batcher.take_pending() else {
            self.batcher.complete_flush();
            return Ok(());
        };

        if let Some((voice, fingerprint)) = self.connection.pending_voice_payload(self.volume) {
            if self.connection.should_send(&fingerprint) {
                fields = fields.voice(voice);
                self.connection.mark_voice_sent(fingerprint);
            }
        }

        let session_id = self
            .rest
            .session_id()
            .ok_or_else(|| PlayerError::from_kind(PlayerErrorType::NotConnected))?;

        let result = self
            .rest
            .update_player(&session_id, self.guild_id.get(), &fields, no_replace)
            .await
            .map_err(|source| PlayerError::new(PlayerErrorType::Rest, source));

        // If something accumulated mid-flush, `batch` already marked it
        // scheduled; the owning task's next tick picks it up via
        // `flush_scheduled`.
        self.batcher.complete_flush();

        result.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player() -> Player {
        Player::new(
            Id::new(1),
            Id::new(2),
            Arc::from("test-node"),
            Arc::new(RestClient::new("https://node.example", "pw").unwrap()),
        )
    }

    fn track(id: &str) -> Track {
        Track::from_encoded(id.to_owned(), None)
    }

    #[test]
    fn loop_mode_parses_case_insensitively() {
        assert_eq!(LoopMode::parse("TRACK").unwrap(), LoopMode::Track);
        assert!(LoopMode::parse("bogus").is_err());
    }

    #[test]
    fn volume_is_clamped() {
        let mut p = player();
        p.volume = 2000i64.clamp(0, 200);
        assert_eq!(p.volume, 200);
    }

    #[test]
    fn advance_from_empty_queue_is_idle_without_autoplay() {
        let mut p = player();
        assert_eq!(p.advance_from_queue(), TrackEndAction::Idle);
    }

    #[test]
    fn advance_from_queue_dequeues_next_track() {
        let mut p = player();
        p.queue.enqueue(track("a"));
        match p.advance_from_queue() {
            TrackEndAction::PlayNext(next) => assert_eq!(next.encoded(), Some("a")),
            other => panic!("expected PlayNext, got {other:?}"),
        }
    }

    #[test]
    fn track_loop_reinserts_ended_track_at_front() {
        let mut p = player();
        p.set_loop(LoopMode::Track).unwrap();
        let wire = WireTrack {
            encoded: "a".into(),
            info: sample_info(),
            plugin_info: serde_json::Value::Null,
            user_data: serde_json::Value::Null,
        };

        match p.handle_track_end(&wire, TrackEndReason::Finished) {
            TrackEndAction::PlayNext(next) => assert_eq!(next.encoded(), Some("a")),
            other => panic!("expected PlayNext, got {other:?}"),
        }
    }

    #[test]
    fn load_failed_with_empty_queue_clears_data() {
        let mut p = player();
        p.history.push(track("a"));
        let wire = WireTrack {
            encoded: "x".into(),
            info: sample_info(),
            plugin_info: serde_json::Value::Null,
            user_data: serde_json::Value::Null,
        };

        assert_eq!(
            p.handle_track_end(&wire, TrackEndReason::LoadFailed),
            TrackEndAction::QueueEnded
        );
        assert!(p.history.is_empty());
    }

    #[test]
    fn replaced_reason_takes_no_action() {
        let mut p = player();
        let wire = WireTrack {
            encoded: "x".into(),
            info: sample_info(),
            plugin_info: serde_json::Value::Null,
            user_data: serde_json::Value::Null,
        };

        assert_eq!(
            p.handle_track_end(&wire, TrackEndReason::Replaced),
            TrackEndAction::None
        );
    }

    #[test]
    fn socket_closed_session_invalidated_destroys() {
        let mut p = player();
        assert_eq!(p.handle_socket_closed(4022), SocketClosedAction::Destroy);
    }

    #[test]
    fn socket_closed_server_crashed_attempts_resume() {
        let mut p = player();
        assert_eq!(p.handle_socket_closed(4015), SocketClosedAction::AttemptResume);
    }

    #[test]
    fn socket_closed_unrelated_code_is_ignored() {
        let mut p = player();
        assert_eq!(p.handle_socket_closed(1000), SocketClosedAction::Ignore);
    }

    #[test]
    fn socket_closed_backoff_grows_then_gives_up() {
        let mut p = player();

        let SocketClosedAction::ReconnectSequence { delay: first } = p.handle_socket_closed(4006) else {
            panic!("expected reconnect sequence");
        };
        assert_eq!(first, RETRY_BACKOFF_BASE);

        let SocketClosedAction::ReconnectSequence { delay: second } = p.handle_socket_closed(4006) else {
            panic!("expected reconnect sequence");
        };
        assert_eq!(second, RETRY_BACKOFF_BASE * 2);

        p.handle_socket_closed(4006);
        assert_eq!(p.handle_socket_closed(4006), SocketClosedAction::GiveUp);
    }

    fn sample_info() -> crate::http::TrackInfo {
        crate::http::TrackInfo {
            identifier: "a".into(),
            is_seekable: true,
            author: "author".into(),
            length: 1000,
            is_stream: false,
            position: 0,
            title: "title".into(),
            uri: None,
            artwork_url: None,
            isrc: None,
            source_name: "test".into(),
        }
    }

    #[test]
    fn player_update_refreshes_position_only_when_present() {
        let mut p = player();
        p.position = 1_000;

        p.apply_player_update(&PlayerUpdateState {
            time: 0,
            position: Some(5_000),
            connected: true,
            ping: 10,
        });
        assert_eq!(p.position, 5_000);

        p.apply_player_update(&PlayerUpdateState {
            time: 0,
            position: None,
            connected: true,
            ping: 10,
        });
        assert_eq!(p.position, 5_000);
    }

    #[test]
    fn destroyed_player_rejects_commands() {
        let mut p = player();
        p.destroyed = true;
        assert!(p.set_text_channel(None).is_err());
    }
}
