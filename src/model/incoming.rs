//! Events that a node sends to clients.

use crate::http::{Exception, Track};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use twilight_model::id::{marker::GuildMarker, Id};

/// The type of event that something is.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub enum Opcode {
    /// The node is connected and ready.
    Ready,
    /// An update about a player's current track.
    PlayerUpdate,
    /// Updated statistics about a node.
    Stats,
    /// Meta information about a track starting or ending.
    Event,
}

/// An incoming event from a node.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(untagged)]
pub enum IncomingEvent {
    /// Dispatched when you successfully connect to the node.
    Ready(Ready),
    /// An update about the information of a player.
    PlayerUpdate(PlayerUpdate),
    /// New statistics about a node and its host.
    Stats(Stats),
    /// Dispatched when player or voice events occur.
    Event(Event),
    /// Dispatched for any op whose name starts with the literal `Lyrics`.
    ///
    /// Lyrics payloads vary by the plugin providing them, so the exact shape
    /// is passed through as raw JSON rather than modeled field by field.
    /// [`LyricsEvent`]'s own `Deserialize` impl rejects any frame whose `op`
    /// does not start with `Lyrics`, so this variant cannot swallow other
    /// unrecognized frames the way a plain-`String`-keyed catch-all would.
    Lyrics(LyricsEvent),
    /// A well-formed JSON object that matched none of the above, carried as
    /// the raw frame text. Never produced by this enum's own (derived)
    /// `Deserialize` impl; [`crate::node::Node::run`]'s frame parser
    /// constructs this variant directly when deserialization fails, logging
    /// the frame at debug level rather than discarding it.
    #[serde(skip_deserializing)]
    Unknown(String),
}

impl From<Ready> for IncomingEvent {
    fn from(event: Ready) -> IncomingEvent {
        Self::Ready(event)
    }
}

impl From<Event> for IncomingEvent {
    fn from(event: Event) -> IncomingEvent {
        Self::Event(event)
    }
}

impl From<PlayerUpdate> for IncomingEvent {
    fn from(event: PlayerUpdate) -> IncomingEvent {
        Self::PlayerUpdate(event)
    }
}

impl From<Stats> for IncomingEvent {
    fn from(event: Stats) -> IncomingEvent {
        Self::Stats(event)
    }
}

impl From<LyricsEvent> for IncomingEvent {
    fn from(event: LyricsEvent) -> IncomingEvent {
        Self::Lyrics(event)
    }
}

/// A lyrics-related frame dispatched by a lyrics-providing plugin.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct LyricsEvent {
    /// The literal op string sent by the node, e.g. `LyricsLine`,
    /// `LyricsFound`, or `LyricsNotFound`.
    pub op: String,
    /// The guild ID the event pertains to, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<Id<GuildMarker>>,
    /// The remaining, provider-specific fields of the frame.
    #[serde(flatten)]
    pub data: Value,
}

impl<'de> Deserialize<'de> for LyricsEvent {
    /// Deserializes like the derived impl would, except the frame is
    /// rejected unless `op` starts with the literal `Lyrics`. Without this
    /// check, this variant's `op: String` field would match (and
    /// misclassify as lyrics) any JSON object at all, since it's the least
    /// restrictive shape among [`IncomingEvent`]'s untagged variants.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            op: String,
            #[serde(default)]
            guild_id: Option<Id<GuildMarker>>,
            #[serde(flatten)]
            data: Value,
        }

        let raw = Raw::deserialize(deserializer)?;
        if !raw.op.starts_with("Lyrics") {
            return Err(serde::de::Error::custom(format_args!(
                "op {:?} does not start with \"Lyrics\"",
                raw.op
            )));
        }

        Ok(LyricsEvent {
            op: raw.op,
            guild_id: raw.guild_id,
            data: raw.data,
        })
    }
}

/// The Discord voice information that a node uses for connection and sending
/// information.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    /// The Discord voice token to authenticate with.
    pub token: String,
    /// The Discord voice endpoint to connect to.
    pub endpoint: String,
    /// The Discord voice session id to authenticate with. Note this is
    /// separate from the node's own session id.
    pub session_id: String,
}

impl crate::payload_pool::Poolable for VoiceState {
    fn reset(&mut self) {
        self.token.clear();
        self.endpoint.clear();
        self.session_id.clear();
    }
}

/// An update about the information of a player.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    /// Op code for this websocket event.
    pub op: Opcode,
    /// The guild ID of the player.
    pub guild_id: Id<GuildMarker>,
    /// The new state of the player.
    pub state: PlayerUpdateState,
}

/// The state carried by a [`PlayerUpdate`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateState {
    /// Unix timestamp of the player in milliseconds.
    pub time: i64,
    /// Track position in milliseconds. `None` if not playing anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    /// True when the player is connected to the voice gateway.
    pub connected: bool,
    /// The ping of the node to the Discord voice server in milliseconds
    /// (`-1` if not connected).
    pub ping: i64,
}

/// Dispatched by a node upon successful connection and authorization.
/// Contains fields determining if resuming was successful, as well as the
/// session id.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    /// Op code for this websocket event.
    pub op: Opcode,
    /// Whether this session was resumed.
    pub resumed: bool,
    /// The node's session id for this connection. Not to be confused with a
    /// Discord voice session id.
    pub session_id: String,
}

/// Statistics about a node and its host.
///
/// A node is free to omit any field from a given frame; [`Stats::merge`]
/// folds a new frame onto the previous one, keeping each missing field at
/// its last known value rather than resetting it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Op code for this websocket event.
    pub op: Opcode,
    /// CPU information about the node's host.
    #[serde(default)]
    pub cpu: StatsCpu,
    /// Statistics about audio frames.
    #[serde(default, rename = "frameStats", skip_serializing_if = "Option::is_none")]
    pub frame_stats: Option<StatsFrame>,
    /// Memory information about the node's host.
    #[serde(default)]
    pub memory: StatsMemory,
    /// The current number of total players (active and not active) within
    /// the node.
    #[serde(default)]
    pub players: Option<u64>,
    /// The current number of active players within the node.
    #[serde(default)]
    pub playing_players: Option<u64>,
    /// The uptime of the node in milliseconds.
    #[serde(default)]
    pub uptime: Option<u64>,
}

impl Stats {
    /// Fold this frame onto `previous`, keeping any field this frame omits
    /// at its previous value.
    #[must_use]
    pub fn merge(self, previous: &Stats) -> Stats {
        Stats {
            op: self.op,
            cpu: self.cpu.merge(&previous.cpu),
            frame_stats: self.frame_stats.or_else(|| previous.frame_stats.clone()),
            memory: self.memory.merge(&previous.memory),
            players: self.players.or(previous.players),
            playing_players: self.playing_players.or(previous.playing_players),
            uptime: self.uptime.or(previous.uptime),
        }
    }
}

/// CPU information about a node and its host.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct StatsCpu {
    /// The number of CPU cores.
    #[serde(default)]
    pub cores: Option<usize>,
    /// The load of the node process.
    #[serde(default)]
    pub lavalink_load: Option<f64>,
    /// The load of the system as a whole.
    #[serde(default)]
    pub system_load: Option<f64>,
}

impl StatsCpu {
    fn merge(self, previous: &StatsCpu) -> StatsCpu {
        StatsCpu {
            cores: self.cores.or(previous.cores),
            lavalink_load: self.lavalink_load.or(previous.lavalink_load),
            system_load: self.system_load.or(previous.system_load),
        }
    }
}

/// Frame statistics about a node and its host.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct StatsFrame {
    /// Number of frames sent to Discord.
    pub sent: i64,
    /// Number of frames that were nulled.
    pub nulled: i64,
    /// Difference between the expected number of frames and the number of
    /// frames actually sent.
    pub deficit: i64,
}

/// Memory information about a node and its host.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct StatsMemory {
    /// The number of bytes allocated.
    #[serde(default)]
    pub allocated: Option<u64>,
    /// The number of bytes free.
    #[serde(default)]
    pub free: Option<u64>,
    /// The number of bytes reservable.
    #[serde(default)]
    pub reservable: Option<u64>,
    /// The number of bytes used.
    #[serde(default)]
    pub used: Option<u64>,
}

impl StatsMemory {
    fn merge(self, previous: &StatsMemory) -> StatsMemory {
        StatsMemory {
            allocated: self.allocated.or(previous.allocated),
            free: self.free.or(previous.free),
            reservable: self.reservable.or(previous.reservable),
            used: self.used.or(previous.used),
        }
    }
}

/// A node dispatched an event. See [`EventType`] for the full set.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Op code for this websocket event.
    pub op: Opcode,
    /// The guild id that this was received from.
    pub guild_id: String,
    /// The type of event.
    pub r#type: EventType,
    /// The data of the event type.
    #[serde(flatten)]
    pub data: EventData,
}

/// The kind of player or voice event a node dispatched.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub enum EventType {
    /// Dispatched when a track starts playing.
    TrackStartEvent,
    /// Dispatched when a track ends.
    TrackEndEvent,
    /// Dispatched when a track throws an exception.
    TrackExceptionEvent,
    /// Dispatched when a track gets stuck while playing.
    TrackStuckEvent,
    /// Dispatched when a player's active track changes outside of a
    /// conventional start/end pair, for example a provider-side swap.
    TrackChangeEvent,
    /// Dispatched when the websocket connection to Discord voice servers is
    /// closed.
    WebSocketClosedEvent,
}

/// The data carried alongside an [`Event`], tagged by [`EventType`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(untagged)]
pub enum EventData {
    /// Dispatched when a track starts playing.
    TrackStartEvent(TrackStart),
    /// Dispatched when a track ends.
    TrackEndEvent(TrackEnd),
    /// Dispatched when a track throws an exception.
    TrackExceptionEvent(TrackException),
    /// Dispatched when a track gets stuck while playing.
    TrackStuckEvent(TrackStuck),
    /// Dispatched when a player's active track changes.
    TrackChangeEvent(TrackChange),
    /// Dispatched when the websocket connection to Discord voice servers is
    /// closed.
    WebSocketClosedEvent(WebSocketClosed),
}

/// The reason for the track ending.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    /// The track finished playing.
    Finished,
    /// The track failed to load.
    LoadFailed,
    /// The track was stopped.
    Stopped,
    /// The track was replaced.
    Replaced,
    /// The track was cleaned up.
    Cleanup,
}

impl TrackEndReason {
    /// Whether this reason permits automatically advancing to the next
    /// queued track.
    ///
    /// Every reason other than `Replaced` may advance the queue; a
    /// replacement already has its successor playing.
    #[must_use]
    pub const fn may_advance_queue(self) -> bool {
        !matches!(self, Self::Replaced)
    }
}

/// A track ended.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct TrackEnd {
    /// The track that ended playing.
    pub track: Track,
    /// The reason that the track ended.
    pub reason: TrackEndReason,
}

/// A track started.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct TrackStart {
    /// The track that started playing.
    pub track: Track,
}

/// A player's active track changed outside of a normal start/end pair.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct TrackChange {
    /// The track that is now playing, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<Track>,
}

/// A track threw an exception.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    /// The track that threw the exception.
    pub track: Track,
    /// The occurred exception.
    pub exception: Exception,
}

/// A track got stuck while playing.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct TrackStuck {
    /// The track that got stuck.
    pub track: Track,
    /// The threshold in milliseconds that was exceeded.
    pub threshold_ms: u64,
}

/// The voice websocket connection to Discord has been closed.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct WebSocketClosed {
    /// [Discord websocket close code][docs] that closed the connection.
    ///
    /// [docs]: https://discord.com/developers/docs/topics/opcodes-and-status-codes#voice-voice-close-event-codes
    pub code: u64,
    /// Reason the connection was closed.
    pub reason: String,
    /// True if Discord closed the connection, false if the node closed it.
    pub by_remote: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_test::{assert_tokens, Token};

    #[test]
    fn ready_round_trips() {
        let ready = Ready {
            op: Opcode::Ready,
            resumed: true,
            session_id: "abc123".into(),
        };

        assert_tokens(
            &ready,
            &[
                Token::Struct {
                    name: "Ready",
                    len: 3,
                },
                Token::Str("op"),
                Token::UnitVariant {
                    name: "Opcode",
                    variant: "ready",
                },
                Token::Str("resumed"),
                Token::Bool(true),
                Token::Str("sessionId"),
                Token::Str("abc123"),
                Token::StructEnd,
            ],
        );
    }

    #[test]
    fn lyrics_event_is_permissive_and_matches_last() {
        let json = r#"{"op":"LyricsFound","guildId":"123","lyrics":{"text":"la la"}}"#;
        let event: IncomingEvent = serde_json::from_str(json).unwrap();
        match event {
            IncomingEvent::Lyrics(lyrics) => {
                assert_eq!(lyrics.op, "LyricsFound");
                assert_eq!(lyrics.guild_id.map(Id::get), Some(123));
            }
            other => panic!("expected Lyrics variant, got {other:?}"),
        }
    }

    #[test]
    fn track_end_reason_gates_autoplay() {
        assert!(TrackEndReason::Finished.may_advance_queue());
        assert!(TrackEndReason::LoadFailed.may_advance_queue());
        assert!(!TrackEndReason::Replaced.may_advance_queue());
    }
}
