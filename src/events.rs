//! The orchestrator-level events surfaced to callers.
//!
//! These are distinct from [`crate::model::incoming::IncomingEvent`], which
//! models the raw wire frames a node sends. An [`AquaEvent`] is what those
//! frames become once the [`Player`](crate::player::Player) and
//! [`Aqua`](crate::client::Aqua) have reacted to them: a track end that
//! already knows whether the queue advanced, a socket close that already
//! knows whether a reconnect was attempted, a failover that already knows
//! which guilds moved.

use crate::{
    model::incoming::{TrackEndReason, WebSocketClosed},
    track::Track,
};
use std::sync::Arc;
use twilight_model::id::{marker::GuildMarker, Id};

/// Trace labels used for [`crate::client::Aqua::get_trace`] entries.
///
/// Centralized here so the orchestrator and its callers agree on the exact
/// strings without copying literals around.
pub mod trace_labels {
    /// A player was migrated to a new node, by explicit request or failover.
    pub const PLAYER_MIGRATED: &str = "playerMigrated";
    /// A node disconnected and its players began failover.
    pub const NODE_FAILOVER: &str = "nodeFailover";
    /// Failover for a node was abandoned after exhausting its attempt budget.
    pub const NODE_FAILOVER_ABANDONED: &str = "nodeFailoverAbandoned";
    /// Failover for a node finished, successfully or not.
    pub const NODE_FAILOVER_COMPLETE: &str = "nodeFailoverComplete";
    /// A node's websocket reported ready.
    pub const NODE_READY: &str = "nodeReady";
}

/// A caller-facing event dispatched for a single guild's player.
///
/// This enum is intentionally flat rather than nested per-kind payload
/// structs: callers typically match on it once at the top of an event
/// handler, the same shape as the wire [`crate::model::incoming::Event`]
/// it is derived from.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum AquaEvent {
    /// A track started playing.
    TrackStart {
        /// The guild whose player started the track.
        guild_id: Id<GuildMarker>,
        /// The track that started.
        track: Track,
    },
    /// A track ended and the player already reacted (advanced the queue,
    /// looped, or stopped).
    TrackEnd {
        /// The guild whose player finished the track.
        guild_id: Id<GuildMarker>,
        /// The track that ended.
        track: Track,
        /// Why it ended.
        reason: TrackEndReason,
        /// Whether the player began playing a replacement track.
        advanced: bool,
    },
    /// A track's decoder or the worker itself reported an exception.
    TrackException {
        /// The guild whose player hit the exception.
        guild_id: Id<GuildMarker>,
        /// The track that threw.
        track: Track,
        /// A human-readable description of the exception.
        message: String,
    },
    /// A track stopped making progress for longer than the worker's
    /// stuck-track threshold.
    TrackStuck {
        /// The guild whose player is stuck.
        guild_id: Id<GuildMarker>,
        /// The track that stalled.
        track: Track,
        /// The threshold, in milliseconds, that was exceeded.
        threshold_ms: u64,
    },
    /// The queue drained with no further track to play.
    QueueEnd {
        /// The guild whose queue emptied.
        guild_id: Id<GuildMarker>,
    },
    /// Autoplay exhausted its retry budget without finding a playable track.
    AutoplayFailed {
        /// The guild whose autoplay chain gave up.
        guild_id: Id<GuildMarker>,
    },
    /// The voice websocket closed; see `code` for the reaction that was
    /// already taken (see §4.7 of the component design for the full table).
    SocketClosed {
        /// The guild whose voice socket closed.
        guild_id: Id<GuildMarker>,
        /// The raw close payload reported by Discord.
        close: WebSocketClosed,
    },
    /// A voice-session reconnection sequence completed, replacing a
    /// guild's Player with a new one on the same node.
    PlayerReconnected {
        /// The guild that reconnected.
        guild_id: Id<GuildMarker>,
    },
    /// A voice-session reconnection sequence exhausted its retry budget.
    ReconnectionFailed {
        /// The guild whose reconnection attempts were exhausted.
        guild_id: Id<GuildMarker>,
    },
    /// A player was migrated to a different node.
    PlayerMigrated {
        /// The guild that migrated.
        guild_id: Id<GuildMarker>,
        /// The node it was migrated away from.
        from: Arc<str>,
        /// The node it was migrated to.
        to: Arc<str>,
        /// Why the migration happened, e.g. `"region"` or `"failover"`.
        reason: &'static str,
    },
    /// A lyrics-providing plugin pushed a frame for a guild.
    Lyrics {
        /// The guild the lyrics frame pertains to, if the plugin included
        /// one.
        guild_id: Option<Id<GuildMarker>>,
        /// The literal op string the plugin used, e.g. `"LyricsLine"`.
        op: String,
        /// The provider-specific payload.
        data: serde_json::Value,
    },
    /// A node sent a frame matching no known op and not starting with
    /// `Lyrics`, for example a custom plugin op this crate doesn't model.
    /// Forwarded verbatim rather than dropped.
    Unknown {
        /// The node that sent the frame.
        node: Arc<str>,
        /// The raw, unparsed frame text.
        frame: String,
    },
}

impl AquaEvent {
    /// The guild this event pertains to, if any. [`Self::Lyrics`] and
    /// [`Self::Unknown`] are the only variants that may lack one.
    #[must_use]
    pub fn guild_id(&self) -> Option<Id<GuildMarker>> {
        match self {
            Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::TrackStuck { guild_id, .. }
            | Self::QueueEnd { guild_id }
            | Self::AutoplayFailed { guild_id }
            | Self::SocketClosed { guild_id, .. }
            | Self::PlayerReconnected { guild_id }
            | Self::ReconnectionFailed { guild_id }
            | Self::PlayerMigrated { guild_id, .. } => Some(*guild_id),
            Self::Lyrics { guild_id, .. } => *guild_id,
            Self::Unknown { .. } => None,
        }
    }
}

/// A callback the host registers to receive [`AquaEvent`]s as they occur.
///
/// Mirrors [`crate::client::GatewaySender`]: a plain `Fn` rather than a
/// channel, since the host almost always wants to immediately re-dispatch
/// into its own event system (a Serenity `EventHandler`, a Twilight
/// `Event` stream consumer, etc.) rather than poll one.
pub type EventSender = Arc<dyn Fn(AquaEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guild_id_is_present_for_every_variant_but_untargeted_lyrics() {
        let guild_id = Id::new(1);

        let with_guild = AquaEvent::QueueEnd { guild_id };
        assert_eq!(with_guild.guild_id(), Some(guild_id));

        let lyrics_without_guild = AquaEvent::Lyrics {
            guild_id: None,
            op: "LyricsLine".into(),
            data: serde_json::Value::Null,
        };
        assert_eq!(lyrics_without_guild.guild_id(), None);

        let unknown = AquaEvent::Unknown {
            node: "node-a".into(),
            frame: "{\"op\":\"weird\"}".into(),
        };
        assert_eq!(unknown.guild_id(), None);
    }

    #[test]
    fn trace_labels_match_what_the_orchestrator_pushes() {
        assert_eq!(trace_labels::PLAYER_MIGRATED, "playerMigrated");
        assert_eq!(trace_labels::NODE_FAILOVER, "nodeFailover");
    }
}
