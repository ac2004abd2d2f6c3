//! Request bodies that clients send to a node's REST API.
//!
//! Protocol v4 nodes are driven entirely over REST; the websocket connection
//! only ever pushes frames in the other direction (see [`super::incoming`]).
//! Every field is optional because a PATCH only needs to carry the fields
//! being changed — anything omitted is left untouched on the remote player.

use super::incoming::VoiceState;
use crate::http::UpdatePlayerTrack;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `PATCH /sessions/{sid}/players/{guild}`.
///
/// Audio filter contents are opaque to this crate (see the `filters` field);
/// everything else is validated and batched by the player before being sent.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    /// The track to play, or `None` to leave the current track untouched.
    ///
    /// Sending `Some(UpdatePlayerTrack { encoded: None, .. })` clears the
    /// currently playing track.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdatePlayerTrack>,
    /// The track position in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    /// The player volume, from 0 to 1000. 100 is the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<i64>,
    /// Whether the player is paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    /// The player's Discord voice server and session information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
    /// Opaque audio filter configuration, passed through unvalidated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

impl UpdatePlayer {
    /// An empty update body, filled in field by field with the builder
    /// methods below.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the track to play, or `None` to clear it.
    #[must_use]
    pub fn track(mut self, track: UpdatePlayerTrack) -> Self {
        self.track = Some(track);
        self
    }

    /// Set the track position in milliseconds.
    #[must_use]
    pub const fn position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }

    /// Set the player volume.
    #[must_use]
    pub const fn volume(mut self, volume: i64) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Set whether the player is paused.
    #[must_use]
    pub const fn paused(mut self, paused: bool) -> Self {
        self.paused = Some(paused);
        self
    }

    /// Set the player's voice server and session information.
    #[must_use]
    pub fn voice(mut self, voice: VoiceState) -> Self {
        self.voice = Some(voice);
        self
    }

    /// Whether this update carries nothing and can be skipped.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.track.is_none()
            && self.position.is_none()
            && self.volume.is_none()
            && self.paused.is_none()
            && self.voice.is_none()
            && self.filters.is_none()
    }

    /// Merge `other`'s present fields on top of `self`, overwriting whatever
    /// `self` already had set.
    pub fn merge(&mut self, other: Self) {
        if other.track.is_some() {
            self.track = other.track;
        }
        if other.position.is_some() {
            self.position = other.position;
        }
        if other.volume.is_some() {
            self.volume = other.volume;
        }
        if other.paused.is_some() {
            self.paused = other.paused;
        }
        if other.voice.is_some() {
            self.voice = other.voice;
        }
        if other.filters.is_some() {
            self.filters = other.filters;
        }
    }
}

/// Body of `PATCH /sessions/{sid}`, used to enable session resumption.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct UpdateSession {
    /// Whether the session should be resumable after the websocket closes.
    pub resuming: bool,
    /// How long the node should retain this session's players for resuming,
    /// in seconds.
    pub timeout: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_player_omits_absent_fields() {
        let update = UpdatePlayer::new().paused(true);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({ "paused": true }));
    }

    #[test]
    fn merge_overwrites_present_fields_only() {
        let mut base = UpdatePlayer::new().volume(80).paused(false);
        base.merge(UpdatePlayer::new().paused(true));

        assert_eq!(base.volume, Some(80));
        assert_eq!(base.paused, Some(true));
    }

    #[test]
    fn empty_update_is_empty() {
        assert!(UpdatePlayer::new().is_empty());
        assert!(!UpdatePlayer::new().paused(true).is_empty());
    }
}
