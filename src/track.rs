//! An immutable-ish metadata carrier for a single playable item, with lazy
//! (re)resolution of its wire-ready encoded form.

use crate::{
    error::{TrackError, TrackErrorType},
    http::{validate_base64, Track as WireTrack, TrackInfo},
};
use std::sync::Arc;

/// Opaque handle identifying whoever requested a track, round-tripped
/// through queue and event plumbing without this crate inspecting it.
pub type Requester = Arc<str>;

/// A queued or currently playing track.
///
/// Either [`Self::encoded`] or [`Self::uri`] is always present; a track
/// built from a bare URI resolves its encoded blob lazily the first time it
/// is actually sent to a node.
#[derive(Clone, Debug)]
pub struct Track {
    encoded: Option<String>,
    uri: Option<String>,
    info: Option<TrackInfo>,
    requester: Option<Requester>,
    node_name: Option<Arc<str>>,
}

impl Track {
    /// Build a track from an already-encoded wire blob.
    ///
    /// `requester` is an opaque handle round-tripped alongside the track.
    #[must_use]
    pub fn from_encoded(encoded: String, requester: Option<Requester>) -> Self {
        Self {
            encoded: Some(encoded),
            uri: None,
            info: None,
            requester,
            node_name: None,
        }
    }

    /// Build a track from a bare URI, deferring resolution of its encoded
    /// blob until it is needed.
    #[must_use]
    pub fn from_uri(uri: String, requester: Option<Requester>) -> Self {
        Self {
            encoded: None,
            uri: Some(uri),
            info: None,
            requester,
            node_name: None,
        }
    }

    /// Build a track from a fully resolved wire track, as returned by
    /// `/loadtracks` or a player/track event.
    #[must_use]
    pub fn from_wire(track: WireTrack, requester: Option<Requester>) -> Self {
        Self {
            encoded: Some(track.encoded),
            uri: track.info.uri.clone(),
            info: Some(track.info),
            requester,
            node_name: None,
        }
    }

    /// Validate and construct a track, enforcing that at least one of
    /// `encoded` or `uri` is present.
    pub fn new(
        encoded: Option<String>,
        uri: Option<String>,
        requester: Option<Requester>,
    ) -> Result<Self, TrackError> {
        if encoded.is_none() && uri.is_none() {
            return Err(TrackError::from(TrackErrorType::MissingIdentifier));
        }

        if let Some(encoded) = &encoded {
            validate_base64(encoded)?;
        }

        Ok(Self {
            encoded,
            uri,
            info: None,
            requester,
            node_name: None,
        })
    }

    /// The base64 encoded wire form, if already resolved.
    #[must_use]
    pub fn encoded(&self) -> Option<&str> {
        self.encoded.as_deref()
    }

    /// The track's URI, if known.
    #[must_use]
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Whether this track still needs its encoded blob resolved before it
    /// can be sent to a node.
    #[must_use]
    pub const fn needs_resolution(&self) -> bool {
        self.encoded.is_none()
    }

    /// Resolved metadata about the track, if available.
    #[must_use]
    pub const fn info(&self) -> Option<&TrackInfo> {
        self.info.as_ref()
    }

    /// The opaque requester handle attached to this track, if any.
    #[must_use]
    pub fn requester(&self) -> Option<&Requester> {
        self.requester.as_ref()
    }

    /// The name of the node this track is currently associated with, if any.
    #[must_use]
    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }

    /// Attach resolved metadata and the encoded blob to this track.
    pub fn resolve(&mut self, encoded: String, info: TrackInfo) {
        self.encoded = Some(encoded);
        self.info = Some(info);
    }

    /// Mark this track as owned by a particular node, for diagnostics and
    /// migration bookkeeping.
    pub fn set_node_name(&mut self, node_name: impl Into<Arc<str>>) {
        self.node_name = Some(node_name.into());
    }

    /// Two tracks are the same if their encoded identifiers match, or
    /// failing that, their URIs match.
    #[must_use]
    pub fn is_same_as(&self, other: &Self) -> bool {
        match (&self.encoded, &other.encoded) {
            (Some(a), Some(b)) => a == b,
            _ => matches!((&self.uri, &other.uri), (Some(a), Some(b)) if a == b),
        }
    }

    /// Release any resources this track holds.
    ///
    /// Tracks don't own anything that outlives them today, but queue and
    /// history eviction call this uniformly so a future resource (e.g. a
    /// cached artwork handle) has a single place to be released from.
    pub fn dispose(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_requires_encoded_or_uri() {
        assert!(Track::new(None, None, None).is_err());
        assert!(Track::new(None, Some("https://example.com".into()), None).is_ok());
    }

    #[test]
    fn new_validates_encoded_base64() {
        let result = Track::new(Some("not valid base64!!".into()), None, None);
        assert!(result.is_err());
    }

    #[test]
    fn is_same_as_prefers_encoded_identity() {
        let a = Track::from_encoded("QQ==".into(), None);
        let b = Track::from_encoded("QQ==".into(), None);
        let c = Track::from_encoded("Qg==".into(), None);

        assert!(a.is_same_as(&b));
        assert!(!a.is_same_as(&c));
    }

    #[test]
    fn needs_resolution_until_encoded_is_set() {
        let mut track = Track::from_uri("https://example.com".into(), None);
        assert!(track.needs_resolution());

        track.resolve(
            "QQ==".into(),
            TrackInfo {
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
            },
        );
        assert!(!track.needs_resolution());
    }
}
