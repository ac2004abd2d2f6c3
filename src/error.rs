//! Error types shared across the crate.
//!
//! Every fallible component exposes a `{kind, source}` pair in the same
//! shape: a public `FooError` struct with an opaque `kind()` accessor and a
//! `FooErrorType` enum describing what went wrong. This mirrors the error
//! types used elsewhere in the `twilight` ecosystem (for example
//! `twilight_gateway::stream::StartRecommendedError`).

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Helper to build a boxed source error from anything that implements
/// [`Error`].
pub(crate) fn boxed(source: impl Error + Send + Sync + 'static) -> Box<dyn Error + Send + Sync> {
    Box::new(source)
}

/// An error that occurred while decoding or validating a track identifier.
#[derive(Debug)]
pub struct TrackError {
    pub(crate) kind: TrackErrorType,
}

impl TrackError {
    /// Immutable reference to the type of error that occurred.
    pub const fn kind(&self) -> &TrackErrorType {
        &self.kind
    }
}

/// Type of [`TrackError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum TrackErrorType {
    /// An encoded track string contained characters outside the base64
    /// alphabet used by the wire format.
    InvalidBase64,
    /// Neither `encoded` nor `uri` was provided when constructing a track.
    MissingIdentifier,
}

impl Display for TrackError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            TrackErrorType::InvalidBase64 => f.write_str("encoded track is not valid base64"),
            TrackErrorType::MissingIdentifier => {
                f.write_str("track has neither an encoded blob nor a uri")
            }
        }
    }
}

impl Error for TrackError {}

impl From<TrackErrorType> for TrackError {
    fn from(kind: TrackErrorType) -> Self {
        Self { kind }
    }
}

/// An error that occurred while making a request to a node's REST API.
#[derive(Debug)]
pub struct RestError {
    pub(crate) kind: RestErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl RestError {
    /// Immutable reference to the type of error that occurred.
    pub const fn kind(&self) -> &RestErrorType {
        &self.kind
    }

    /// Consume the error, returning the source error if there is any.
    #[must_use = "consuming the error and losing the source is not useful"]
    pub fn into_source(self) -> Option<Box<dyn Error + Send + Sync>> {
        self.source
    }

    pub(crate) fn new(kind: RestErrorType, source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            kind,
            source: Some(boxed(source)),
        }
    }

    pub(crate) fn from_kind(kind: RestErrorType) -> Self {
        Self { kind, source: None }
    }
}

/// Type of [`RestError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum RestErrorType {
    /// Building the request failed, usually due to a malformed URL or
    /// header value.
    BuildingRequest,
    /// Sending the request failed at the transport layer (name resolution,
    /// connection refused, TLS handshake, or a timeout).
    Sending,
    /// The response body exceeded [`MAX_RESPONSE_SIZE`].
    ///
    /// [`MAX_RESPONSE_SIZE`]: crate::http::MAX_RESPONSE_SIZE
    ResponseTooLarge,
    /// Decompressing the response body failed.
    Decompressing,
    /// The response body could not be deserialized as the expected type.
    Deserializing,
    /// The remote node returned a non-2xx status code.
    Response {
        /// HTTP status code of the response.
        status: u16,
        /// Raw response body, if any was present.
        body: Vec<u8>,
    },
    /// An encoded track or other field provided by the caller failed local
    /// validation and was never sent.
    InvalidInput,
}

impl Display for RestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            RestErrorType::BuildingRequest => f.write_str("failed to build the request"),
            RestErrorType::Sending => f.write_str("sending the request failed"),
            RestErrorType::ResponseTooLarge => {
                f.write_str("response body exceeded the maximum allowed size")
            }
            RestErrorType::Decompressing => f.write_str("failed to decompress response body"),
            RestErrorType::Deserializing => f.write_str("failed to deserialize response body"),
            RestErrorType::Response { status, .. } => {
                write!(f, "node responded with status code {status}")
            }
            RestErrorType::InvalidInput => f.write_str("input failed local validation"),
        }
    }
}

impl Error for RestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// An error that occurred while managing a node's websocket connection.
#[derive(Debug)]
pub struct NodeError {
    pub(crate) kind: NodeErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl NodeError {
    /// Immutable reference to the type of error that occurred.
    pub const fn kind(&self) -> &NodeErrorType {
        &self.kind
    }

    pub(crate) fn new(kind: NodeErrorType, source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            kind,
            source: Some(boxed(source)),
        }
    }

    pub(crate) fn from_kind(kind: NodeErrorType) -> Self {
        Self { kind, source: None }
    }
}

/// Type of [`NodeError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum NodeErrorType {
    /// Establishing the websocket connection to the node failed.
    Connecting,
    /// The connection attempt did not complete within the configured
    /// timeout.
    ConnectTimedOut,
    /// Sending a frame over the websocket failed.
    Sending,
    /// A frame received from the node could not be deserialized.
    Deserializing,
    /// The node closed the connection with a code that this client
    /// considers fatal; the node was destroyed rather than reconnected.
    Fatal {
        /// The websocket close code.
        code: u16,
    },
    /// Reconnection attempts were exhausted.
    ReconnectsExhausted,
}

impl Display for NodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            NodeErrorType::Connecting => f.write_str("failed to connect to the node"),
            NodeErrorType::ConnectTimedOut => f.write_str("connecting to the node timed out"),
            NodeErrorType::Sending => f.write_str("failed to send a frame to the node"),
            NodeErrorType::Deserializing => f.write_str("failed to deserialize an incoming frame"),
            NodeErrorType::Fatal { code } => {
                write!(f, "node closed the connection with fatal code {code}")
            }
            NodeErrorType::ReconnectsExhausted => {
                f.write_str("exhausted the configured number of reconnection attempts")
            }
        }
    }
}

impl Error for NodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// An error that occurred within a player's lifecycle operations.
#[derive(Debug)]
pub struct PlayerError {
    pub(crate) kind: PlayerErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl PlayerError {
    /// Immutable reference to the type of error that occurred.
    pub const fn kind(&self) -> &PlayerErrorType {
        &self.kind
    }

    pub(crate) fn new(kind: PlayerErrorType, source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            kind,
            source: Some(boxed(source)),
        }
    }

    pub(crate) fn from_kind(kind: PlayerErrorType) -> Self {
        Self { kind, source: None }
    }
}

/// Type of [`PlayerError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum PlayerErrorType {
    /// The operation requires a connected player.
    NotConnected,
    /// The player has already been destroyed.
    Destroyed,
    /// The operation requires an actively playing track.
    NotPlaying,
    /// An invalid loop mode name or discriminant was provided.
    InvalidLoopMode,
    /// Communicating with the node's REST API failed.
    Rest,
}

impl Display for PlayerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            PlayerErrorType::NotConnected => f.write_str("player is not connected to a voice channel"),
            PlayerErrorType::Destroyed => f.write_str("player has already been destroyed"),
            PlayerErrorType::NotPlaying => f.write_str("player is not currently playing a track"),
            PlayerErrorType::InvalidLoopMode => f.write_str("invalid loop mode"),
            PlayerErrorType::Rest => f.write_str("the node's REST API returned an error"),
        }
    }
}

impl Error for PlayerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// An error that occurred while interacting with the top-level orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum AquaError {
    /// No node has been configured, so the operation can't be fulfilled.
    NodesUnconfigured,
    /// The guild has no registered player.
    PlayerNotFound,
    /// The requested node is not registered with this orchestrator.
    NodeNotFound,
    /// Sending a command to the player's task failed because its mailbox
    /// was closed (the player has shut down).
    PlayerGone,
}

impl Display for AquaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::NodesUnconfigured => f.write_str("no node has been configured"),
            Self::PlayerNotFound => f.write_str("no player is registered for that guild"),
            Self::NodeNotFound => f.write_str("no node is registered with that name"),
            Self::PlayerGone => f.write_str("the player's task has already shut down"),
        }
    }
}

impl Error for AquaError {}

/// An error that occurred while saving or loading durable player state.
#[derive(Debug)]
pub struct PersistError {
    pub(crate) kind: PersistErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl PersistError {
    /// Immutable reference to the type of error that occurred.
    pub const fn kind(&self) -> &PersistErrorType {
        &self.kind
    }

    pub(crate) fn new(kind: PersistErrorType, source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            kind,
            source: Some(boxed(source)),
        }
    }
}

/// Type of [`PersistError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum PersistErrorType {
    /// A lock file already exists at the target path; another writer (or a
    /// crashed prior process) owns it.
    Locked,
    /// An I/O error occurred while reading or writing the persistence file.
    Io,
    /// A line of the persistence file could not be deserialized.
    Deserializing,
}

impl Display for PersistError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            PersistErrorType::Locked => f.write_str("lock file already exists"),
            PersistErrorType::Io => f.write_str("i/o error"),
            PersistErrorType::Deserializing => {
                f.write_str("failed to deserialize a persisted player record")
            }
        }
    }
}

impl Error for PersistError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AquaError, NodeError, PersistError, PlayerError, RestError, TrackError,
    };
    use static_assertions::assert_impl_all;
    use std::{error::Error, fmt::Debug};

    assert_impl_all!(TrackError: Debug, Error, Send, Sync);
    assert_impl_all!(RestError: Debug, Error, Send, Sync);
    assert_impl_all!(NodeError: Debug, Error, Send, Sync);
    assert_impl_all!(PlayerError: Debug, Error, Send, Sync);
    assert_impl_all!(AquaError: Clone, Debug, Error, PartialEq, Send, Sync);
    assert_impl_all!(PersistError: Debug, Error, Send, Sync);
}
