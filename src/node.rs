//! A worker's websocket control connection: lifecycle, op dispatch, and
//! reconnection backoff.
//!
//! Like [`crate::connection::Connection`], the state transitions here are
//! exposed as pure methods so the backoff and close-code logic can be
//! tested without a websocket in hand; [`Node::run`] is the thin async
//! shell that drives them from real frames.

use crate::{
    error::{NodeError, NodeErrorType},
    http::RestClient,
    model::incoming::IncomingEvent,
};
use http::{
    header::{AUTHORIZATION, HeaderValue},
    Request,
};
use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_websockets::{ClientBuilder, Message};
use tracing::{debug, trace, warn};
use twilight_model::id::{marker::UserMarker, Id};

/// Close codes for which the node is torn down rather than reconnected.
pub const FATAL_CLOSE_CODES: [u16; 6] = [4003, 4004, 4010, 4011, 4012, 4015];
/// Close code that additionally forces the cached session id to be cleared.
pub const SESSION_CLEARING_CLOSE_CODE: u16 = 4011;

/// Ceiling on the reconnect backoff delay, regardless of attempt count.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Ceiling on the random jitter added to a backoff delay.
pub const JITTER_MAX: Duration = Duration::from_secs(2);
/// Fixed delay used between reconnects when `infinite_reconnects` is set.
pub const INFINITE_BACKOFF: Duration = Duration::from_secs(10);
/// Default handshake/REST timeout for a node, overridable per [`NodeConfig`].
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(15);

/// The lifecycle state of a [`Node`]'s control connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum NodeState {
    /// Not connected and not currently trying to connect.
    Idle,
    /// A websocket handshake is in flight.
    Connecting,
    /// A `ready` frame has been received; the node is usable.
    Ready,
    /// The connection dropped and a reconnect attempt is scheduled or in
    /// flight.
    Reconnecting,
}

/// Per-node backoff and reconnection configuration.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Base delay the backoff formula scales from.
    pub reconnect_timeout: Duration,
    /// Exponential base the backoff formula raises to the attempt count.
    pub backoff_multiplier: f64,
    /// Number of reconnect attempts tolerated before the node is destroyed.
    pub reconnect_tries: u32,
    /// If set, reconnect indefinitely using [`INFINITE_BACKOFF`] rather than
    /// giving up after `reconnect_tries`.
    pub infinite_reconnects: bool,
    /// Handshake and REST request timeout.
    pub timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            reconnect_timeout: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            reconnect_tries: 3,
            infinite_reconnects: false,
            timeout: DEFAULT_NODE_TIMEOUT,
        }
    }
}

/// What the owning task should do after a websocket close.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseAction {
    /// Reconnect after `delay`, first clearing the cached session id unless
    /// `keep_session` is set.
    Reconnect {
        /// How long to wait before reconnecting.
        delay: Duration,
        /// Whether the cached session id survives the reconnect.
        keep_session: bool,
    },
    /// The close code is fatal (or reconnects are disabled and the code was
    /// a normal 1000 close); destroy the node. `clear_session` additionally
    /// marks whether the cached session id should be dropped.
    Destroy {
        /// Whether the cached session id should be dropped before the node
        /// is torn down.
        clear_session: bool,
    },
}

/// A worker's control-plane connection: websocket lifecycle plus the REST
/// client used to drive its players.
#[derive(Debug)]
pub struct Node {
    name: Arc<str>,
    config: NodeConfig,
    rest: Arc<RestClient>,
    state: NodeState,
    reconnect_attempted: u32,
}

impl Node {
    /// Create a node named `name`, talking to the REST/websocket endpoints
    /// backing `rest`.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, rest: Arc<RestClient>, config: NodeConfig) -> Self {
        Self {
            name: name.into(),
            config,
            rest,
            state: NodeState::Idle,
            reconnect_attempted: 0,
        }
    }

    /// This node's configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This node's REST client.
    #[must_use]
    pub fn rest(&self) -> &Arc<RestClient> {
        &self.rest
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> NodeState {
        self.state
    }

    /// Number of consecutive reconnect attempts made since the last
    /// successful `ready`.
    #[must_use]
    pub const fn reconnect_attempted(&self) -> u32 {
        self.reconnect_attempted
    }

    /// Record a `ready` frame, deciding whether bound players must be torn
    /// down because the node's session was not resumed.
    ///
    /// Returns `true` if this is a session change that invalidates every
    /// player currently bound to this node.
    pub fn on_ready(&mut self, session_id: &str, resumed: bool) -> bool {
        let session_changed = self.rest.session_id().as_deref() != Some(session_id);

        self.state = NodeState::Ready;
        self.reconnect_attempted = 0;
        self.rest.set_session_id(session_id.to_owned());

        debug!(node = %self.name, resumed, session_changed, "node ready");

        session_changed && !resumed
    }

    /// Classify a websocket close code into the action the owning task
    /// should take.
    #[must_use]
    pub fn classify_close(&self, code: u16) -> CloseAction {
        if FATAL_CLOSE_CODES.contains(&code) {
            return CloseAction::Destroy {
                clear_session: code == SESSION_CLEARING_CLOSE_CODE,
            };
        }

        if code == 1000 && !self.config.infinite_reconnects {
            return CloseAction::Destroy {
                clear_session: false,
            };
        }

        CloseAction::Reconnect {
            delay: Duration::ZERO,
            keep_session: code == 1001,
        }
    }

    /// Compute the next backoff delay and advance the attempt counter.
    ///
    /// Returns `None` once `reconnect_tries` has been exceeded and
    /// `infinite_reconnects` is not set, meaning the node should be
    /// destroyed instead of retried.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.config.infinite_reconnects {
            self.reconnect_attempted += 1;
            return Some(INFINITE_BACKOFF);
        }

        self.reconnect_attempted += 1;

        if self.reconnect_attempted > self.config.reconnect_tries {
            return None;
        }

        Some(backoff_delay(
            self.reconnect_attempted,
            self.config.reconnect_timeout,
            self.config.backoff_multiplier,
        ))
    }

    /// Transition into `Reconnecting`, clearing the session id if
    /// `clear_session` is set (per [`CloseAction`]).
    pub fn begin_reconnect(&mut self, clear_session: bool) {
        warn!(node = %self.name, clear_session, "node reconnecting");
        self.state = NodeState::Reconnecting;
        if clear_session {
            self.rest.clear_session_id();
        }
    }

    /// Transition into `Connecting`, ahead of a handshake attempt.
    pub fn begin_connecting(&mut self) {
        self.state = NodeState::Connecting;
    }

    /// Transition into `Idle`, for example after the node is destroyed.
    pub fn mark_idle(&mut self) {
        self.state = NodeState::Idle;
    }

    /// Open the websocket and run the receive loop until it closes or
    /// errors, forwarding every parsed frame to `events`.
    ///
    /// `base_url` is a `ws://` or `wss://` URL, and `user_id` / `client_name`
    /// populate the handshake headers the worker expects. Returns the close
    /// code the worker reported, or `None` if the stream ended without one
    /// (a non-close frame simply stopped arriving).
    pub async fn run(
        &mut self,
        base_url: &str,
        authorization: &str,
        user_id: Id<UserMarker>,
        client_name: &str,
        events: UnboundedSender<(Arc<str>, IncomingEvent)>,
    ) -> Result<Option<u16>, NodeError> {
        debug!(node = %self.name, %base_url, "connecting to node");
        self.begin_connecting();

        let mut builder = Request::builder()
            .uri(format!("{base_url}/v4/websocket"))
            .header(AUTHORIZATION, header_value(authorization)?)
            .header("User-Id", header_value(&user_id.to_string())?)
            .header("Client-Name", header_value(client_name)?);

        if let Some(session_id) = self.rest.session_id() {
            builder = builder.header("Session-Id", header_value(&session_id)?);
        }

        let request = builder
            .body(())
            .map_err(|source| NodeError::new(NodeErrorType::Connecting, source))?;

        let (mut client, _response) = tokio::time::timeout(
            self.config.timeout,
            ClientBuilder::from_request(request)
                .map_err(|source| NodeError::new(NodeErrorType::Connecting, source))?
                .connect(),
        )
        .await
        .map_err(|_| NodeError::from_kind(NodeErrorType::ConnectTimedOut))?
        .map_err(|source| NodeError::new(NodeErrorType::Connecting, source))?;

        debug!(node = %self.name, "node websocket connected");

        use futures_util::StreamExt;

        while let Some(message) = client.next().await {
            let message = message.map_err(|source| NodeError::new(NodeErrorType::Deserializing, source))?;

            if let Some(text) = as_text(&message) {
                trace!(node = %self.name, frame = text, "inbound node frame");
                if let Some(event) = parse_frame(text) {
                    let _ = events.send((Arc::clone(&self.name), event));
                }
            } else if let Some((code, reason)) = message.as_close() {
                debug!(node = %self.name, code, reason, "node websocket closed");
                return Ok(Some(code));
            } else if message.is_close() {
                debug!(node = %self.name, "node websocket closed without a close frame");
                return Ok(None);
            }
        }

        Ok(None)
    }
}

/// Derive the `ws://`/`wss://` websocket base URL [`Node::run`] requires from
/// a node's `http://`/`https://` REST base URL.
#[must_use]
pub fn websocket_url(rest_base_url: &str) -> String {
    rest_base_url
        .strip_prefix("https://")
        .map(|rest| format!("wss://{rest}"))
        .or_else(|| rest_base_url.strip_prefix("http://").map(|rest| format!("ws://{rest}")))
        .unwrap_or_else(|| rest_base_url.to_owned())
}

fn header_value(value: &str) -> Result<HeaderValue, NodeError> {
    HeaderValue::from_str(value).map_err(|source| NodeError::new(NodeErrorType::Connecting, source))
}

fn as_text(message: &Message) -> Option<&str> {
    message.as_text()
}

/// Parse one JSON websocket frame into an [`IncomingEvent`], discarding
/// anything that isn't a `{`-prefixed JSON object.
///
/// A `{`-prefixed frame that matches none of [`IncomingEvent`]'s known shapes
/// is not dropped: it is forwarded as [`IncomingEvent::Unknown`] with the raw
/// text, logged at debug level, so an orchestrator can still surface
/// unrecognized ops as a custom event instead of losing them silently.
fn parse_frame(text: &str) -> Option<IncomingEvent> {
    if !text.trim_start().starts_with('{') {
        return None;
    }

    match serde_json::from_str(text) {
        Ok(event) => Some(event),
        Err(error) => {
            debug!(%error, frame = text, "unrecognized node frame, forwarding as unknown op");
            Some(IncomingEvent::Unknown(text.to_owned()))
        }
    }
}

/// `base := reconnect_timeout · backoff_multiplier^min(attempt, 10)`,
/// `jitter := U[0, min(JITTER_MAX, base·0.2)]`, capped at [`MAX_BACKOFF`].
fn backoff_delay(attempt: u32, reconnect_timeout: Duration, backoff_multiplier: f64) -> Duration {
    let exponent = attempt.min(10) as i32;
    let base_secs = reconnect_timeout.as_secs_f64() * backoff_multiplier.powi(exponent);
    let jitter_ceiling = (base_secs * 0.2).min(JITTER_MAX.as_secs_f64());
    let jitter_secs = if jitter_ceiling > 0.0 {
        rand::thread_rng().gen_range(0.0..=jitter_ceiling)
    } else {
        0.0
    };

    let total_secs = (base_secs + jitter_secs).min(MAX_BACKOFF.as_secs_f64());
    Duration::from_secs_f64(total_secs.max(0.0))
}

/// Monotonically increasing per-node sequence counter, used by the
/// orchestrator's trace ring buffer to order events from different nodes.
#[derive(Debug, Default)]
pub struct NodeSequence(AtomicU64);

impl NodeSequence {
    /// Return the next sequence number.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        Node::new(
            "test",
            Arc::new(RestClient::new("https://node.example", "pw").unwrap()),
            NodeConfig::default(),
        )
    }

    #[test]
    fn fatal_codes_destroy_without_reconnect() {
        let n = node();
        for code in FATAL_CLOSE_CODES {
            assert!(matches!(n.classify_close(code), CloseAction::Destroy { .. }));
        }
    }

    #[test]
    fn code_4011_clears_session() {
        let n = node();
        assert_eq!(
            n.classify_close(4011),
            CloseAction::Destroy { clear_session: true }
        );
    }

    #[test]
    fn normal_close_reconnects_only_if_infinite() {
        let mut n = node();
        assert!(matches!(n.classify_close(1000), CloseAction::Destroy { .. }));

        n.config.infinite_reconnects = true;
        assert!(matches!(n.classify_close(1000), CloseAction::Reconnect { .. }));
    }

    #[test]
    fn other_codes_reconnect_and_keep_session_only_on_1001() {
        let n = node();
        let CloseAction::Reconnect { keep_session, .. } = n.classify_close(4006) else {
            panic!("expected reconnect");
        };
        assert!(!keep_session);

        let CloseAction::Reconnect { keep_session, .. } = n.classify_close(1001) else {
            panic!("expected reconnect");
        };
        assert!(keep_session);
    }

    #[test]
    fn backoff_is_bounded_by_max_backoff() {
        for attempt in 1..=20 {
            let delay = backoff_delay(attempt, Duration::from_secs(30), 2.0);
            assert!(delay <= MAX_BACKOFF);
        }
    }

    #[test]
    fn next_backoff_gives_up_after_configured_tries() {
        let mut n = node();
        n.config.reconnect_tries = 2;

        assert!(n.next_backoff().is_some());
        assert!(n.next_backoff().is_some());
        assert!(n.next_backoff().is_none());
    }

    #[test]
    fn infinite_reconnects_never_give_up() {
        let mut n = node();
        n.config.infinite_reconnects = true;

        for _ in 0..50 {
            assert_eq!(n.next_backoff(), Some(INFINITE_BACKOFF));
        }
    }

    #[test]
    fn on_ready_detects_session_change_without_resume() {
        let mut n = node();
        n.rest.set_session_id("old");
        assert!(n.on_ready("new", false));
        assert_eq!(n.rest.session_id().as_deref(), Some("new"));
    }

    #[test]
    fn on_ready_resumed_does_not_invalidate() {
        let mut n = node();
        n.rest.set_session_id("old");
        assert!(!n.on_ready("new", true));
    }

    #[test]
    fn parse_frame_rejects_non_json_text() {
        assert!(parse_frame("not json").is_none());
        assert!(parse_frame("  not json").is_none());
    }

    #[test]
    fn parse_frame_forwards_unrecognized_json_objects_as_unknown() {
        let frame = r#"{"op":"somePluginOp","guildId":"1"}"#;
        assert_eq!(parse_frame(frame), Some(IncomingEvent::Unknown(frame.to_owned())));
    }

    #[test]
    fn parse_frame_still_recognizes_ready() {
        let frame = r#"{"op":"ready","resumed":false,"sessionId":"abc"}"#;
        assert!(matches!(parse_frame(frame), Some(IncomingEvent::Ready(_))));
    }

    #[test]
    fn websocket_url_converts_http_schemes() {
        assert_eq!(websocket_url("https://node.example:2333"), "wss://node.example:2333");
        assert_eq!(websocket_url("http://node.example:2333"), "ws://node.example:2333");
    }

    #[test]
    fn websocket_url_leaves_already_converted_urls_alone() {
        assert_eq!(websocket_url("wss://node.example:2333"), "wss://node.example:2333");
    }
}
