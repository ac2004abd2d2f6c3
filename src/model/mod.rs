//! Models to (de)serialize incoming/outgoing websocket events and HTTP
//! responses.
//!
//! `incoming` mirrors the frames a node pushes over its websocket
//! (`op: "ready" | "playerUpdate" | "stats" | "event"`); `outgoing` mirrors
//! the bodies this crate sends to a node's REST API to drive playback. The
//! node-facing websocket in protocol v4 is receive-only — commands are
//! REST PATCHes, not websocket frames, unlike older Lavalink protocol
//! revisions.

pub mod incoming;
pub mod outgoing;

pub use incoming::{IncomingEvent, VoiceState};
pub use outgoing::{UpdatePlayer, UpdateSession};
