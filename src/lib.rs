//! # aqualink
//!
//! A distributed, Lavalink protocol v4-compatible player runtime for the
//! `twilight` ecosystem.
//!
//! A bot process typically owns one audio decoder's worth of work per guild
//! voice connection; this crate lets that work live on one or more remote
//! worker nodes instead, federating the bot to them over REST and a
//! push-only WebSocket, and reconciling each guild's [`Player`] with the
//! voice credentials the host gateway delivers.
//!
//! ## Shape
//!
//! - [`client::Aqua`] is the orchestrator: it registers worker nodes, owns
//!   the per-guild [`player::Player`] registry, load-balances new players
//!   across nodes, and migrates or fails players over when a node's
//!   connection drops.
//! - [`player::Player`] is the per-guild aggregate: queue, current track,
//!   volume, loop mode, and a [`connection::Connection`] that reconciles
//!   gateway voice state with the worker.
//! - [`node::Node`] drives one worker's WebSocket lifecycle; [`http::RestClient`]
//!   issues the REST calls Lavalink v4 uses to actually control playback.
//! - [`events::AquaEvent`] is what callers see: the orchestrator's reaction
//!   to a worker frame, not the frame itself.
//! - [`persist`] saves and restores every registered player across process
//!   restarts.
//!
//! None of this crate decodes or mixes audio; that is the worker's job.

#![deny(
    clippy::all,
    clippy::pedantic,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

pub mod batcher;
pub mod circular_buffer;
pub mod client;
pub mod connection;
pub mod error;
pub mod events;
pub mod http;
pub mod model;
pub mod node;
pub mod payload_pool;
pub mod persist;
pub mod player;
pub mod queue;
pub mod track;

pub use crate::{
    client::{Aqua, AquaOptions, ConnectOptions, FailoverOptions, LoadBalancer, PlayerSnapshot},
    error::{AquaError, NodeError, PersistError, PlayerError, RestError, TrackError},
    events::AquaEvent,
    player::{LoopMode, Player},
    track::Track,
};
