//! The REST client used to drive a worker node: player updates, track
//! resolution, and worker capability/maintenance endpoints.
//!
//! Mirrors the way `twilight-http` separates transport concerns (pooling,
//! compression, response size limits) from the request/response bodies
//! themselves, but collapsed into a single client since this crate's surface
//! is a fixed, small set of endpoints rather than the whole Discord API.

use crate::error::{RestError, RestErrorType, TrackError, TrackErrorType};
use http_body_util::{BodyExt, Full};
use hyper::{
    body::Bytes,
    header::{HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE},
    Method, Request, StatusCode, Uri, Version,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client as LegacyClient},
    rt::TokioExecutor,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Mutex, time::Duration};
use tokio::io::{AsyncReadExt, BufReader};

/// Characters left unescaped in query string values, matching the set
/// `application/x-www-form-urlencoded`-adjacent query parameters typically
/// tolerate.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

use crate::model::outgoing::{UpdatePlayer, UpdateSession};

/// Default API version rooted in every request path.
pub const DEFAULT_API_VERSION: &str = "v4";

/// Maximum size, in bytes, of a response body this client will buffer.
///
/// Nodes are trusted infrastructure but not trusted to be well-behaved; a
/// response larger than this is rejected before it is fully read.
pub const MAX_RESPONSE_SIZE: u64 = 10_485_760;

/// Payload size, in bytes, at or above which a request prefers HTTP/2 over
/// HTTP/1.1 when the `lavalink-protocol-http2` feature is enabled.
pub const HTTP2_THRESHOLD: usize = 1024;

type HttpClient = LegacyClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// A track resolved or playing on a node.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// The base64 encoded track, understood only by nodes.
    pub encoded: String,
    /// Information about the track.
    pub info: TrackInfo,
    /// Additional track info provided by plugins.
    #[serde(default)]
    pub plugin_info: Value,
    /// Additional track data provided by plugins and the requester.
    #[serde(default)]
    pub user_data: Value,
}

/// Metadata about a [`Track`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    /// The track identifier.
    pub identifier: String,
    /// Whether the track is seekable.
    pub is_seekable: bool,
    /// The track's author.
    pub author: String,
    /// The length of the track in milliseconds.
    pub length: u64,
    /// Whether the track is a live stream.
    pub is_stream: bool,
    /// The current playback position in milliseconds.
    pub position: u64,
    /// The track's title.
    pub title: String,
    /// The track's URI, if one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// The track's artwork URL, if one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
    /// The track's ISRC, if one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isrc: Option<String>,
    /// The name of the source that resolved this track.
    pub source_name: String,
}

/// An exception thrown while loading or playing a track.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct Exception {
    /// A user-friendly error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The severity of the exception.
    pub severity: Severity,
    /// The underlying cause.
    pub cause: String,
}

/// The severity of an [`Exception`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The cause is known and expected; indicates that there is nothing
    /// wrong with the library itself.
    Common,
    /// The cause might not be exactly known, but is possibly caused by
    /// outside factors.
    Suspicious,
    /// A serious error occurred that may require an update or change in the
    /// library's source code.
    Fault,
}

/// A list of tracks loaded together, for example from a playlist URL.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    /// Information about the playlist.
    pub info: PlaylistInfo,
    /// Additional playlist info provided by plugins.
    #[serde(default)]
    pub plugin_info: Value,
    /// The tracks belonging to the playlist.
    pub tracks: Vec<Track>,
}

/// Metadata about a [`Playlist`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    /// The playlist's name.
    pub name: String,
    /// The selected track in the playlist, or `-1` if none is selected.
    pub selected_track: i64,
}

/// The result of a `/loadtracks` request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResult {
    /// A single track was resolved.
    Track(Box<Track>),
    /// A playlist was resolved.
    Playlist(Box<Playlist>),
    /// A search query resolved to a list of candidate tracks.
    Search(Vec<Track>),
    /// Nothing could be resolved for the given identifier.
    Empty {},
    /// Loading failed with an exception.
    Error(Exception),
}

/// The `track` field of an [`UpdatePlayer`] body.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerTrack {
    /// The base64 encoded track to play. `None` clears the current track.
    pub encoded: Option<String>,
    /// An identifier to resolve and play, mutually exclusive with
    /// [`Self::encoded`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Additional data to attach to the track, round-tripped back on
    /// player/track events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
}

/// A player as reported by `GET /sessions/{sid}/players[/{guild}]`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "camelCase")]
pub struct RemotePlayer {
    /// The guild ID this player belongs to.
    pub guild_id: String,
    /// The currently playing track, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<Track>,
    /// The player's current volume.
    pub volume: i64,
    /// Whether the player is paused.
    pub paused: bool,
    /// Opaque audio filter configuration.
    #[serde(default)]
    pub filters: Value,
}

pub(crate) fn validate_base64(value: &str) -> Result<(), TrackError> {
    let is_valid = !value.is_empty()
        && value.len() % 4 != 1
        && value.bytes().all(|byte| {
            byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'=' | b'-' | b'_')
        });

    if is_valid {
        Ok(())
    } else {
        Err(TrackError::from(TrackErrorType::InvalidBase64))
    }
}

/// HTTP client for a single node's REST API.
///
/// Carries the node's session id once a `ready` frame has been received over
/// its websocket; requests issued before that point fail locally rather than
/// reaching the wire with a malformed path.
#[derive(Debug)]
pub struct RestClient {
    authorization: Box<str>,
    base_url: Box<str>,
    api_version: Box<str>,
    http: HttpClient,
    session_id: Mutex<Option<Box<str>>>,
}

impl RestClient {
    /// Create a new REST client for a node reachable at `base_url` (for
    /// example `https://node.example.com:2333`), authenticating with the
    /// static `authorization` password header.
    ///
    /// # Errors
    ///
    /// Returns an error of type [`RestErrorType::BuildingRequest`] if the
    /// platform's native TLS root certificates could not be loaded.
    pub fn new(
        base_url: impl Into<Box<str>>,
        authorization: impl Into<Box<str>>,
    ) -> Result<Self, RestError> {
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|source| RestError::new(RestErrorType::BuildingRequest, source))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let http = LegacyClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(60))
            .build(connector);

        Ok(Self {
            authorization: authorization.into(),
            base_url: base_url.into(),
            api_version: DEFAULT_API_VERSION.into(),
            http,
            session_id: Mutex::new(None),
        })
    }

    /// This client's configured base URL, e.g. `https://node.example.com:2333`.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// This client's static authorization password.
    #[must_use]
    pub fn authorization(&self) -> &str {
        &self.authorization
    }

    /// The node's session id, if one has been assigned by a `ready` frame.
    #[must_use]
    pub fn session_id(&self) -> Option<Box<str>> {
        self.session_id.lock().unwrap_or_else(|err| err.into_inner()).clone()
    }

    /// Set the node's session id, as reported by a `ready` frame.
    pub fn set_session_id(&self, session_id: impl Into<Box<str>>) {
        *self.session_id.lock().unwrap_or_else(|err| err.into_inner()) = Some(session_id.into());
    }

    /// Clear the node's session id.
    ///
    /// Called when a player update 404s with a body mentioning `sessionId`,
    /// forcing the node back through a fresh `ready` handshake.
    pub fn clear_session_id(&self) {
        *self.session_id.lock().unwrap_or_else(|err| err.into_inner()) = None;
    }

    fn url(&self, path: &str) -> Result<Uri, RestError> {
        let mut buf = String::with_capacity(self.base_url.len() + self.api_version.len() + path.len() + 2);
        buf.push_str(&self.base_url);
        buf.push('/');
        buf.push_str(&self.api_version);
        buf.push_str(path);

        buf.parse()
            .map_err(|source| RestError::new(RestErrorType::BuildingRequest, source))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + ?Sized)>,
    ) -> Result<Option<T>, RestError> {
        let uri = self.url(path)?;
        tracing::trace!(%method, %path, "rest request");
        let body_bytes = body
            .map(|body| serde_json::to_vec(body))
            .transpose()
            .map_err(|source| RestError::new(RestErrorType::BuildingRequest, source))?
            .unwrap_or_default();

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, header_value(&self.authorization)?)
            .header(ACCEPT_ENCODING, HeaderValue::from_static("br, gzip, deflate"));

        if !body_bytes.is_empty() {
            builder = builder.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        if body_bytes.len() >= HTTP2_THRESHOLD {
            builder = builder.version(Version::HTTP_2);
        }

        let request = builder
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|source| RestError::new(RestErrorType::BuildingRequest, source))?;

        let response = self
            .http
            .request(request)
            .await
            .map_err(|source| RestError::new(RestErrorType::Sending, source))?;

        let status = response.status();
        let encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let collected = http_body_util::Limited::new(response.into_body(), MAX_RESPONSE_SIZE as usize)
            .collect()
            .await
            .map_err(|_| RestError::from_kind(RestErrorType::ResponseTooLarge))?
            .to_bytes();

        let bytes = decompress(collected, encoding.as_deref()).await?;

        if status == StatusCode::NO_CONTENT || bytes.is_empty() {
            return if status.is_success() {
                Ok(None)
            } else {
                Err(RestError::from_kind(RestErrorType::Response {
                    status: status.as_u16(),
                    body: bytes.to_vec(),
                }))
            };
        }

        if !status.is_success() {
            if status == StatusCode::NOT_FOUND && body_mentions_session_id(&bytes) {
                tracing::warn!(%path, "session id rejected by worker, clearing");
                self.clear_session_id();
            }

            return Err(RestError::from_kind(RestErrorType::Response {
                status: status.as_u16(),
                body: bytes.to_vec(),
            }));
        }

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| RestError::new(RestErrorType::Deserializing, source))
    }

    /// `PATCH /sessions/{sid}/players/{guild}?noReplace={no_replace}`.
    pub async fn update_player(
        &self,
        session_id: &str,
        guild_id: u64,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<Option<RemotePlayer>, RestError> {
        let path = format!(
            "/sessions/{session_id}/players/{guild_id}?noReplace={no_replace}",
        );
        self.request(Method::PATCH, &path, Some(update)).await
    }

    /// `GET /sessions/{sid}/players`.
    pub async fn players(&self, session_id: &str) -> Result<Vec<RemotePlayer>, RestError> {
        let path = format!("/sessions/{session_id}/players");
        Ok(self
            .request::<Vec<RemotePlayer>>(Method::GET, &path, None::<&()>)
            .await?
            .unwrap_or_default())
    }

    /// `GET /sessions/{sid}/players/{guild}`.
    pub async fn player(
        &self,
        session_id: &str,
        guild_id: u64,
    ) -> Result<Option<RemotePlayer>, RestError> {
        let path = format!("/sessions/{session_id}/players/{guild_id}");
        self.request(Method::GET, &path, None::<&()>).await
    }

    /// `DELETE /sessions/{sid}/players/{guild}`.
    pub async fn destroy_player(&self, session_id: &str, guild_id: u64) -> Result<(), RestError> {
        let path = format!("/sessions/{session_id}/players/{guild_id}");
        self.request::<Value>(Method::DELETE, &path, None::<&()>)
            .await
            .map(drop)
    }

    /// `GET /loadtracks?identifier=...`.
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, RestError> {
        let mut path = String::from("/loadtracks?identifier=");
        append_query_value(&mut path, identifier);
        self.request(Method::GET, &path, None::<&()>)
            .await?
            .ok_or_else(|| RestError::from_kind(RestErrorType::Deserializing))
    }

    /// `GET /decodetrack?encodedTrack=...`, validating the input locally
    /// before sending it.
    pub async fn decode_track(&self, encoded: &str) -> Result<Track, RestError> {
        validate_base64(encoded).map_err(|_| RestError::from_kind(RestErrorType::InvalidInput))?;

        let mut path = String::from("/decodetrack?encodedTrack=");
        append_query_value(&mut path, encoded);
        self.request(Method::GET, &path, None::<&()>)
            .await?
            .ok_or_else(|| RestError::from_kind(RestErrorType::Deserializing))
    }

    /// `POST /decodetracks`, validating every input locally before sending.
    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>, RestError> {
        for track in encoded {
            validate_base64(track).map_err(|_| RestError::from_kind(RestErrorType::InvalidInput))?;
        }

        self.request(Method::POST, "/decodetracks", Some(&encoded))
            .await?
            .ok_or_else(|| RestError::from_kind(RestErrorType::Deserializing))
    }

    /// `GET /stats`.
    pub async fn stats(&self) -> Result<Value, RestError> {
        self.request(Method::GET, "/stats", None::<&()>)
            .await?
            .ok_or_else(|| RestError::from_kind(RestErrorType::Deserializing))
    }

    /// `GET /info`.
    pub async fn info(&self) -> Result<Value, RestError> {
        self.request(Method::GET, "/info", None::<&()>)
            .await?
            .ok_or_else(|| RestError::from_kind(RestErrorType::Deserializing))
    }

    /// `GET /version`. This endpoint is unversioned and plain text, so it is
    /// fetched relative to the node's root rather than `/<api_version>`.
    pub async fn version(&self) -> Result<String, RestError> {
        let uri: Uri = format!("{}/version", self.base_url)
            .parse()
            .map_err(|source| RestError::new(RestErrorType::BuildingRequest, source))?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(AUTHORIZATION, header_value(&self.authorization)?)
            .body(Full::new(Bytes::new()))
            .map_err(|source| RestError::new(RestErrorType::BuildingRequest, source))?;

        let response = self
            .http
            .request(request)
            .await
            .map_err(|source| RestError::new(RestErrorType::Sending, source))?;

        let status = response.status();
        let bytes = http_body_util::Limited::new(response.into_body(), MAX_RESPONSE_SIZE as usize)
            .collect()
            .await
            .map_err(|_| RestError::from_kind(RestErrorType::ResponseTooLarge))?
            .to_bytes();

        if !status.is_success() {
            return Err(RestError::from_kind(RestErrorType::Response {
                status: status.as_u16(),
                body: bytes.to_vec(),
            }));
        }

        String::from_utf8(bytes.to_vec())
            .map_err(|source| RestError::new(RestErrorType::Deserializing, source))
    }

    /// `GET /routeplanner/status`.
    pub async fn route_planner_status(&self) -> Result<Value, RestError> {
        self.request(Method::GET, "/routeplanner/status", None::<&()>)
            .await?
            .ok_or_else(|| RestError::from_kind(RestErrorType::Deserializing))
    }

    /// `POST /routeplanner/free/address`.
    pub async fn route_planner_free_address(&self, address: &str) -> Result<(), RestError> {
        let body = serde_json::json!({ "address": address });
        self.request::<Value>(Method::POST, "/routeplanner/free/address", Some(&body))
            .await
            .map(drop)
    }

    /// `POST /routeplanner/free/all`.
    pub async fn route_planner_free_all(&self) -> Result<(), RestError> {
        self.request::<Value>(Method::POST, "/routeplanner/free/all", None::<&()>)
            .await
            .map(drop)
    }

    /// `GET /sessions/{sid}/players/{guild}/track/lyrics?skipTrackSource={b}`.
    pub async fn player_lyrics(
        &self,
        session_id: &str,
        guild_id: u64,
        skip_track_source: bool,
    ) -> Result<Value, RestError> {
        let path = format!(
            "/sessions/{session_id}/players/{guild_id}/track/lyrics?skipTrackSource={skip_track_source}",
        );
        self.request(Method::GET, &path, None::<&()>)
            .await?
            .ok_or_else(|| RestError::from_kind(RestErrorType::Deserializing))
    }

    /// `GET /lyrics?track={encoded}`.
    pub async fn lyrics(&self, encoded_track: &str) -> Result<Value, RestError> {
        let mut path = String::from("/lyrics?track=");
        append_query_value(&mut path, encoded_track);
        self.request(Method::GET, &path, None::<&()>)
            .await?
            .ok_or_else(|| RestError::from_kind(RestErrorType::Deserializing))
    }

    /// `GET /lyrics/search?query=...`.
    pub async fn lyrics_search(&self, query: &str) -> Result<Value, RestError> {
        let mut path = String::from("/lyrics/search?query=");
        append_query_value(&mut path, query);
        self.request(Method::GET, &path, None::<&()>)
            .await?
            .ok_or_else(|| RestError::from_kind(RestErrorType::Deserializing))
    }

    /// `PATCH /sessions/{sid}`, enabling session resumption.
    pub async fn update_session(
        &self,
        session_id: &str,
        update: &UpdateSession,
    ) -> Result<(), RestError> {
        let path = format!("/sessions/{session_id}");
        self.request::<Value>(Method::PATCH, &path, Some(update))
            .await
            .map(drop)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, RestError> {
    HeaderValue::from_str(value).map_err(|source| RestError::new(RestErrorType::BuildingRequest, source))
}

fn append_query_value(buf: &mut String, value: &str) {
    buf.extend(utf8_percent_encode(value, QUERY_VALUE));
}

fn body_mentions_session_id(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| value.get("message").and_then(Value::as_str).map(str::to_owned))
        .is_some_and(|message| message.contains("sessionId"))
}

async fn decompress(bytes: Bytes, encoding: Option<&str>) -> Result<Bytes, RestError> {
    use async_compression::tokio::bufread::{BrotliDecoder, DeflateDecoder, GzipDecoder};

    let mut out = Vec::new();

    match encoding {
        Some("br") => {
            let mut decoder = BrotliDecoder::new(BufReader::new(&bytes[..]));
            decoder
                .read_to_end(&mut out)
                .await
                .map_err(|source| RestError::new(RestErrorType::Decompressing, source))?;
        }
        Some("gzip") => {
            let mut decoder = GzipDecoder::new(BufReader::new(&bytes[..]));
            decoder
                .read_to_end(&mut out)
                .await
                .map_err(|source| RestError::new(RestErrorType::Decompressing, source))?;
        }
        Some("deflate") => {
            let mut decoder = DeflateDecoder::new(BufReader::new(&bytes[..]));
            decoder
                .read_to_end(&mut out)
                .await
                .map_err(|source| RestError::new(RestErrorType::Decompressing, source))?;
        }
        _ => return Ok(bytes),
    }

    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(RestClient: Send, Sync);
    assert_impl_all!(Track: Clone, Send, Sync);

    #[test]
    fn validate_base64_rejects_invalid_chars() {
        assert!(validate_base64("QQAAAAAAAAAA").is_ok());
        assert!(validate_base64("not valid base64!!").is_err());
        assert!(validate_base64("").is_err());
    }

    #[test]
    fn validate_base64_rejects_length_mod_four_equals_one() {
        assert!(validate_base64("QUQAQ").is_err());
        assert!(validate_base64("QUQA").is_ok());
    }

    #[test]
    fn load_result_tags_by_load_type() {
        let json = serde_json::json!({ "loadType": "empty", "data": {} });
        let result: LoadResult = serde_json::from_value(json).unwrap();
        assert_eq!(result, LoadResult::Empty {});
    }

    #[test]
    fn update_player_track_null_clears() {
        let track = UpdatePlayerTrack::default();
        let json = serde_json::to_value(&track).unwrap();
        assert_eq!(json, serde_json::json!({ "encoded": null }));
    }

    #[test]
    fn body_mentions_session_id_detects_message() {
        let body = br#"{"message": "Session not found: sessionId abc"}"#;
        assert!(body_mentions_session_id(body));
        assert!(!body_mentions_session_id(br#"{"message": "not found"}"#));
    }
}
