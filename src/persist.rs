//! Durable save/restore of player state across process restarts.
//!
//! The file is line-delimited JSON: a header line describing each node's
//! last-known worker session id, followed by one short-keyed object per
//! player. Writes go through a lock file and a temporary file so a reader
//! never observes a partially written snapshot, following the same
//! create-then-rename discipline the rest of the ecosystem uses for
//! crash-safe config writes.

use crate::{
    client::{Aqua, PlayerSnapshot},
    error::{PersistError, PersistErrorType},
    player::LoopMode,
    track::Track,
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, io::ErrorKind, path::Path};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
};
use twilight_model::id::{
    marker::{ChannelMarker, GuildMarker},
    Id,
};

/// Default cap on concurrently restored players per [`load`] call.
pub const PLAYER_BATCH_SIZE: usize = 20;

const HEADER_TYPE: &str = "node_sessions";

/// The header line: each registered node's name mapped to its worker
/// session id, applied to matching nodes before any player is restored.
#[derive(Debug, Deserialize, Serialize)]
struct SessionHeader {
    #[serde(rename = "type")]
    kind: Box<str>,
    data: HashMap<Box<str>, Box<str>>,
}

/// One player's persisted record, with the short keys described in the
/// file format.
#[derive(Debug, Default, Deserialize, Serialize)]
struct PersistedPlayer {
    g: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    t: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    v: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    u: Option<String>,
    p: i64,
    ts: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    q: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    r: Option<String>,
    vol: i64,
    pa: bool,
    pl: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    nw: Option<String>,
    resuming: bool,
}

fn lock_path(path: &Path) -> std::path::PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    lock.into()
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tmp.into()
}

async fn acquire_lock(path: &Path) -> Result<std::path::PathBuf, PersistError> {
    let lock = lock_path(path);

    match OpenOptions::new().write(true).create_new(true).open(&lock).await {
        Ok(_) => Ok(lock),
        Err(source) if source.kind() == ErrorKind::AlreadyExists => {
            Err(PersistError::new(PersistErrorType::Locked, source))
        }
        Err(source) => Err(PersistError::new(PersistErrorType::Io, source)),
    }
}

async fn release_lock(lock: &Path) {
    let _ = fs::remove_file(lock).await;
}

fn to_record(snapshot: &PlayerSnapshot, max_queue_save: usize) -> PersistedPlayer {
    let current_uri = snapshot.current.as_ref().and_then(Track::uri).map(str::to_owned);
    let requester = snapshot
        .current
        .as_ref()
        .and_then(Track::requester)
        .map(|requester| requester.to_string());

    let queue = snapshot
        .queue_snapshot
        .iter()
        .filter_map(Track::uri)
        .take(max_queue_save)
        .map(str::to_owned)
        .collect();

    PersistedPlayer {
        g: snapshot.guild_id.get(),
        t: snapshot.text_channel_id.map(Id::get),
        v: snapshot.voice_channel_id.map(Id::get),
        u: current_uri,
        p: snapshot.position_adjusted,
        ts: crate::client::now_ms(),
        q: queue,
        r: requester,
        vol: snapshot.volume,
        pa: snapshot.paused,
        pl: snapshot.current.is_some(),
        nw: None,
        resuming: true,
    }
}

fn from_record(record: PersistedPlayer, max_tracks_restore: usize) -> PlayerSnapshot {
    let current = record.u.map(|uri| Track::from_uri(uri, record.r.clone().map(Into::into)));

    let queue_snapshot = record
        .q
        .into_iter()
        .take(max_tracks_restore)
        .map(|uri| Track::from_uri(uri, record.r.clone().map(Into::into)))
        .collect();

    PlayerSnapshot {
        guild_id: Id::<GuildMarker>::new(record.g.max(1)),
        text_channel_id: record.t.map(|v| Id::<ChannelMarker>::new(v.max(1))),
        voice_channel_id: record.v.map(|v| Id::<ChannelMarker>::new(v.max(1))),
        volume: record.vol,
        paused: record.pa,
        position_adjusted: record.p,
        current,
        queue_snapshot,
        loop_mode: LoopMode::None,
        shuffle: false,
        deaf: false,
        connected: record.v.is_some(),
    }
}

/// Save every currently registered player to `path`, following the
/// lock/tmp/fsync/rename/unlink write protocol.
///
/// # Errors
///
/// Returns [`PersistErrorType::Locked`] if another writer already holds
/// `path`'s lock file, or [`PersistErrorType::Io`] if any filesystem
/// operation fails.
pub async fn save(aqua: &Aqua, path: &Path) -> Result<(), PersistError> {
    let lock = acquire_lock(path).await?;
    let result = save_locked(aqua, path).await;

    if result.is_err() {
        let _ = fs::remove_file(tmp_path(path)).await;
    }

    release_lock(&lock).await;
    result
}

async fn save_locked(aqua: &Aqua, path: &Path) -> Result<(), PersistError> {
    let tmp = tmp_path(path);
    let max_queue_save = aqua.options().max_queue_save;

    let mut file = File::create(&tmp)
        .await
        .map_err(|source| PersistError::new(PersistErrorType::Io, source))?;

    let header = SessionHeader {
        kind: HEADER_TYPE.into(),
        data: aqua
            .node_sessions()
            .into_iter()
            .filter_map(|(name, session)| session.map(|session| (Box::<str>::from(&*name), session)))
            .collect(),
    };

    write_line(&mut file, &header).await?;

    for snapshot in aqua.capture_all().await {
        let record = to_record(&snapshot, max_queue_save);
        write_line(&mut file, &record).await?;
    }

    file.flush().await.map_err(|source| PersistError::new(PersistErrorType::Io, source))?;
    file.sync_all().await.map_err(|source| PersistError::new(PersistErrorType::Io, source))?;
    drop(file);

    fs::rename(&tmp, path)
        .await
        .map_err(|source| PersistError::new(PersistErrorType::Io, source))
}

async fn write_line(file: &mut File, value: &impl Serialize) -> Result<(), PersistError> {
    let mut line = serde_json::to_vec(value).map_err(|source| PersistError::new(PersistErrorType::Io, source))?;
    line.push(b'\n');
    file.write_all(&line).await.map_err(|source| PersistError::new(PersistErrorType::Io, source))
}

/// Load players from `path` into `aqua`, assigning each to a node chosen by
/// the configured load-balancing policy (the file itself carries no node
/// binding). Applies the header's session ids to matching nodes first, so
/// they can attempt a resume on their next connection.
///
/// Up to [`PLAYER_BATCH_SIZE`] players are restored concurrently per batch.
/// Truncates `path` once loading completes.
///
/// # Errors
///
/// Returns [`PersistErrorType::Locked`] if another writer holds `path`'s
/// lock file, [`PersistErrorType::Io`] on filesystem failure, or
/// [`PersistErrorType::Deserializing`] if a line is malformed.
pub async fn load(aqua: &Aqua, path: &Path) -> Result<usize, PersistError> {
    let lock = acquire_lock(path).await?;
    let result = load_locked(aqua, path).await;
    release_lock(&lock).await;
    result
}

async fn load_locked(aqua: &Aqua, path: &Path) -> Result<usize, PersistError> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(source) if source.kind() == ErrorKind::NotFound => return Ok(0),
        Err(source) => return Err(PersistError::new(PersistErrorType::Io, source)),
    };

    let mut lines = BufReader::new(file).lines();
    let mut restored = 0usize;
    let mut batch = Vec::with_capacity(PLAYER_BATCH_SIZE);
    let mut first_line = true;
    let max_tracks_restore = aqua.options().max_tracks_restore;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|source| PersistError::new(PersistErrorType::Io, source))?
    {
        if line.trim().is_empty() {
            continue;
        }

        if first_line {
            first_line = false;
            if let Ok(header) = serde_json::from_str::<SessionHeader>(&line) {
                if &*header.kind == HEADER_TYPE {
                    for (name, session_id) in header.data {
                        aqua.set_node_session(&name, &session_id);
                    }
                    continue;
                }
            }
        }

        let record: PersistedPlayer = serde_json::from_str(&line)
            .map_err(|source| PersistError::new(PersistErrorType::Deserializing, source))?;
        batch.push(from_record(record, max_tracks_restore));

        if batch.len() >= PLAYER_BATCH_SIZE {
            restored += restore_batch(aqua, std::mem::take(&mut batch)).await;
        }
    }

    restored += restore_batch(aqua, batch).await;

    fs::File::create(path)
        .await
        .map_err(|source| PersistError::new(PersistErrorType::Io, source))?;

    Ok(restored)
}

async fn restore_batch(aqua: &Aqua, batch: Vec<PlayerSnapshot>) -> usize {
    let restores = batch.into_iter().map(|snapshot| async move {
        let Some(node_name) = aqua.choose_node() else {
            return false;
        };
        aqua.restore_player(&node_name, snapshot).await.is_ok()
    });

    join_all(restores)
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_json() {
        let record = PersistedPlayer {
            g: 42,
            t: Some(1),
            v: Some(2),
            u: Some("https://example.com/track".to_owned()),
            p: 1_000,
            ts: 2_000,
            q: vec!["https://example.com/next".to_owned()],
            r: Some("123:someone".to_owned()),
            vol: 80,
            pa: false,
            pl: true,
            nw: None,
            resuming: true,
        };

        let line = serde_json::to_string(&record).unwrap();
        let parsed: PersistedPlayer = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.g, 42);
        assert_eq!(parsed.u.as_deref(), Some("https://example.com/track"));
        assert_eq!(parsed.q.len(), 1);
    }

    #[test]
    fn header_round_trips_through_json() {
        let mut data = HashMap::new();
        data.insert("node-a".into(), "session-123".into());

        let header = SessionHeader {
            kind: HEADER_TYPE.into(),
            data,
        };

        let line = serde_json::to_string(&header).unwrap();
        let parsed: SessionHeader = serde_json::from_str(&line).unwrap();
        assert_eq!(&*parsed.kind, HEADER_TYPE);
        assert_eq!(parsed.data.get("node-a").map(AsRef::as_ref), Some("session-123"));
    }

    #[test]
    fn from_record_caps_restored_queue_length() {
        let record = PersistedPlayer {
            g: 1,
            q: vec!["a".into(), "b".into(), "c".into()],
            vol: 100,
            ..PersistedPlayer::default()
        };

        let snapshot = from_record(record, 2);
        assert_eq!(snapshot.queue_snapshot.len(), 2);
    }
}
