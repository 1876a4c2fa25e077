//! Persistent push channel to the server (sec 4.7): turns `file_change`
//! websocket messages into [`SyncEvent`]s and replays missed changes
//! against the stored cursor on every reconnect.

use crate::api_client::{ApiClient, ChangesResult};
use crate::config::EngineConfig;
use crate::events::{EventType, SyncEvent};
use crate::pathsafety::validate_relative_path;
use crate::state::StateDb;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::Message;

/// How long a connection may sit idle before it is considered dead and
/// forced to reconnect (sec 5: periodic message timeout).
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);
const CHANGES_PAGE_SIZE: u32 = 200;

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    message_type: String,
    action: Option<String>,
    path: Option<String>,
    timestamp: Option<String>,
}

fn action_to_event_type(action: &str) -> Option<EventType> {
    match action {
        "CREATED" => Some(EventType::RemoteCreated),
        "UPDATED" => Some(EventType::RemoteModified),
        "DELETED" => Some(EventType::RemoteDeleted),
        _ => None,
    }
}

fn parse_remote_event(text: &str) -> Option<SyncEvent> {
    let raw: RawMessage = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(target: "remote_listener", %err, "ignoring invalid push message");
            return None;
        }
    };

    if raw.message_type != "file_change" {
        return None;
    }
    let path = match raw.path.as_deref().map(validate_relative_path) {
        Some(Ok(path)) => path,
        Some(Err(err)) => {
            tracing::warn!(target: "remote_listener", %err, "ignoring push message with unsafe path");
            return None;
        }
        None => return None,
    };
    let event_type = action_to_event_type(raw.action.as_deref().unwrap_or(""))?;
    let timestamp = raw
        .timestamp
        .as_deref()
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp())
        .unwrap_or_else(|| chrono::Utc::now().timestamp());

    Some(SyncEvent { path, event_type, mtime: None, timestamp, dest_path: None })
}

/// Runs the push-channel loop until `shutdown` fires. Reconnects with a
/// fixed delay (sec 4.7 names no backoff here, unlike the transfer retry
/// path) and catches up on missed changes before resuming live delivery.
pub async fn run(
    api: Arc<ApiClient>,
    state_db: Arc<StateDb>,
    config: EngineConfig,
    events: UnboundedSender<SyncEvent>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        match api.connect_websocket().await {
            Ok(stream) => {
                tracing::info!(target: "remote_listener", "push channel connected");
                if let Err(err) = catch_up(&api, &state_db, &events).await {
                    tracing::error!(target: "remote_listener", %err, "failed to catch up on missed changes");
                }
                listen(stream, &events, &mut shutdown).await;
            }
            Err(err) => {
                tracing::warn!(target: "remote_listener", %err, "failed to connect push channel");
            }
        }

        if *shutdown.borrow() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay()) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn listen<S>(
    mut stream: tokio_tungstenite::WebSocketStream<S>,
    events: &UnboundedSender<SyncEvent>,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            msg = tokio::time::timeout(MESSAGE_TIMEOUT, stream.next()) => msg,
            _ = shutdown.changed() => {
                let _ = stream.close(None).await;
                return;
            }
        };

        match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Some(event) = parse_remote_event(&text) {
                    let _ = events.send(event);
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                tracing::info!(target: "remote_listener", "push channel closed by server");
                return;
            }
            Ok(Some(Ok(_))) => {
                // binary / ping / pong frames carry no sync-relevant payload
            }
            Ok(Some(Err(err))) => {
                tracing::warn!(target: "remote_listener", %err, "push channel error");
                return;
            }
            Err(_) => {
                tracing::warn!(target: "remote_listener", "push channel idle past message timeout, reconnecting");
                return;
            }
        }
    }
}

async fn catch_up(
    api: &ApiClient,
    state_db: &StateDb,
    events: &UnboundedSender<SyncEvent>,
) -> anyhow::Result<()> {
    let since = state_db
        .get_cursor()?
        .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap().to_rfc3339());

    let mut since = since;
    loop {
        let response = match api.get_changes(&since, CHANGES_PAGE_SIZE).await? {
            ChangesResult::FullResyncRequired => return full_resync(api, state_db, events).await,
            ChangesResult::Delta(response) => response,
        };

        for change in &response.changes {
            let Some(event_type) = action_to_event_type(&change.action) else { continue };
            let path = match validate_relative_path(&change.path) {
                Ok(path) => path,
                Err(err) => {
                    tracing::warn!(target: "remote_listener", %err, "ignoring changes entry with unsafe path");
                    continue;
                }
            };
            let timestamp = chrono::DateTime::parse_from_rfc3339(&change.timestamp)
                .map(|t| t.timestamp())
                .unwrap_or_else(|_| chrono::Utc::now().timestamp());
            let _ = events.send(SyncEvent { path, event_type, mtime: None, timestamp, dest_path: None });
        }

        state_db.set_cursor(&response.latest_timestamp)?;
        since = response.latest_timestamp.clone();

        if !response.has_more {
            break;
        }
    }
    Ok(())
}

/// The stored cursor is older than the server's retention window: re-walk
/// the entire remote tree and emit a remote-modified event for every file
/// whose server version is newer than what we last recorded, per
/// [`crate::state::FileRecord::needs_download`] — files already at the
/// server's version are left alone rather than re-downloaded wholesale.
async fn full_resync(
    api: &ApiClient,
    state_db: &StateDb,
    events: &UnboundedSender<SyncEvent>,
) -> anyhow::Result<()> {
    tracing::warn!(target: "remote_listener", "cursor stale, performing full resync");
    let files = api.list_files("").await?;
    let now = chrono::Utc::now();

    for file in files {
        let path = match validate_relative_path(&file.path) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(target: "remote_listener", %err, "ignoring resync entry with unsafe path");
                continue;
            }
        };

        let known = state_db.get_file_record(&path)?;
        let stale = known.map(|r| r.needs_download(file.version)).unwrap_or(true);
        if !stale {
            continue;
        }

        let _ = events.send(SyncEvent {
            path,
            event_type: EventType::RemoteModified,
            mtime: None,
            timestamp: now.timestamp(),
            dest_path: None,
        });
    }

    state_db.set_cursor(&now.to_rfc3339())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_change_message_parses_to_remote_event() {
        let json = r#"{"type":"file_change","action":"UPDATED","path":"a.txt","timestamp":"2026-01-01T00:00:00Z"}"#;
        let event = parse_remote_event(json).unwrap();
        assert_eq!(event.path, "a.txt");
        assert_eq!(event.event_type, EventType::RemoteModified);
    }

    #[test]
    fn unknown_message_type_is_ignored() {
        let json = r#"{"type":"heartbeat"}"#;
        assert!(parse_remote_event(json).is_none());
    }

    #[test]
    fn invalid_json_is_ignored() {
        assert!(parse_remote_event("not json").is_none());
    }

    #[test]
    fn unknown_action_is_ignored() {
        let json = r#"{"type":"file_change","action":"RENAMED","path":"a.txt"}"#;
        assert!(parse_remote_event(json).is_none());
    }

    #[test]
    fn path_traversal_message_is_ignored() {
        let json = r#"{"type":"file_change","action":"UPDATED","path":"../../etc/passwd"}"#;
        assert!(parse_remote_event(json).is_none());
    }

    #[test]
    fn absolute_path_message_is_ignored() {
        let json = r#"{"type":"file_change","action":"UPDATED","path":"/etc/passwd"}"#;
        assert!(parse_remote_event(json).is_none());
    }
}
