//! The two subscription tasks behind `Manager::subscribe` — `spec.md` §4.6.
//!
//! Each owns a dedicated `PubSub` connection (regular commands cannot be
//! issued on a connection that has entered subscriber mode) and is spawned
//! as an independent `tokio::spawn` task. They are intentionally not a
//! single combined loop: the manager subscription's `CONFIG SET` failure is
//! terminal and not retried, while the tracking subscription reconnects on
//! a disconnect, mirroring the reconnect-loop idiom of this crate's
//! message-broker ancestor.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::entry::StoredMetadata;
use crate::errors::{CacheError, CacheResult};
use crate::events::CacheEvent;
use crate::tracking::TrackingCache;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

fn keyevent_channel(db: u32, event: &str) -> String {
    format!("__keyevent@{db}__:{event}")
}

/// `P|metadata|id` (or `metadata|id` with no prefix) -> `(prefix, id)`.
fn parse_metadata_key(key: &str) -> Option<(String, String)> {
    if let Some(id) = key.strip_prefix("metadata|") {
        return Some((String::new(), id.to_string()));
    }
    let idx = key.find("|metadata|")?;
    let (prefix, rest) = key.split_at(idx);
    Some((prefix.to_string(), rest["|metadata|".len()..].to_string()))
}

/// Sets up and spawns the manager subscription: optionally issues
/// `CONFIG SET notify-keyspace-events AKE`, subscribes to the `set`/`del`/
/// `expired` keyevent channels, and forwards matching `P|metadata|id`
/// activity as `subscription:entry:add`/`subscription:entry:delete`
/// events. Setup failures (including the `CONFIG SET`) are surfaced
/// immediately and not retried; per-message errors are swallowed into
/// `CacheEvent::Error` so one bad message doesn't kill the task.
pub async fn spawn_manager_subscription(
    client: Client,
    primary: Arc<AsyncMutex<MultiplexedConnection>>,
    db: u32,
    issue_config_set: bool,
    known_prefixes: Vec<String>,
    events_tx: broadcast::Sender<CacheEvent>,
) -> CacheResult<JoinHandle<()>> {
    if issue_config_set {
        let mut setup_conn = client.get_async_connection().await?;
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("AKE")
            .query_async::<_, ()>(&mut setup_conn)
            .await
            .map_err(|e| CacheError::SubscriptionSetup(format!("CONFIG SET notify-keyspace-events: {e}")))?;
    }

    let conn = client
        .get_async_connection()
        .await
        .map_err(|e| CacheError::SubscriptionSetup(e.to_string()))?;
    let mut pubsub = conn.into_pubsub();
    for event in ["set", "del", "expired"] {
        pubsub
            .subscribe(keyevent_channel(db, event))
            .await
            .map_err(|e| CacheError::SubscriptionSetup(e.to_string()))?;
    }

    let handle = tokio::spawn(async move {
        let mut stream = pubsub.into_on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let key: String = match msg.get_payload() {
                Ok(key) => key,
                Err(_) => continue,
            };
            let Some((prefix, id)) = parse_metadata_key(&key) else {
                continue;
            };
            if !known_prefixes.is_empty() && !known_prefixes.contains(&prefix) {
                continue;
            }

            if channel.ends_with(":set") {
                let raw: Option<String> = {
                    let mut conn = primary.lock().await;
                    conn.get(key.as_str()).await.ok().flatten()
                };
                let Some(raw) = raw else { continue };
                match serde_json::from_str::<StoredMetadata>(&raw) {
                    Ok(stored) => {
                        let _ = events_tx.send(CacheEvent::SubscriptionEntryAdd {
                            prefix,
                            id,
                            entry: stored.entry,
                        });
                    }
                    Err(e) => {
                        let _ = events_tx.send(CacheEvent::Error {
                            message: format!("subscription: failed to decode metadata for {id}: {e}"),
                        });
                    }
                }
            } else {
                let _ = events_tx.send(CacheEvent::SubscriptionEntryDelete { prefix, id });
            }
        }
    });

    Ok(handle)
}

/// Sets up and spawns the tracking subscription: `CLIENT ID` on a
/// dedicated connection, `CLIENT TRACKING ON REDIRECT <id>` on the primary
/// connection, then subscribes to `__redis__:invalidate`. Unlike the
/// manager subscription, a dropped connection is reconnected after
/// [`RECONNECT_BACKOFF`] rather than ending the task, since the local
/// tracking cache is only safe to keep serving reads while invalidation
/// delivery is live.
pub async fn spawn_tracking_subscription(
    client: Client,
    primary: Arc<AsyncMutex<MultiplexedConnection>>,
    tracking: Arc<TrackingCache>,
    events_tx: broadcast::Sender<CacheEvent>,
) -> CacheResult<JoinHandle<()>> {
    // Fail fast if the very first setup can't complete — callers should
    // learn about a misconfigured server from `subscribe`'s return value.
    setup_tracking_once(&client, &primary).await?;

    let handle = tokio::spawn(async move {
        loop {
            let mut pubsub = match setup_tracking_once(&client, &primary).await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    tracing::warn!(error = %e, "tracking subscription setup failed, retrying");
                    let _ = events_tx.send(CacheEvent::Error {
                        message: format!("tracking subscription setup failed: {e}"),
                    });
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            };

            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let invalidated: Vec<String> = match msg.get_payload() {
                    Ok(keys) => keys,
                    Err(_) => continue,
                };
                for key in invalidated {
                    let Some((prefix, id)) = parse_metadata_key(&key) else {
                        continue;
                    };
                    for request_key in tracking.evict_by_id(&id) {
                        if let Some((origin, path, method)) = split_request_key(&request_key, &prefix) {
                            let _ = events_tx.send(CacheEvent::TrackingDelete {
                                prefix: prefix.clone(),
                                origin,
                                path,
                                method,
                            });
                        }
                    }
                }
            }

            let _ = events_tx.send(CacheEvent::Error {
                message: "tracking subscription connection closed, reconnecting".to_string(),
            });
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    });

    Ok(handle)
}

async fn setup_tracking_once(
    client: &Client,
    primary: &Arc<AsyncMutex<MultiplexedConnection>>,
) -> CacheResult<redis::aio::PubSub> {
    let mut sub_conn = client
        .get_async_connection()
        .await
        .map_err(|e| CacheError::SubscriptionSetup(e.to_string()))?;

    // `CLIENT ID` must run before the connection enters subscriber mode —
    // once subscribed it can no longer issue arbitrary commands.
    let sub_id: i64 = redis::cmd("CLIENT")
        .arg("ID")
        .query_async(&mut sub_conn)
        .await
        .map_err(|e| CacheError::SubscriptionSetup(format!("CLIENT ID: {e}")))?;

    {
        let mut conn = primary.lock().await;
        redis::cmd("CLIENT")
            .arg("TRACKING")
            .arg("ON")
            .arg("REDIRECT")
            .arg(sub_id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(|e| CacheError::SubscriptionSetup(format!("CLIENT TRACKING ON REDIRECT: {e}")))?;
    }

    let mut pubsub = sub_conn.into_pubsub();
    pubsub
        .subscribe("__redis__:invalidate")
        .await
        .map_err(|e| CacheError::SubscriptionSetup(e.to_string()))?;
    Ok(pubsub)
}

/// `{prefix}|request|{origin}|{path}|{method}` (or with no `prefix|`
/// leader) -> `(origin, path, method)`. `origin`/`path` cannot themselves
/// contain `|` under this schema, so a straight split is exact.
fn split_request_key(request_key: &str, prefix: &str) -> Option<(String, String, String)> {
    let without_prefix = if prefix.is_empty() {
        request_key.strip_prefix("request|")?
    } else {
        request_key
            .strip_prefix(prefix)?
            .strip_prefix('|')?
            .strip_prefix("request|")?
    };
    let mut parts = without_prefix.splitn(3, '|');
    let origin = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let method = parts.next()?.to_string();
    Some((origin, path, method))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_metadata_key_with_prefix() {
        assert_eq!(
            parse_metadata_key("P|metadata|abc-123"),
            Some(("P".to_string(), "abc-123".to_string()))
        );
    }

    #[test]
    fn parses_metadata_key_without_prefix() {
        assert_eq!(
            parse_metadata_key("metadata|abc-123"),
            Some((String::new(), "abc-123".to_string()))
        );
    }

    #[test]
    fn rejects_unrelated_keys() {
        assert_eq!(parse_metadata_key("P|body|abc-123"), None);
    }

    #[test]
    fn splits_request_key_with_prefix() {
        assert_eq!(
            split_request_key("P|request|o|/p|GET", "P"),
            Some(("o".to_string(), "/p".to_string(), "GET".to_string()))
        );
    }

    #[test]
    fn splits_request_key_without_prefix() {
        assert_eq!(
            split_request_key("request|o|/p|GET", ""),
            Some(("o".to_string(), "/p".to_string(), "GET".to_string()))
        );
    }
}
