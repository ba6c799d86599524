//! Read path — `spec.md` §4.2.

use std::time::{SystemTime, UNIX_EPOCH};

use redis::AsyncCommands;

use super::CacheEngine;
use crate::body;
use crate::cleanup::CleanupTask;
use crate::entry::{CacheEntry, CacheKey, StoredMetadata};
use crate::events::CacheEvent;
use crate::header;
use crate::identifier::Identifier;
use crate::errors::CacheResult;
use crate::scan::for_each_lex_page;
use crate::tracking::TrackingCache;

fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `get(key, prefixes?, includeBody=true)`. Never fails on a logical miss
/// — returns `Ok(None)`. Backend errors propagate.
pub async fn get(
    engine: &CacheEngine,
    key: &CacheKey,
    prefixes: Option<&[String]>,
    include_body: bool,
) -> CacheResult<Option<CacheEntry>> {
    if engine.is_closed() {
        return Ok(None);
    }
    let normalized = header::normalize_headers(&key.headers);
    let now = now_epoch_secs();

    for prefix in engine.resolve_prefixes(prefixes) {
        let request_key = TrackingCache::request_key(&prefix, &key.origin, &key.path, &key.method);

        if let Some(tracking) = &engine.tracking {
            if let Some(identifier) = tracking.find_matching(&request_key, &normalized) {
                if !identifier.is_expired(now) {
                    if let Some(entry) =
                        resolve_entry(engine, &prefix, &request_key, identifier, include_body, true).await?
                    {
                        crate::metrics::record_get_hit(true);
                        tracing::trace!(prefix = %prefix, origin = %key.origin, path = %key.path, "tracking cache hit");
                        return Ok(Some(entry));
                    }
                } else {
                    tracking.evict(&request_key);
                }
            }
        }

        if let Some(identifier) = scan_for_winner(engine, &prefix, key, &normalized, now).await? {
            if let Some(entry) =
                resolve_entry(engine, &prefix, &request_key, identifier, include_body, false).await?
            {
                crate::metrics::record_get_hit(false);
                return Ok(Some(entry));
            }
        }
    }
    crate::metrics::record_get_miss();
    tracing::trace!(origin = %key.origin, path = %key.path, method = %key.method, "cache miss");
    Ok(None)
}

/// Iterate `P|request|origin|path|method` in lex-reverse batches (most
/// specific first, per the zero-padded `score` prefix) and return the
/// first identifier that is not expired and whose Vary matches.
async fn scan_for_winner(
    engine: &CacheEngine,
    prefix: &str,
    key: &CacheKey,
    normalized: &header::NormalizedHeaders,
    now: i64,
) -> CacheResult<Option<Identifier>> {
    let keys = engine.keys_for(prefix);
    let request_key = keys.request(&key.origin, &key.path, &key.method);
    let batch_size = engine.config().max_batch_size;

    let mut winner: Option<Identifier> = None;
    let mut expired_members: Vec<String> = Vec::new();

    {
        let conn_lock = engine.primary_connection().await;
        let mut conn = conn_lock.lock().await;
        for_each_lex_page(&mut conn, &request_key, batch_size, |page| {
            for raw in page {
                let identifier = match Identifier::decode_from_request_set(raw) {
                    Ok(id) => id,
                    Err(_) => continue,
                };
                if identifier.is_expired(now) {
                    expired_members.push(raw.clone());
                    continue;
                }
                if identifier.specificity == 0 || header::vary_matches(&identifier.vary, normalized) {
                    winner = Some(identifier);
                    return false;
                }
            }
            true
        })
        .await?;
    }

    if !expired_members.is_empty() {
        engine.cleanup.push(CleanupTask::Map {
            prefix: prefix.to_string(),
            set_key: request_key,
            members: expired_members,
            origin: key.origin.clone(),
            path: key.path.clone(),
            method: key.method.clone(),
        });
        engine.schedule_cleanup_drain();
    }

    Ok(winner)
}

/// Fetch `metadata` (and `body`, if requested) for a resolved identifier,
/// populate the tracking cache, and emit `tracking:add`.
async fn resolve_entry(
    engine: &CacheEngine,
    prefix: &str,
    request_key: &str,
    identifier: Identifier,
    include_body: bool,
    from_tracking_cache: bool,
) -> CacheResult<Option<CacheEntry>> {
    let keys = engine.keys_for(prefix);
    let metadata_key = keys.metadata(&identifier.id);
    let body_key = keys.body(&identifier.id);

    let conn_lock = engine.primary_connection().await;
    let mut conn = conn_lock.lock().await;

    let metadata_raw: Option<String> = conn.get(metadata_key.as_ref()).await?;
    let Some(metadata_raw) = metadata_raw else {
        drop(conn);
        if !from_tracking_cache {
            // Identifier was live in the index but metadata already expired
            // (EXPIREAT raced the scan); nothing to return.
        } else if let Some(tracking) = &engine.tracking {
            tracking.evict(request_key);
        }
        return Ok(None);
    };

    let body_chunks = if include_body {
        let body_raw: Option<String> = conn.get(body_key.as_ref()).await?;
        Some(body::decode_to_chunks(&body_raw.unwrap_or_default())?)
    } else {
        None
    };
    drop(conn);

    let stored: StoredMetadata = serde_json::from_str(&metadata_raw)?;

    if let Some(tracking) = &engine.tracking {
        tracking.insert(request_key.to_string(), identifier.clone());
        engine.emit(CacheEvent::TrackingAdd {
            prefix: prefix.to_string(),
            origin: stored.origin.clone(),
            path: stored.path.clone(),
            method: stored.method.clone(),
            headers: identifier.vary.clone(),
        });
    }

    Ok(Some(CacheEntry {
        meta: stored.entry,
        id: identifier.id,
        prefix: prefix.to_string(),
        origin: stored.origin,
        method: stored.method,
        path: stored.path,
        cache_tags: identifier.tags,
        body: body_chunks,
    }))
}
