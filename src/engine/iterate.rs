//! Manager facet — iteration and introspection, `spec.md` §4.5.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::stream::{self, StreamExt};
use redis::AsyncCommands;

use super::CacheEngine;
use crate::body;
use crate::cleanup::CleanupTask;
use crate::entry::{CacheEntry, StoredMetadata};
use crate::errors::{CacheError, CacheResult};
use crate::identifier::Identifier;
use crate::key::KeyBuilder;
use crate::scan::collect_lex_reverse;

fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `streamEntries(cb, prefixes?)`: three nested lex-reverse scans (routes →
/// requests → request) per prefix. Metadata for live identifiers is
/// fetched concurrently up to `concurrency`; `cb` itself runs sequentially
/// as each fetch resolves.
pub async fn stream_entries<F>(
    engine: &CacheEngine,
    prefixes: Option<&[String]>,
    mut on_entry: F,
) -> CacheResult<()>
where
    F: FnMut(CacheEntry) -> CacheResult<()>,
{
    engine.ensure_open()?;
    let now = now_epoch_secs();
    let batch_size = engine.config().max_batch_size;
    let concurrency = engine.config().concurrency;

    for prefix in engine.resolve_prefixes(prefixes) {
        let keys = engine.keys_for(&prefix);
        let routes = {
            let conn_lock = engine.primary_connection().await;
            let mut conn = conn_lock.lock().await;
            collect_lex_reverse(&mut conn, &keys.routes(), batch_size).await?
        };

        for route_member in routes {
            let Some((origin, path)) = route_member.split_once('|') else {
                continue;
            };
            let requests_key = keys.requests(origin, path);
            let methods = {
                let conn_lock = engine.primary_connection().await;
                let mut conn = conn_lock.lock().await;
                collect_lex_reverse(&mut conn, &requests_key, batch_size).await?
            };

            for method in methods {
                let request_key = keys.request(origin, path, &method);
                let blobs = {
                    let conn_lock = engine.primary_connection().await;
                    let mut conn = conn_lock.lock().await;
                    collect_lex_reverse(&mut conn, &request_key, batch_size).await?
                };

                let mut live_ids: Vec<String> = Vec::new();
                let mut expired_blobs: Vec<String> = Vec::new();
                for blob in &blobs {
                    match Identifier::decode_from_request_set(blob) {
                        Ok(identifier) if identifier.is_expired(now) => expired_blobs.push(blob.clone()),
                        Ok(identifier) => live_ids.push(identifier.id),
                        Err(_) => {}
                    }
                }

                if !expired_blobs.is_empty() {
                    engine.cleanup.push(CleanupTask::Map {
                        prefix: prefix.clone(),
                        set_key: request_key.clone(),
                        members: expired_blobs,
                        origin: origin.to_string(),
                        path: path.to_string(),
                        method: method.clone(),
                    });
                    engine.schedule_cleanup_drain();
                }

                let fetched: Vec<CacheResult<Option<CacheEntry>>> = stream::iter(
                    live_ids
                        .into_iter()
                        .map(|id| fetch_metadata_only(engine, &keys, &prefix, origin, path, &method, id)),
                )
                .buffer_unordered(concurrency)
                .collect()
                .await;

                for result in fetched {
                    if let Some(entry) = result? {
                        on_entry(entry)?;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn fetch_metadata_only(
    engine: &CacheEngine,
    keys: &KeyBuilder,
    prefix: &str,
    origin: &str,
    path: &str,
    method: &str,
    id: String,
) -> CacheResult<Option<CacheEntry>> {
    let metadata_key = keys.metadata(&id);
    let raw: Option<String> = {
        let conn_lock = engine.primary_connection().await;
        let mut conn = conn_lock.lock().await;
        conn.get(metadata_key.as_ref()).await?
    };
    let Some(raw) = raw else {
        return Ok(None);
    };
    let stored: StoredMetadata = serde_json::from_str(&raw)?;
    Ok(Some(CacheEntry {
        meta: stored.entry,
        id,
        prefix: prefix.to_string(),
        origin: origin.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        cache_tags: stored.identifier.tags,
        body: None,
    }))
}

/// `getTag(tag, prefixes?)`: MGET metadata in batches over `tags|τ`'s
/// members, deduplicated across prefixes by id.
pub async fn get_tag(engine: &CacheEngine, tag: &str, prefixes: Option<&[String]>) -> CacheResult<Vec<CacheEntry>> {
    engine.ensure_open()?;
    let batch_size = engine.config().max_batch_size;
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for prefix in engine.resolve_prefixes(prefixes) {
        let keys = engine.keys_for(&prefix);
        let tag_key = keys.tag(tag);
        let ids = {
            let conn_lock = engine.primary_connection().await;
            let mut conn = conn_lock.lock().await;
            collect_lex_reverse(&mut conn, &tag_key, batch_size).await?
        };

        for chunk in ids.chunks(batch_size.max(1)) {
            let metadata_keys: Vec<String> = chunk.iter().map(|id| keys.metadata(id).to_string()).collect();
            let raws: Vec<Option<String>> = {
                let conn_lock = engine.primary_connection().await;
                let mut conn = conn_lock.lock().await;
                conn.mget(&metadata_keys).await?
            };
            for (id, raw) in chunk.iter().zip(raws) {
                if seen_ids.contains(id) {
                    continue;
                }
                let Some(raw) = raw else {
                    continue;
                };
                let stored: StoredMetadata = serde_json::from_str(&raw)?;
                seen_ids.insert(id.clone());
                out.push(CacheEntry {
                    meta: stored.entry,
                    id: id.clone(),
                    prefix: prefix.clone(),
                    origin: stored.origin,
                    method: stored.method,
                    path: stored.path,
                    cache_tags: stored.identifier.tags,
                    body: None,
                });
            }
        }
    }
    Ok(out)
}

/// `getDependentEntries(id, prefixes?)`: resolve `id`'s tag set, gather
/// every entry sharing any of those tags, and keep the ones whose tag set
/// is a superset of the source's (the source's tags are all present in the
/// candidate).
pub async fn get_dependent_entries(
    engine: &CacheEngine,
    id: &str,
    prefixes: Option<&[String]>,
) -> CacheResult<Vec<CacheEntry>> {
    engine.ensure_open()?;
    let resolved_prefixes = engine.resolve_prefixes(prefixes);

    let mut source_tags: Option<HashSet<String>> = None;
    for prefix in &resolved_prefixes {
        let keys = engine.keys_for(prefix);
        let metadata_key = keys.metadata(id);
        let raw: Option<String> = {
            let conn_lock = engine.primary_connection().await;
            let mut conn = conn_lock.lock().await;
            conn.get(metadata_key.as_ref()).await?
        };
        if let Some(raw) = raw {
            let stored: StoredMetadata = serde_json::from_str(&raw)?;
            source_tags = Some(stored.identifier.tags.into_iter().collect());
            break;
        }
    }
    let Some(source_tags) = source_tags else {
        return Ok(Vec::new());
    };
    if source_tags.is_empty() {
        return Ok(Vec::new());
    }

    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for tag in &source_tags {
        for entry in get_tag(engine, tag, Some(&resolved_prefixes)).await? {
            if seen_ids.contains(&entry.id) {
                continue;
            }
            let candidate_tags: HashSet<&str> = entry.cache_tags.iter().map(String::as_str).collect();
            if source_tags.iter().all(|t| candidate_tags.contains(t.as_str())) {
                seen_ids.insert(entry.id.clone());
                out.push(entry);
            }
        }
    }
    Ok(out)
}

/// `getResponseById(id, prefixes?)`: UTF-8 concatenation of the decoded
/// body chunks, or absent if the entry is expired or missing.
pub async fn get_response_by_id(
    engine: &CacheEngine,
    id: &str,
    prefixes: Option<&[String]>,
) -> CacheResult<Option<String>> {
    engine.ensure_open()?;
    let now = now_epoch_secs();

    for prefix in engine.resolve_prefixes(prefixes) {
        let keys = engine.keys_for(&prefix);
        let metadata_key = keys.metadata(id);
        let raw: Option<String> = {
            let conn_lock = engine.primary_connection().await;
            let mut conn = conn_lock.lock().await;
            conn.get(metadata_key.as_ref()).await?
        };
        let Some(raw) = raw else {
            continue;
        };
        let stored: StoredMetadata = serde_json::from_str(&raw)?;
        if stored.identifier.is_expired(now) {
            continue;
        }

        let body_key = keys.body(id);
        let body_raw: Option<String> = {
            let conn_lock = engine.primary_connection().await;
            let mut conn = conn_lock.lock().await;
            conn.get(body_key.as_ref()).await?
        };
        let chunks = body::decode_to_chunks(&body_raw.unwrap_or_default())?;
        let bytes: Vec<u8> = chunks.into_iter().flatten().collect();
        let text = String::from_utf8(bytes).map_err(|e| CacheError::Encoding(e.to_string()))?;
        return Ok(Some(text));
    }
    Ok(None)
}
