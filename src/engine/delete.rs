//! Invalidation — `spec.md` §4.4.

use std::collections::{HashMap, HashSet};

use futures::stream::{self, StreamExt};
use redis::AsyncCommands;

use super::CacheEngine;
use crate::cleanup::CleanupTask;
use crate::entry::{CacheKey, StoredMetadata};
use crate::errors::CacheResult;
use crate::events::CacheEvent;
use crate::identifier::Identifier;
use crate::key::KeyBuilder;
use crate::scan::collect_lex_reverse;

/// `delete(key)`: for every method cached under `(origin, path)`, delegate
/// to `deleteKeys`. Fast-returns on a closed engine instead of raising,
/// matching `get`'s cancellation behavior (`spec.md` §5).
pub async fn delete(engine: &CacheEngine, key: &CacheKey, prefixes: Option<&[String]>) -> CacheResult<()> {
    if engine.is_closed() {
        return Ok(());
    }
    for prefix in engine.resolve_prefixes(prefixes) {
        let keys = engine.keys_for(&prefix);
        let requests_key = keys.requests(&key.origin, &key.path);
        let methods = {
            let conn_lock = engine.primary_connection().await;
            let mut conn = conn_lock.lock().await;
            collect_lex_reverse(&mut conn, &requests_key, engine.config().max_batch_size).await?
        };
        let per_method_keys: Vec<CacheKey> = methods
            .into_iter()
            .map(|method| CacheKey::new(key.origin.clone(), key.path.clone(), method))
            .collect();
        delete_keys_for_prefix(engine, &prefix, &per_method_keys).await?;
    }
    Ok(())
}

pub async fn delete_keys(engine: &CacheEngine, keys: &[CacheKey], prefixes: Option<&[String]>) -> CacheResult<()> {
    engine.ensure_open()?;
    for prefix in engine.resolve_prefixes(prefixes) {
        delete_keys_for_prefix(engine, &prefix, keys).await?;
    }
    Ok(())
}

/// De-duplicates by `(origin, path, method)`, then fans each group out to
/// `delete_one_key` with a bounded concurrency (`config.concurrency`).
async fn delete_keys_for_prefix(engine: &CacheEngine, prefix: &str, keys: &[CacheKey]) -> CacheResult<()> {
    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let dedup: Vec<&CacheKey> = keys
        .iter()
        .filter(|k| seen.insert((k.origin.clone(), k.path.clone(), k.method.clone())))
        .collect();

    let concurrency = engine.config().concurrency;
    let results: Vec<CacheResult<()>> = stream::iter(dedup.into_iter().map(|k| delete_one_key(engine, prefix, k)))
        .buffer_unordered(concurrency)
        .collect()
        .await;
    for result in results {
        result?;
    }
    Ok(())
}

/// Resolve one `(origin, path, method)` — or, if `key.id` is set, exactly
/// one variant — and remove every matching variant, its tag memberships,
/// and queue the now-possibly-empty parent indices for lazy cleanup.
async fn delete_one_key(engine: &CacheEngine, prefix: &str, key: &CacheKey) -> CacheResult<()> {
    let keys = engine.keys_for(prefix);
    let mut touched_tags: HashSet<String> = HashSet::new();

    if let Some(id) = &key.id {
        let metadata_key = keys.metadata(id);
        let raw: Option<String> = {
            let conn_lock = engine.primary_connection().await;
            let mut conn = conn_lock.lock().await;
            conn.get(metadata_key.as_ref()).await?
        };
        let Some(raw) = raw else {
            return Ok(());
        };
        let stored: StoredMetadata = serde_json::from_str(&raw)?;
        let blob = stored.identifier.encode_for_request_set()?;
        remove_entry(
            engine,
            &keys,
            prefix,
            &stored.origin,
            &stored.path,
            &stored.method,
            id,
            &stored.identifier.hash,
            &stored.identifier.tags,
            &blob,
        )
        .await?;
        touched_tags.extend(stored.identifier.tags);
    } else {
        let request_key = keys.request(&key.origin, &key.path, &key.method);
        let blobs = {
            let conn_lock = engine.primary_connection().await;
            let mut conn = conn_lock.lock().await;
            collect_lex_reverse(&mut conn, &request_key, engine.config().max_batch_size).await?
        };
        for blob in &blobs {
            let identifier = match Identifier::decode_from_request_set(blob) {
                Ok(identifier) => identifier,
                Err(_) => continue,
            };
            remove_entry(
                engine,
                &keys,
                prefix,
                &key.origin,
                &key.path,
                &key.method,
                &identifier.id,
                &identifier.hash,
                &identifier.tags,
                blob,
            )
            .await?;
            touched_tags.extend(identifier.tags);
        }
    }

    if !touched_tags.is_empty() {
        engine.cleanup.push(CleanupTask::Tags {
            prefix: prefix.to_string(),
            tags: touched_tags.into_iter().collect(),
        });
    }
    engine.cleanup.push(CleanupTask::Key {
        prefix: prefix.to_string(),
        origin: key.origin.clone(),
        path: key.path.clone(),
        method: key.method.clone(),
    });
    engine.schedule_cleanup_drain();
    Ok(())
}

/// The per-variant removal pipeline shared by every delete path: metadata,
/// body, the variants-set dedup guard, the request-set member, and every
/// tag index the variant belonged to.
#[allow(clippy::too_many_arguments)]
async fn remove_entry(
    engine: &CacheEngine,
    keys: &KeyBuilder,
    prefix: &str,
    origin: &str,
    path: &str,
    method: &str,
    id: &str,
    hash: &str,
    tags: &[String],
    blob: &str,
) -> CacheResult<()> {
    let metadata_key = keys.metadata(id);
    let body_key = keys.body(id);
    let variants_key = keys.variants(origin, path, method);
    let request_key = keys.request(origin, path, method);

    let mut pipe = redis::pipe();
    pipe.atomic();
    pipe.del(metadata_key.as_ref());
    pipe.del(body_key.as_ref());
    pipe.zrem(variants_key.as_ref(), hash);
    pipe.zrem(request_key.as_ref(), blob);
    for tag in tags {
        pipe.zrem(keys.tag(tag).as_ref(), id);
    }

    let conn_lock = engine.primary_connection().await;
    {
        let mut conn = conn_lock.lock().await;
        let _: () = pipe.query_async(&mut *conn).await?;
    }

    crate::metrics::record_deleted_entry();
    tracing::debug!(prefix = %prefix, id = %id, origin = %origin, path = %path, method = %method, "entry deleted");

    engine.emit(CacheEvent::EntryDelete {
        prefix: prefix.to_string(),
        id: id.to_string(),
    });
    Ok(())
}

/// `deleteIds(ids)`: resolve each id's `(origin, path, method)` from its
/// stored metadata, then delegate to `deleteKeys`.
pub async fn delete_ids(engine: &CacheEngine, ids: &[String], prefixes: Option<&[String]>) -> CacheResult<()> {
    engine.ensure_open()?;
    let resolved_prefixes = engine.resolve_prefixes(prefixes);
    let concurrency = engine.config().concurrency;
    let results: Vec<CacheResult<()>> = stream::iter(
        ids.iter()
            .map(|id| resolve_and_delete_id(engine, id, &resolved_prefixes)),
    )
    .buffer_unordered(concurrency)
    .collect()
    .await;
    for result in results {
        result?;
    }
    Ok(())
}

async fn resolve_and_delete_id(engine: &CacheEngine, id: &str, prefixes: &[String]) -> CacheResult<()> {
    for prefix in prefixes {
        let keys = engine.keys_for(prefix);
        let metadata_key = keys.metadata(id);
        let raw: Option<String> = {
            let conn_lock = engine.primary_connection().await;
            let mut conn = conn_lock.lock().await;
            conn.get(metadata_key.as_ref()).await?
        };
        if let Some(raw) = raw {
            let stored: StoredMetadata = serde_json::from_str(&raw)?;
            let key = CacheKey::new(stored.origin, stored.path, stored.method).with_id(id.to_string());
            delete_keys_for_prefix(engine, prefix, std::slice::from_ref(&key)).await?;
            return Ok(());
        }
    }
    Ok(())
}

/// `deleteTag(tags)`: delete every entry whose tag set is a **superset** of
/// the given tags. Iterates only the lexicographically-first tag's index
/// (a performance heuristic per `spec.md` §9's open question — correctness
/// comes from the full-containment filter below, not from which tag is
/// chosen to drive the scan).
pub async fn delete_tag(engine: &CacheEngine, tags: &[String], prefixes: Option<&[String]>) -> CacheResult<()> {
    engine.ensure_open()?;
    if tags.is_empty() {
        return Ok(());
    }
    let mut sorted_tags = tags.to_vec();
    sorted_tags.sort();
    let required: HashSet<&str> = sorted_tags.iter().map(String::as_str).collect();
    let driver_tag = sorted_tags[0].clone();

    for prefix in engine.resolve_prefixes(prefixes) {
        let keys = engine.keys_for(&prefix);
        let driver_index_key = keys.tag(&driver_tag);
        let candidate_ids = {
            let conn_lock = engine.primary_connection().await;
            let mut conn = conn_lock.lock().await;
            collect_lex_reverse(&mut conn, &driver_index_key, engine.config().max_batch_size).await?
        };

        let mut metadata_by_id: HashMap<String, StoredMetadata> = HashMap::new();
        for id in &candidate_ids {
            let metadata_key = keys.metadata(id);
            let raw: Option<String> = {
                let conn_lock = engine.primary_connection().await;
                let mut conn = conn_lock.lock().await;
                conn.get(metadata_key.as_ref()).await?
            };
            if let Some(raw) = raw {
                metadata_by_id.insert(id.clone(), serde_json::from_str(&raw)?);
            }
        }

        let matched_keys: Vec<CacheKey> = metadata_by_id
            .into_iter()
            .filter_map(|(id, stored)| {
                let tag_set: HashSet<&str> = stored.identifier.tags.iter().map(String::as_str).collect();
                if required.iter().all(|t| tag_set.contains(t)) {
                    Some(CacheKey::new(stored.origin, stored.path, stored.method).with_id(id))
                } else {
                    None
                }
            })
            .collect();

        if !matched_keys.is_empty() {
            delete_keys_for_prefix(engine, &prefix, &matched_keys).await?;
        }
        for tag in &sorted_tags {
            engine.emit(CacheEvent::TagDelete {
                prefix: prefix.clone(),
                tag: tag.clone(),
            });
        }
    }
    Ok(())
}

/// `deleteTags(tags[])`: apply `deleteTag` to each tag/tag-list with
/// bounded concurrency.
pub async fn delete_tags(engine: &CacheEngine, tag_lists: &[Vec<String>], prefixes: Option<&[String]>) -> CacheResult<()> {
    engine.ensure_open()?;
    let concurrency = engine.config().concurrency;
    let results: Vec<CacheResult<()>> = stream::iter(tag_lists.iter().map(|tags| delete_tag(engine, tags, prefixes)))
        .buffer_unordered(concurrency)
        .collect()
        .await;
    for result in results {
        result?;
    }
    Ok(())
}
