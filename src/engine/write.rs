//! Write path — `spec.md` §4.3.

use redis::AsyncCommands;
use uuid::Uuid;

use super::CacheEngine;
use crate::body;
use crate::entry::{CacheEntry, CacheEntryMeta, CacheKey, StoredMetadata};
use crate::errors::{CacheError, CacheResult};
use crate::events::CacheEvent;
use crate::hash;
use crate::header;
use crate::identifier::Identifier;

/// Returned by `WriteSink::finalize`: the freshly written entry, a marker
/// that an identical-Vary variant already existed and the write was a no-op
/// (§3 invariant 1, §4.3 step 6 — "abort silently"), or a marker that a
/// backend failure aborted the commit after it was already routed to
/// `error_callback`/`error` (§7 — "write operations route the error to
/// `errorCallback` ... so the HTTP layer proceeds without caching").
pub enum WriteOutcome {
    Written(CacheEntry),
    Deduplicated,
    Failed,
}

/// Sink the HTTP layer appends body chunks to before finalizing a write.
/// Mirrors `spec.md`'s "write stream passed to the HTTP layer" pattern,
/// redesigned per §9 into an explicit append/finalize builder rather than a
/// passed-in stream object.
pub struct WriteSink<'a> {
    engine: &'a CacheEngine,
    key: CacheKey,
    meta: CacheEntryMeta,
    chunks: Vec<Vec<u8>>,
    encoded_len: usize,
    failed: bool,
}

pub(super) fn create_write_stream<'a>(
    engine: &'a CacheEngine,
    key: CacheKey,
    meta: CacheEntryMeta,
) -> CacheResult<WriteSink<'a>> {
    engine.ensure_open()?;
    Ok(WriteSink {
        engine,
        key,
        meta,
        chunks: Vec::new(),
        encoded_len: 0,
        failed: false,
    })
}

impl<'a> WriteSink<'a> {
    /// Append one chunk. Each chunk is conceptually base64-encoded and
    /// appended with a trailing space; once the cumulative encoded length
    /// would reach `max_entry_size` the sink fails, discards the write, and
    /// reports via the error callback — the caller still gets the error
    /// back from this call so it can treat the response as uncacheable.
    pub fn write(&mut self, chunk: impl Into<Vec<u8>>) -> CacheResult<()> {
        if self.failed {
            return Ok(());
        }
        let chunk = chunk.into();
        let encoded_chunk_len = (chunk.len() + 2) / 3 * 4; // base64 expansion, no padding edge cases needed for a bound
        let additional = encoded_chunk_len + 1; // + the separating space
        let max = self.engine.config().max_entry_size;
        if self.encoded_len + additional >= max {
            self.failed = true;
            let size = self.encoded_len + additional;
            self.engine
                .report_error(CacheError::MaxEntrySizeExceeded { size, max });
            return Err(CacheError::MaxEntrySizeExceeded { size, max });
        }
        self.encoded_len += additional;
        self.chunks.push(chunk);
        Ok(())
    }

    /// `createWriteStream.final`: commit the accumulated body under a new
    /// (or caller-supplied) id.
    pub async fn finalize(self) -> CacheResult<WriteOutcome> {
        if self.failed {
            let max = self.engine.config().max_entry_size;
            return Err(CacheError::MaxEntrySizeExceeded {
                size: self.encoded_len,
                max,
            });
        }
        write_entry(self.engine, self.key, self.meta, self.chunks).await
    }
}

async fn write_entry(
    engine: &CacheEngine,
    key: CacheKey,
    meta: CacheEntryMeta,
    chunks: Vec<Vec<u8>>,
) -> CacheResult<WriteOutcome> {
    engine.ensure_open()?;

    let id = key.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let expire_at = meta.delete_at.timestamp();

    let vary = header::normalize_headers(meta.vary.as_ref().unwrap_or(&Default::default()));
    let vary_json = serde_json::to_string(&vary)?;
    let hash = hash::hash_vary_json(&vary_json);
    let specificity = vary.len() as u32;

    let tags = extract_tags(engine, &meta);

    let identifier = Identifier {
        id: id.clone(),
        specificity,
        vary,
        hash: hash.clone(),
        tags: tags.clone(),
        expire_at,
    };

    let prefix = engine.config().prefix.clone();
    let keys = engine.keys_for(&prefix);
    let variants_key = keys.variants(&key.origin, &key.path, &key.method);

    let conn_lock = engine.primary_connection().await;
    let mut conn = conn_lock.lock().await;
    let pipeline_started = std::time::Instant::now();

    // `ZADD NX` has no dedicated convenience method on `AsyncCommands`
    // (the NX/XX/GT/LT flags aren't modeled per-variant there), so the
    // dedup guard is issued with the raw command builder, same as the
    // EXPIREAT NX/GT pair below.
    let inserted: i64 = match redis::cmd("ZADD")
        .arg(variants_key.as_ref())
        .arg("NX")
        .arg(0)
        .arg(hash.as_str())
        .query_async(&mut *conn)
        .await
    {
        Ok(inserted) => inserted,
        Err(e) => {
            drop(conn);
            return Ok(report_backend_failure(engine, e));
        }
    };
    if inserted == 0 {
        crate::metrics::record_deduplicated_write();
        tracing::trace!(origin = %key.origin, path = %key.path, method = %key.method, hash = %hash, "write deduplicated");
        return Ok(WriteOutcome::Deduplicated);
    }

    let request_key = keys.request(&key.origin, &key.path, &key.method);
    let requests_key = keys.requests(&key.origin, &key.path);
    let routes_key = keys.routes();
    let metadata_key = keys.metadata(&id);
    let body_key = keys.body(&id);

    let stored = StoredMetadata {
        identifier: identifier.clone(),
        origin: key.origin.clone(),
        path: key.path.clone(),
        method: key.method.clone(),
        entry: meta.clone(),
    };
    let metadata_json = serde_json::to_string(&stored)?;
    let body_encoded = body::encode_chunks(&chunks);
    let identifier_blob = identifier.encode_for_request_set()?;
    let route_member = crate::key::KeyBuilder::route_member(&key.origin, &key.path);

    let mut pipe = redis::pipe();
    pipe.atomic();
    pipe.zadd(routes_key.as_ref(), route_member.as_str(), 0);
    pipe.zadd(requests_key.as_ref(), key.method.as_str(), 0);
    pipe.zadd(request_key.as_ref(), identifier_blob.as_str(), 0);
    pipe.set_options(
        metadata_key.as_ref(),
        metadata_json.as_str(),
        redis::SetOptions::default().with_expiration(redis::SetExpiry::EXAT(expire_at as usize)),
    );
    pipe.set_options(
        body_key.as_ref(),
        body_encoded.as_str(),
        redis::SetOptions::default().with_expiration(redis::SetExpiry::EXAT(expire_at as usize)),
    );
    for tag in &tags {
        pipe.zadd(keys.tags().as_ref(), tag.as_str(), 0);
        pipe.zadd(keys.tag(tag).as_ref(), id.as_str(), 0);
    }
    if let Err(e) = pipe.query_async::<()>(&mut *conn).await {
        drop(conn);
        return Ok(report_backend_failure(engine, e));
    }

    // Extend (never shorten) the TTL on every shared index set this write
    // touched: NX first so a brand-new set gets an expiry at all, then GT
    // so a longer-lived write extends a set a shorter-lived sibling already
    // stamped.
    let tags_key = keys.tags();
    let tag_keys: Vec<std::sync::Arc<str>> = tags.iter().map(|t| keys.tag(t)).collect();
    let mut shared_sets: Vec<&str> = vec![
        routes_key.as_ref(),
        requests_key.as_ref(),
        request_key.as_ref(),
        variants_key.as_ref(),
        tags_key.as_ref(),
    ];
    shared_sets.extend(tag_keys.iter().map(|k| k.as_ref()));
    for shared_key in shared_sets {
        if let Err(e) = apply_expireat_nx_then_gt(&mut conn, shared_key, expire_at).await {
            drop(conn);
            return Ok(report_backend_failure(engine, e));
        }
    }
    drop(conn);

    crate::metrics::record_write();
    crate::metrics::record_write_pipeline_latency(pipeline_started.elapsed().as_secs_f64());
    tracing::debug!(prefix = %prefix, id = %id, origin = %key.origin, path = %key.path, method = %key.method, "entry written");

    engine.emit(CacheEvent::EntryWrite {
        prefix,
        id,
        entry: meta,
    });

    Ok(WriteOutcome::Written(CacheEntry {
        meta: stored.entry,
        id: stored.identifier.id.clone(),
        prefix: engine.config().prefix.clone(),
        origin: stored.origin,
        method: stored.method,
        path: stored.path,
        cache_tags: stored.identifier.tags.clone(),
        body: Some(chunks),
    }))
}

async fn apply_expireat_nx_then_gt(
    conn: &mut redis::aio::MultiplexedConnection,
    key: &str,
    expire_at: i64,
) -> Result<(), redis::RedisError> {
    let _: i64 = redis::cmd("EXPIREAT")
        .arg(key)
        .arg(expire_at)
        .arg("NX")
        .query_async(conn)
        .await?;
    let _: i64 = redis::cmd("EXPIREAT")
        .arg(key)
        .arg(expire_at)
        .arg("GT")
        .query_async(conn)
        .await?;
    Ok(())
}

/// Route a write-path backend failure to `error_callback`/`error` (§7) and
/// signal the caller to treat this write as uncacheable rather than
/// propagating a synchronous `Err` — the same degrade-on-backend-failure
/// policy the read path applies.
fn report_backend_failure(engine: &CacheEngine, error: redis::RedisError) -> WriteOutcome {
    engine.report_error(CacheError::Redis(error));
    WriteOutcome::Failed
}

/// Extract cache tags from `cacheTagsHeader`'s configured header, if any:
/// comma-delimited or array-valued, trimmed, deduplicated, sorted (§4.3
/// step 4, §3 invariant 3).
fn extract_tags(engine: &CacheEngine, meta: &CacheEntryMeta) -> Vec<String> {
    let Some(header_name) = &engine.config().cache_tags_header else {
        return Vec::new();
    };
    let lower = header_name.to_lowercase();
    let mut tags: Vec<String> = meta
        .headers
        .iter()
        .find(|(k, _)| k.to_lowercase() == lower)
        .map(|(_, v)| match v {
            header::HeaderValue::Single(s) => s.split(',').map(|t| t.trim().to_string()).collect(),
            header::HeaderValue::Multi(parts) => parts.iter().map(|t| t.trim().to_string()).collect(),
        })
        .unwrap_or_default();
    tags.retain(|t| !t.is_empty());
    tags.sort();
    tags.dedup();
    tags
}
