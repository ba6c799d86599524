//! Local tracking cache: a bounded LRU of `request-key -> variants`, kept
//! coherent with Redis via client-side invalidation messages rather than a
//! TTL of its own. Grounded on the teacher's in-memory tier, narrowed from
//! an arbitrary-value cache down to the one shape this engine needs.

use moka::sync::Cache;

use crate::header::NormalizedHeaders;
use crate::identifier::Identifier;

/// One cached variant as held locally: enough to repeat the Vary match and
/// hand back a `CacheEntry` without a round-trip, plus the prefix it came
/// from so eviction messages (which only carry the Redis key) can be
/// matched back to it.
#[derive(Debug, Clone)]
pub struct TrackedVariant {
    pub identifier: Identifier,
}

pub struct TrackingCache {
    cache: Cache<String, Vec<TrackedVariant>>,
}

impl TrackingCache {
    pub fn new(max_count: u64, max_size_bytes: u64) -> Self {
        let builder = Cache::builder().max_capacity(max_count.max(1));
        let builder = if max_size_bytes == u64::MAX {
            builder
        } else {
            builder.weigher(|_key: &String, value: &Vec<TrackedVariant>| -> u32 {
                value
                    .iter()
                    .map(|v| v.identifier.vary.len() as u32 + 1)
                    .sum()
            })
        };
        Self { cache: builder.build() }
    }

    /// Logical request key: `prefix|request|origin|path|method`.
    pub fn request_key(prefix: &str, origin: &str, path: &str, method: &str) -> String {
        if prefix.is_empty() {
            format!("request|{origin}|{path}|{method}")
        } else {
            format!("{prefix}|request|{origin}|{path}|{method}")
        }
    }

    /// Find the first cached variant (already ranked most-specific-first by
    /// the write path, see `insert`) whose Vary matches the caller's
    /// normalized headers.
    pub fn find_matching(&self, request_key: &str, headers: &NormalizedHeaders) -> Option<Identifier> {
        let variants = self.cache.get(request_key)?;
        variants
            .iter()
            .find(|v| crate::header::vary_matches(&v.identifier.vary, headers))
            .map(|v| v.identifier.clone())
    }

    /// Replace the cached variant list for a request key with a single
    /// freshly-resolved identifier, preserving any other already-cached
    /// variants for the same request key that are not superseded.
    pub fn insert(&self, request_key: String, identifier: Identifier) {
        let mut variants = self
            .cache
            .get(&request_key)
            .unwrap_or_default()
            .into_iter()
            .filter(|v| v.identifier.hash != identifier.hash)
            .collect::<Vec<_>>();
        variants.push(TrackedVariant { identifier });
        variants.sort_by(|a, b| b.identifier.specificity.cmp(&a.identifier.specificity));
        self.cache.insert(request_key, variants);
    }

    pub fn evict(&self, request_key: &str) {
        self.cache.invalidate(request_key);
    }

    /// Evict every request key holding a variant with the given entry id,
    /// returning the evicted request keys. Used by the tracking
    /// subscription, which only learns the invalidated Redis key
    /// (`P|metadata|id`) — not which request keys cached it.
    pub fn evict_by_id(&self, id: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, variants)| variants.iter().any(|v| v.identifier.id == id))
            .map(|(key, _)| key.as_str().to_string())
            .collect();
        for key in &stale {
            self.cache.invalidate(key);
        }
        stale
    }

    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifier(specificity: u32, hash: &str) -> Identifier {
        Identifier {
            id: "id".into(),
            specificity,
            vary: NormalizedHeaders::new(),
            hash: hash.into(),
            tags: vec![],
            expire_at: i64::MAX,
        }
    }

    #[test]
    fn insert_then_find_round_trips() {
        let cache = TrackingCache::new(u64::MAX, u64::MAX);
        let key = TrackingCache::request_key("P", "o", "/p", "GET");
        cache.insert(key.clone(), identifier(0, "h1"));
        let found = cache.find_matching(&key, &NormalizedHeaders::new());
        assert!(found.is_some());
    }

    #[test]
    fn evict_removes_entry() {
        let cache = TrackingCache::new(u64::MAX, u64::MAX);
        let key = TrackingCache::request_key("P", "o", "/p", "GET");
        cache.insert(key.clone(), identifier(0, "h1"));
        cache.evict(&key);
        assert!(cache.find_matching(&key, &NormalizedHeaders::new()).is_none());
    }

    #[test]
    fn most_specific_variant_is_checked_first() {
        let cache = TrackingCache::new(u64::MAX, u64::MAX);
        let key = TrackingCache::request_key("", "o", "/p", "GET");
        cache.insert(key.clone(), identifier(0, "h1"));
        let mut specific = identifier(1, "h2");
        specific.vary.insert("a".to_string(), "1".to_string());
        cache.insert(key.clone(), specific);

        let mut headers = NormalizedHeaders::new();
        headers.insert("a".to_string(), "1".to_string());
        let found = cache.find_matching(&key, &headers).unwrap();
        assert_eq!(found.specificity, 1);
    }
}
