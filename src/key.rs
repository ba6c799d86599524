//! Deterministic Redis key layout (v2 schema) with a bounded LRU of
//! previously-serialized forms, since the same route/method pair is looked
//! up repeatedly on the hot path.

use std::sync::{Arc, Mutex};

use lru::LruCache;

const DEFAULT_CAPACITY: usize = 4096;

pub struct KeyBuilder {
    prefix: String,
    cache: Mutex<LruCache<String, Arc<str>>>,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_capacity(prefix, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(prefix: impl Into<String>, capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            prefix: prefix.into(),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn namespaced(&self, parts: &[&str]) -> Arc<str> {
        let cache_key = parts.join("\u{1}");
        if let Some(hit) = self.cache.lock().unwrap().get(&cache_key) {
            return hit.clone();
        }
        let joined = parts.join("|");
        let full = if self.prefix.is_empty() {
            joined
        } else {
            format!("{}|{}", self.prefix, joined)
        };
        let arc: Arc<str> = Arc::from(full.as_str());
        self.cache.lock().unwrap().put(cache_key, arc.clone());
        arc
    }

    pub fn routes(&self) -> Arc<str> {
        self.namespaced(&["routes"])
    }

    pub fn tags(&self) -> Arc<str> {
        self.namespaced(&["tags"])
    }

    pub fn tag(&self, tag: &str) -> Arc<str> {
        self.namespaced(&["tags", tag])
    }

    pub fn requests(&self, origin: &str, path: &str) -> Arc<str> {
        self.namespaced(&["requests", origin, path])
    }

    pub fn request(&self, origin: &str, path: &str, method: &str) -> Arc<str> {
        self.namespaced(&["request", origin, path, method])
    }

    pub fn variants(&self, origin: &str, path: &str, method: &str) -> Arc<str> {
        self.namespaced(&["variants", origin, path, method])
    }

    pub fn metadata(&self, id: &str) -> Arc<str> {
        self.namespaced(&["metadata", id])
    }

    pub fn body(&self, id: &str) -> Arc<str> {
        self.namespaced(&["body", id])
    }

    pub fn route_member(origin: &str, path: &str) -> String {
        format!("{}|{}", origin, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prefix_has_no_separator() {
        let keys = KeyBuilder::new("");
        assert_eq!(&*keys.routes(), "routes");
    }

    #[test]
    fn non_empty_prefix_is_separated() {
        let keys = KeyBuilder::new("P");
        assert_eq!(&*keys.routes(), "P|routes");
        assert_eq!(&*keys.request("o", "/p", "GET"), "P|request|o|/p|GET");
    }

    #[test]
    fn repeated_lookups_share_the_cached_form() {
        let keys = KeyBuilder::new("P");
        let a = keys.metadata("id-1");
        let b = keys.metadata("id-1");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
