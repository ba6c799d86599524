//! Logical entities: the request fingerprint, the entry metadata the HTTP
//! layer writes, and the entry the engine hands back on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::body::Body;
use crate::header::RawHeaders;
use crate::identifier::Identifier;

/// The request fingerprint supplied by the HTTP layer. `id`, when set,
/// refers to a pre-existing entry rather than a route to look up.
#[derive(Debug, Clone)]
pub struct CacheKey {
    pub origin: String,
    pub path: String,
    pub method: String,
    pub headers: RawHeaders,
    pub id: Option<String>,
}

impl CacheKey {
    pub fn new(origin: impl Into<String>, path: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            path: path.into(),
            method: method.into(),
            headers: RawHeaders::new(),
            id: None,
        }
    }

    pub fn with_headers(mut self, headers: RawHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Entry metadata as produced by the HTTP layer on write. The engine does
/// not interpret `cache_control_directives` or compute the timestamps; it
/// only persists and returns them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub status_code: u16,
    pub status_message: String,
    pub headers: RawHeaders,
    #[serde(default)]
    pub vary: Option<RawHeaders>,
    pub cached_at: DateTime<Utc>,
    pub stale_at: DateTime<Utc>,
    pub delete_at: DateTime<Utc>,
    #[serde(default)]
    pub cache_control_directives: Vec<String>,
}

/// What `get` returns: the HTTP-layer metadata plus the fields the engine
/// adds once it resolves a winning variant.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub meta: CacheEntryMeta,
    pub id: String,
    pub prefix: String,
    pub origin: String,
    pub method: String,
    pub path: String,
    pub cache_tags: Vec<String>,
    pub body: Option<Body>,
}

/// The exact shape stored at `P|metadata|id`. Field order has no
/// significance here (unlike the request-set member), so a plain derive is
/// sufficient. `origin`/`path`/`method` are carried alongside `identifier`
/// and `entry` so that `deleteIds` and `getDependentEntries` can reconstruct
/// a full `CacheKey` from an id alone, without having to thread the route
/// through a separate lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMetadata {
    pub identifier: Identifier,
    pub origin: String,
    pub path: String,
    pub method: String,
    pub entry: CacheEntryMeta,
}
