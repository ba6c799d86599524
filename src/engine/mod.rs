//! The `CacheEngine`: the single cohesive component exposing both the
//! Store facet (get/write/delete, used by the HTTP client) and the Manager
//! facet (iterate/subscribe/introspect, used by admin tooling) described in
//! `spec.md` §2. Both facets share one primary Redis connection, a lazily
//! created secondary connection used only by the cleanup queue, and
//! whatever subscription connections `subscribe()` has opened.

mod delete;
mod iterate;
mod read;
mod subscribe;
mod write;

pub use write::WriteSink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;

use crate::cleanup::CleanupQueue;
use crate::config::CacheEngineConfig;
use crate::entry::{CacheEntry, CacheEntryMeta, CacheKey};
use crate::errors::{CacheError, CacheResult};
use crate::events::{self, CacheEvent};
use crate::key::KeyBuilder;
use crate::tracking::TrackingCache;

/// Invoked for background errors that cannot be surfaced to a caller
/// synchronously (write-path Redis failures, subscription setup failures).
pub type ErrorCallback = Arc<dyn Fn(CacheError) + Send + Sync>;

pub struct CacheEngine {
    config: CacheEngineConfig,
    keys: Arc<KeyBuilder>,
    client: Client,
    primary: Arc<AsyncMutex<MultiplexedConnection>>,
    secondary: Arc<OnceCell<Arc<AsyncMutex<MultiplexedConnection>>>>,
    tracking: Option<Arc<TrackingCache>>,
    cleanup: Arc<CleanupQueue>,
    events_tx: tokio::sync::broadcast::Sender<CacheEvent>,
    closed: Arc<AtomicBool>,
    subscription_handles: StdMutex<Vec<JoinHandle<()>>>,
    error_callback: Option<ErrorCallback>,
}

impl CacheEngine {
    pub async fn new(config: CacheEngineConfig) -> CacheResult<Arc<Self>> {
        Self::with_error_callback(config, None).await
    }

    pub async fn with_error_callback(
        config: CacheEngineConfig,
        error_callback: Option<ErrorCallback>,
    ) -> CacheResult<Arc<Self>> {
        config.validate_config()?;
        let client = Client::open(config.redis_url.as_str())?;
        let primary = client.get_multiplexed_async_connection().await?;
        let keys = Arc::new(KeyBuilder::new(config.prefix.clone()));
        let tracking = if config.tracking {
            Some(Arc::new(TrackingCache::new(config.max_count, config.max_size)))
        } else {
            None
        };
        let (events_tx, _rx) = events::channel();

        Ok(Arc::new(Self {
            config,
            keys,
            client,
            primary: Arc::new(AsyncMutex::new(primary)),
            secondary: Arc::new(OnceCell::new()),
            tracking,
            cleanup: Arc::new(CleanupQueue::new()),
            events_tx,
            closed: Arc::new(AtomicBool::new(false)),
            subscription_handles: StdMutex::new(Vec::new()),
            error_callback,
        }))
    }

    pub fn config(&self) -> &CacheEngineConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<CacheEvent> {
        self.events_tx.subscribe()
    }

    pub fn store(&self) -> Store<'_> {
        Store(self)
    }

    pub fn manager(&self) -> Manager<'_> {
        Manager(self)
    }

    /// Tears down cleanly: aborts any running subscription tasks, waits for
    /// the cleanup queue to drain, then marks the engine closed. Idempotent
    /// — a second call is a no-op, per `spec.md` §5.
    pub async fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut handles = self.subscription_handles.lock().unwrap();
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
        self.cleanup.await_idle().await;
        Ok(())
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.is_closed() {
            return Err(CacheError::User("cache is closed".to_string()));
        }
        Ok(())
    }

    fn resolve_prefixes(&self, prefixes: Option<&[String]>) -> Vec<String> {
        match prefixes {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => vec![self.config.prefix.clone()],
        }
    }

    /// `KeyBuilder` for a given prefix, reusing the instance's own
    /// (LRU-backed) builder for the common case and allocating a
    /// throwaway one for the rarer multi-tenant override case.
    fn keys_for(&self, prefix: &str) -> Arc<KeyBuilder> {
        if prefix == self.keys.prefix() {
            self.keys.clone()
        } else {
            Arc::new(KeyBuilder::new(prefix))
        }
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Route a background-path error (write pipeline failure, subscription
    /// setup failure) to the configured callback, and also broadcast it as
    /// an `Error` event so manager subscribers see it without having
    /// registered a callback.
    fn report_error(&self, error: CacheError) {
        let message = error.to_string();
        tracing::warn!(error = %message, "background cache error");
        crate::metrics::record_backend_error();
        if let Some(cb) = &self.error_callback {
            cb(error);
        }
        self.emit(CacheEvent::Error { message });
    }

    async fn primary_connection(&self) -> Arc<AsyncMutex<MultiplexedConnection>> {
        self.primary.clone()
    }

    async fn secondary_connection(&self) -> CacheResult<Arc<AsyncMutex<MultiplexedConnection>>> {
        let conn = self
            .secondary
            .get_or_try_init(|| async {
                let conn = self.client.get_multiplexed_async_connection().await?;
                Ok::<_, CacheError>(Arc::new(AsyncMutex::new(conn)))
            })
            .await?;
        Ok(conn.clone())
    }

    fn register_subscription_handle(&self, handle: JoinHandle<()>) {
        self.subscription_handles.lock().unwrap().push(handle);
    }
}

impl CacheEngine {
    /// Arms the cleanup queue's single-flight drain loop if it isn't
    /// already running. Only the connections and queue are cloned into the
    /// spawned task, not the whole engine — the task outlives any single
    /// call and must not borrow `&self`.
    pub(crate) fn schedule_cleanup_drain(&self) {
        if !self.cleanup.try_arm() {
            return;
        }
        let cleanup = self.cleanup.clone();
        let client = self.client.clone();
        let secondary = self.secondary.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                let conn_arc = if let Some(conn) = secondary.get() {
                    conn.clone()
                } else {
                    match client.get_multiplexed_async_connection().await {
                        Ok(conn) => {
                            let arc = Arc::new(AsyncMutex::new(conn));
                            let _ = secondary.set(arc.clone());
                            arc
                        }
                        Err(e) => {
                            let _ = events_tx.send(CacheEvent::Error {
                                message: format!("cleanup: secondary connection failed: {e}"),
                            });
                            cleanup.disarm_and_notify();
                            return;
                        }
                    }
                };

                let Some(task) = cleanup.pop() else {
                    cleanup.disarm_and_notify();
                    let _ = events_tx.send(CacheEvent::CleanupComplete);
                    return;
                };

                let mut conn = conn_arc.lock().await;
                let outcome = crate::cleanup::execute(&mut conn, &cleanup, &task).await;
                drop(conn);

                crate::metrics::record_cleanup_task();
                let _ = events_tx.send(CacheEvent::CleanupTaskScheduled { task: task.clone() });
                if let Err(e) = outcome {
                    crate::metrics::record_backend_error();
                    tracing::warn!(error = %e, "cleanup task failed");
                    let _ = events_tx.send(CacheEvent::Error {
                        message: format!("cleanup task failed: {e}"),
                    });
                }
            }
        });
    }
}

/// Zero-sized view restricting callers to the Store facet (`get`,
/// `create_write_stream`, the delete family) — the surface an HTTP client
/// dispatcher needs.
#[derive(Clone, Copy)]
pub struct Store<'a>(&'a CacheEngine);

/// Zero-sized view restricting callers to the Manager facet (iteration,
/// subscription, introspection) — the surface admin tooling needs. Both
/// views borrow the same `CacheEngine`; neither duplicates state.
#[derive(Clone, Copy)]
pub struct Manager<'a>(&'a CacheEngine);

impl<'a> Store<'a> {
    pub async fn get(
        &self,
        key: &CacheKey,
        prefixes: Option<&[String]>,
        include_body: bool,
    ) -> CacheResult<Option<CacheEntry>> {
        read::get(self.0, key, prefixes, include_body).await
    }

    pub fn create_write_stream(&self, key: CacheKey, meta: CacheEntryMeta) -> CacheResult<WriteSink<'a>> {
        write::create_write_stream(self.0, key, meta)
    }

    pub async fn delete(&self, key: &CacheKey, prefixes: Option<&[String]>) -> CacheResult<()> {
        delete::delete(self.0, key, prefixes).await
    }

    pub async fn delete_keys(&self, keys: &[CacheKey], prefixes: Option<&[String]>) -> CacheResult<()> {
        delete::delete_keys(self.0, keys, prefixes).await
    }

    pub async fn delete_ids(&self, ids: &[String], prefixes: Option<&[String]>) -> CacheResult<()> {
        delete::delete_ids(self.0, ids, prefixes).await
    }

    pub async fn delete_tag(&self, tags: &[String], prefixes: Option<&[String]>) -> CacheResult<()> {
        delete::delete_tag(self.0, tags, prefixes).await
    }

    pub async fn delete_tags(&self, tag_lists: &[Vec<String>], prefixes: Option<&[String]>) -> CacheResult<()> {
        delete::delete_tags(self.0, tag_lists, prefixes).await
    }
}

impl<'a> Manager<'a> {
    pub async fn stream_entries<F>(&self, prefixes: Option<&[String]>, on_entry: F) -> CacheResult<()>
    where
        F: FnMut(CacheEntry) -> CacheResult<()>,
    {
        iterate::stream_entries(self.0, prefixes, on_entry).await
    }

    pub async fn get_tag(&self, tag: &str, prefixes: Option<&[String]>) -> CacheResult<Vec<CacheEntry>> {
        iterate::get_tag(self.0, tag, prefixes).await
    }

    pub async fn get_dependent_entries(
        &self,
        id: &str,
        prefixes: Option<&[String]>,
    ) -> CacheResult<Vec<CacheEntry>> {
        iterate::get_dependent_entries(self.0, id, prefixes).await
    }

    pub async fn get_response_by_id(&self, id: &str, prefixes: Option<&[String]>) -> CacheResult<Option<String>> {
        iterate::get_response_by_id(self.0, id, prefixes).await
    }

    /// Establishes both subscription tasks (manager keyspace notifications,
    /// and — if tracking is enabled — client-side-tracking invalidation).
    /// Idempotent per call: each call opens another pair of connections and
    /// registers another pair of handles, so callers should subscribe once.
    pub async fn subscribe(&self, prefixes: Option<&[String]>) -> CacheResult<()> {
        subscribe::subscribe(self.0, prefixes).await
    }
}
