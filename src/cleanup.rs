//! Lazy cleanup queue: expired identifiers, emptied tag indices, and
//! now-empty request/method entries are discovered during reads and
//! deletes but must not be removed on the hot path. This module holds the
//! in-process FIFO; execution against Redis happens on the engine's
//! secondary connection (see `engine::cleanup`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Notify;

use crate::errors::CacheResult;
use crate::key::KeyBuilder;

#[derive(Debug, Clone)]
pub enum CleanupTask {
    /// Remove `members` (raw identifier blobs) from `set_key`, then check
    /// whether `(origin, path, method)`'s request entry is now empty.
    Map {
        prefix: String,
        set_key: Arc<str>,
        members: Vec<String>,
        origin: String,
        path: String,
        method: String,
    },
    /// For each tag, drop it from the parent `tags` set if its index set
    /// is empty.
    Tags { prefix: String, tags: Vec<String> },
    /// Check whether a request key, and transitively its route, are empty
    /// and should be pruned from their parent indices.
    Key {
        prefix: String,
        origin: String,
        path: String,
        method: String,
    },
}

/// FIFO of pending tasks with single-flight arming: only one background
/// drain loop runs at a time, armed by `try_arm` and released when the
/// queue empties.
pub struct CleanupQueue {
    tasks: Mutex<VecDeque<CleanupTask>>,
    scheduled: AtomicBool,
    idle: Notify,
}

impl CleanupQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            scheduled: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    pub fn push(&self, task: CleanupTask) {
        self.tasks.lock().unwrap().push_back(task);
    }

    pub fn pop(&self) -> Option<CleanupTask> {
        self.tasks.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Returns true if this call armed the queue (i.e. no drain loop was
    /// already running).
    pub fn try_arm(&self) -> bool {
        !self.scheduled.swap(true, Ordering::SeqCst)
    }

    pub fn disarm_and_notify(&self) {
        self.scheduled.store(false, Ordering::SeqCst);
        self.idle.notify_waiters();
    }

    pub fn is_idle(&self) -> bool {
        self.is_empty() && !self.scheduled.load(Ordering::SeqCst)
    }

    /// Waits until the queue is both empty and no drain loop is scheduled.
    /// Used by `close` to await drain.
    pub async fn await_idle(&self) {
        loop {
            if self.is_idle() {
                return;
            }
            self.idle.notified().await;
        }
    }
}

impl Default for CleanupQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute a single task against the secondary connection. Each task kind
/// matches the description in the component design exactly: `Map` removes
/// members then enqueues a dependent `Key` check, `Tags` prunes
/// now-empty tag indices, `Key` prunes now-empty request/route indices.
/// Each task carries its own prefix, so a throwaway `KeyBuilder` is built
/// per task rather than threaded in by the caller — the drain loop runs
/// tasks from any number of prefixes off one shared queue.
pub async fn execute(
    conn: &mut MultiplexedConnection,
    queue: &CleanupQueue,
    task: &CleanupTask,
) -> CacheResult<()> {
    match task {
        CleanupTask::Map {
            prefix,
            set_key,
            members,
            origin,
            path,
            method,
        } => {
            if !members.is_empty() {
                let mut pipe = redis::pipe();
                for member in members {
                    pipe.zrem(set_key.as_ref(), member);
                }
                let _: () = pipe.query_async(conn).await?;
            }
            queue.push(CleanupTask::Key {
                prefix: prefix.clone(),
                origin: origin.clone(),
                path: path.clone(),
                method: method.clone(),
            });
            Ok(())
        }
        CleanupTask::Tags { prefix, tags } => {
            let keys = KeyBuilder::new(prefix.as_str());
            for tag in tags {
                let tag_key = keys.tag(tag);
                let card: i64 = conn.zcard(tag_key.as_ref()).await?;
                if card == 0 {
                    let _: i64 = conn.zrem(keys.tags().as_ref(), tag.as_str()).await?;
                }
            }
            Ok(())
        }
        CleanupTask::Key {
            prefix,
            origin,
            path,
            method,
        } => {
            let keys = KeyBuilder::new(prefix.as_str());
            let request_key = keys.request(origin, path, method);
            let exists: bool = conn.exists(request_key.as_ref()).await?;
            if exists {
                return Ok(());
            }
            let requests_key = keys.requests(origin, path);
            let _: i64 = conn.zrem(requests_key.as_ref(), method.as_str()).await?;
            let requests_exist: bool = conn.exists(requests_key.as_ref()).await?;
            if !requests_exist {
                let route_member = KeyBuilder::route_member(origin, path);
                let _: i64 = conn.zrem(keys.routes().as_ref(), route_member).await?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_queue_is_idle() {
        let queue = CleanupQueue::new();
        assert!(queue.is_idle());
    }

    #[test]
    fn try_arm_is_single_flight() {
        let queue = CleanupQueue::new();
        assert!(queue.try_arm());
        assert!(!queue.try_arm());
        queue.disarm_and_notify();
        assert!(queue.try_arm());
    }

    #[test]
    fn push_pop_is_fifo() {
        let queue = CleanupQueue::new();
        queue.push(CleanupTask::Tags {
            prefix: "P".into(),
            tags: vec!["a".into()],
        });
        queue.push(CleanupTask::Tags {
            prefix: "P".into(),
            tags: vec!["b".into()],
        });
        match queue.pop() {
            Some(CleanupTask::Tags { tags, .. }) => assert_eq!(tags, vec!["a".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
