//! Closed set of strongly-typed events, broadcast to any number of
//! subscribers. Replaces a dynamic, free-form event emitter with a fixed
//! enum so subscribers pattern-match rather than stringly-type payloads.

use tokio::sync::broadcast;

use crate::cleanup::CleanupTask;
use crate::entry::CacheEntryMeta;
use crate::header::NormalizedHeaders;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum CacheEvent {
    EntryWrite {
        prefix: String,
        id: String,
        entry: CacheEntryMeta,
    },
    EntryDelete {
        prefix: String,
        id: String,
    },
    TagDelete {
        prefix: String,
        tag: String,
    },
    SubscriptionEntryAdd {
        prefix: String,
        id: String,
        entry: CacheEntryMeta,
    },
    SubscriptionEntryDelete {
        prefix: String,
        id: String,
    },
    TrackingAdd {
        prefix: String,
        origin: String,
        path: String,
        method: String,
        headers: NormalizedHeaders,
    },
    TrackingDelete {
        prefix: String,
        origin: String,
        path: String,
        method: String,
    },
    CleanupTaskScheduled {
        task: CleanupTask,
    },
    CleanupComplete,
    Error {
        message: String,
    },
}

pub fn channel() -> (broadcast::Sender<CacheEvent>, broadcast::Receiver<CacheEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
