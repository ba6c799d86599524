//! Cache engine metrics.
//!
//! Carried as ambient observability, not as a cache feature: `spec.md` §1
//! scopes metrics computation to external collaborators, but the ambient
//! logging/metrics stack is carried regardless (see `SPEC_FULL.md` §2).
//! Grounded on the teacher's `shared/cache/src/metrics.rs` `lazy_static!` +
//! `prometheus` registration idiom, narrowed to the counters this engine's
//! operations actually produce.

use lazy_static::lazy_static;
use prometheus::{register_counter, register_histogram, Counter, Histogram};

lazy_static! {
    static ref GET_HITS: Counter = register_counter!(
        "cache_engine_get_hits_total",
        "Total get() calls that resolved a winning variant"
    )
    .unwrap();
    static ref GET_MISSES: Counter = register_counter!(
        "cache_engine_get_misses_total",
        "Total get() calls that returned absent"
    )
    .unwrap();
    static ref TRACKING_CACHE_HITS: Counter = register_counter!(
        "cache_engine_tracking_cache_hits_total",
        "Total get() calls resolved from the local tracking cache"
    )
    .unwrap();
    static ref WRITES: Counter = register_counter!(
        "cache_engine_writes_total",
        "Total entries written (excludes deduplicated no-ops)"
    )
    .unwrap();
    static ref DEDUPLICATED_WRITES: Counter = register_counter!(
        "cache_engine_deduplicated_writes_total",
        "Total writes aborted because a variant with the same Vary hash already existed"
    )
    .unwrap();
    static ref DELETED_ENTRIES: Counter = register_counter!(
        "cache_engine_deleted_entries_total",
        "Total entries removed by any delete operation"
    )
    .unwrap();
    static ref CLEANUP_TASKS: Counter = register_counter!(
        "cache_engine_cleanup_tasks_total",
        "Total lazy cleanup tasks executed"
    )
    .unwrap();
    static ref BACKEND_ERRORS: Counter = register_counter!(
        "cache_engine_backend_errors_total",
        "Total Redis backend errors surfaced as CacheError::Redis"
    )
    .unwrap();
    static ref WRITE_PIPELINE_LATENCY: Histogram = register_histogram!(
        "cache_engine_write_pipeline_duration_seconds",
        "Latency of the write-path commit pipeline, from dedup guard to emit"
    )
    .unwrap();
}

pub fn record_get_hit(from_tracking_cache: bool) {
    GET_HITS.inc();
    if from_tracking_cache {
        TRACKING_CACHE_HITS.inc();
    }
}

pub fn record_get_miss() {
    GET_MISSES.inc();
}

pub fn record_write() {
    WRITES.inc();
}

pub fn record_deduplicated_write() {
    DEDUPLICATED_WRITES.inc();
}

pub fn record_write_pipeline_latency(seconds: f64) {
    WRITE_PIPELINE_LATENCY.observe(seconds);
}

pub fn record_deleted_entry() {
    DELETED_ENTRIES.inc();
}

pub fn record_cleanup_task() {
    CLEANUP_TASKS.inc();
}

pub fn record_backend_error() {
    BACKEND_ERRORS.inc();
}
