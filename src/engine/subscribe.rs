//! Wires the two subscription tasks in `crate::subscription` to one
//! `CacheEngine` instance — `spec.md` §4.6.

use super::CacheEngine;
use crate::errors::CacheResult;
use crate::subscription;

/// Extract the numeric database index from a `redis://host:port/<db>` URL,
/// defaulting to `0` when absent or unparsable.
fn db_index(redis_url: &str) -> u32 {
    redis_url
        .rsplit('/')
        .next()
        .and_then(|segment| segment.split(['?', '#']).next())
        .and_then(|segment| segment.parse().ok())
        .unwrap_or(0)
}

pub async fn subscribe(engine: &CacheEngine, prefixes: Option<&[String]>) -> CacheResult<()> {
    engine.ensure_open()?;
    let known_prefixes = engine.resolve_prefixes(prefixes);
    let db = db_index(&engine.config.redis_url);

    let manager_handle = subscription::spawn_manager_subscription(
        engine.client.clone(),
        engine.primary.clone(),
        db,
        engine.config.client_config_keyspace_event_notify,
        known_prefixes,
        engine.events_tx.clone(),
    )
    .await?;
    engine.register_subscription_handle(manager_handle);

    if let Some(tracking) = &engine.tracking {
        let tracking_handle = subscription::spawn_tracking_subscription(
            engine.client.clone(),
            engine.primary.clone(),
            tracking.clone(),
            engine.events_tx.clone(),
        )
        .await?;
        engine.register_subscription_handle(tracking_handle);
    }

    Ok(())
}
