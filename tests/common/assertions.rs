//! Custom test assertions for integration tests

use content_sync::{Event, Syncer, VersionId};
use std::collections::BTreeSet;
use tokio::sync::broadcast;

/// Natural keys (as strings) of the content in `version`
pub async fn version_keys(syncer: &Syncer, version: VersionId) -> BTreeSet<String> {
    syncer
        .database()
        .content_keys_in_version(version)
        .await
        .expect("Failed to list version content")
        .into_keys()
        .map(|key| key.to_string())
        .collect()
}

/// Expected key set, for comparing with [`version_keys`]
pub fn keys(names: &[&str]) -> BTreeSet<String> {
    names
        .iter()
        .map(|name| super::fixtures::key(name).to_string())
        .collect()
}

/// Every event already published on `events`
pub fn drain_events(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}
