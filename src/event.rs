//! Event records persisted through the metrics queue.
//!
//! `save` stamps the event and pushes it onto the configured queue; a push
//! failure is surfaced to the caller instead of being swallowed.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::runtime::Runtime;
use crate::Result;

pub const DEFAULT_EVENT_QUEUE: &str = "metrics";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMetadata {
    pub category: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    pub timestamp: u64,
    pub metadata: EventMetadata,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(category: &str, name: &str, payload: serde_json::Value) -> Self {
        Self {
            timestamp: 0,
            metadata: EventMetadata {
                category: category.to_string(),
                name: name.to_string(),
            },
            payload,
        }
    }
}

/// Persist an event onto the metrics queue.
pub fn save(runtime: &Runtime, queue: &str, mut event: Event) -> Result<()> {
    event.timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    runtime.stats.increment(
        "metrics.save",
        &format!("{}.{}", event.metadata.category, event.metadata.name),
    );

    let data = serde_json::to_vec(&event).expect("event serializes");
    runtime.push(queue, &data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskQueueConfig;
    use tempfile::TempDir;

    #[test]
    fn save_pushes_to_queue() {
        let dir = TempDir::new().unwrap();
        let mut cfg = DiskQueueConfig::default();
        cfg.warning_free_bytes = 0;
        cfg.reserved_free_bytes = 0;
        let runtime = Runtime::open(dir.path(), cfg).unwrap();

        let event = Event::new("elasticsearch", "cluster_health", serde_json::json!({"ok": true}));
        save(&runtime, DEFAULT_EVENT_QUEUE, event).unwrap();

        let cfg = runtime.registry.get(DEFAULT_EVENT_QUEUE).expect("registered");
        assert_eq!(runtime.queues.depth(&cfg.id).unwrap(), 1);
    }
}
