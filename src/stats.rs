//! Process-local counters.
//!
//! A flat registry keyed by dotted names. Cheap enough to call on every queue
//! operation; readers get point-in-time snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Default)]
pub struct Stats {
    counters: RwLock<HashMap<String, Arc<AtomicI64>>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, category: &str, key: &str) {
        self.increment_by(category, key, 1);
    }

    pub fn increment_by(&self, category: &str, key: &str, delta: i64) {
        self.counter(category, key).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, category: &str, key: &str) -> i64 {
        let name = format!("{category}.{key}");
        let counters = self.counters.read().expect("stats lock");
        counters
            .get(&name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, i64> {
        let counters = self.counters.read().expect("stats lock");
        counters
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    fn counter(&self, category: &str, key: &str) -> Arc<AtomicI64> {
        let name = format!("{category}.{key}");
        {
            let counters = self.counters.read().expect("stats lock");
            if let Some(counter) = counters.get(&name) {
                return Arc::clone(counter);
            }
        }
        let mut counters = self.counters.write().expect("stats lock");
        Arc::clone(counters.entry(name).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_accumulate() {
        let stats = Stats::new();
        stats.increment("queue.q1", "push");
        stats.increment("queue.q1", "push");
        stats.increment_by("queue.q1", "pop", 3);
        assert_eq!(stats.get("queue.q1", "push"), 2);
        assert_eq!(stats.get("queue.q1", "pop"), 3);
        assert_eq!(stats.get("queue.q1", "missing"), 0);
    }
}
