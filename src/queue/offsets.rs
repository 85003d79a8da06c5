//! Durable consumer-group offsets.
//!
//! Keys are `<queue_id>|<group>|<name>`, values the text form `"S,O"`.
//! Commit is the delivery boundary: it must be durable before returning and
//! it is the single place regressions are rejected.

use std::str::FromStr;

use crate::kv::KvBucket;
use crate::queue::Offset;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct OffsetStore {
    bucket: KvBucket,
}

impl OffsetStore {
    pub fn open(data_dir: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            bucket: KvBucket::open(data_dir.as_ref().join("queue").join("offsets"))?,
        })
    }

    fn key(queue: &str, group: &str, name: &str) -> String {
        format!("{queue}|{group}|{name}")
    }

    /// Committed offset, or the start of the queue if the group has never
    /// committed.
    pub fn get(&self, queue: &str, group: &str, name: &str) -> Result<Offset> {
        let key = Self::key(queue, group, name);
        match self.bucket.get(&key)? {
            Some(raw) => {
                let text = String::from_utf8(raw)
                    .map_err(|_| Error::InvalidOffset(format!("non-utf8 offset for {key}")))?;
                Offset::from_str(&text)
            }
            None => Ok(Offset::default()),
        }
    }

    /// Register the group with the start-of-queue offset if it has never
    /// committed, so retention counts it from the moment it exists.
    pub fn init(&self, queue: &str, group: &str, name: &str) -> Result<Offset> {
        let key = Self::key(queue, group, name);
        if self.bucket.get(&key)?.is_none() {
            self.bucket
                .put(&key, Offset::default().to_string().as_bytes())?;
        }
        self.get(queue, group, name)
    }

    /// Commit a new offset. Equal commits are accepted as no-ops; anything
    /// lower than the stored offset is a regression and is rejected.
    pub fn commit(&self, queue: &str, group: &str, name: &str, offset: Offset) -> Result<()> {
        let key = Self::key(queue, group, name);
        let committed = self.get(queue, group, name)?;
        if offset < committed {
            return Err(Error::OffsetRegression {
                key,
                requested: offset,
                committed,
            });
        }
        if offset == committed {
            return Ok(());
        }
        self.bucket.put(&key, offset.to_string().as_bytes())?;
        log::trace!("committed [{key}] -> {offset}");
        Ok(())
    }

    /// Earliest committed offset across all groups of a queue, with the
    /// number of groups seen. `None` offset when no group has committed yet.
    pub fn earliest_committed(&self, queue: &str) -> Result<(usize, Option<Offset>)> {
        let prefix = format!("{queue}|");
        let keys = self.bucket.keys_with_prefix(&prefix)?;
        let mut earliest: Option<Offset> = None;
        for key in &keys {
            let raw = match self.bucket.get(key)? {
                Some(raw) => raw,
                None => continue,
            };
            let text = String::from_utf8_lossy(&raw);
            let offset = Offset::from_str(&text)?;
            earliest = Some(match earliest {
                Some(current) => current.min(offset),
                None => offset,
            });
        }
        Ok((keys.len(), earliest))
    }

    /// True when some group of the queue (or a queue nobody has consumed yet)
    /// still has messages ahead of it.
    pub fn queue_has_lag(&self, queue: &str, latest: Offset, earliest: Offset) -> Result<bool> {
        let (groups, min_committed) = self.earliest_committed(queue)?;
        if groups == 0 {
            return Ok(latest > earliest);
        }
        Ok(min_committed.map_or(latest > earliest, |off| off < latest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_offset_is_queue_start() {
        let dir = TempDir::new().unwrap();
        let store = OffsetStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get("q1", "g1", "c1").unwrap(),
            Offset::default()
        );
    }

    #[test]
    fn commit_rejects_regression() {
        let dir = TempDir::new().unwrap();
        let store = OffsetStore::open(dir.path()).unwrap();

        store.commit("q1", "g1", "c1", Offset::new(1, 100)).unwrap();
        assert_eq!(store.get("q1", "g1", "c1").unwrap(), Offset::new(1, 100));

        // Equal commit: accepted, no change.
        store.commit("q1", "g1", "c1", Offset::new(1, 100)).unwrap();

        let err = store
            .commit("q1", "g1", "c1", Offset::new(0, 999_999))
            .unwrap_err();
        assert!(matches!(err, Error::OffsetRegression { .. }));
        assert_eq!(store.get("q1", "g1", "c1").unwrap(), Offset::new(1, 100));
    }

    #[test]
    fn earliest_spans_groups() {
        let dir = TempDir::new().unwrap();
        let store = OffsetStore::open(dir.path()).unwrap();
        store.commit("q1", "g1", "c1", Offset::new(3, 10)).unwrap();
        store.commit("q1", "g2", "c1", Offset::new(1, 500)).unwrap();
        store.commit("q2", "g1", "c1", Offset::new(9, 9)).unwrap();

        let (groups, earliest) = store.earliest_committed("q1").unwrap();
        assert_eq!(groups, 2);
        assert_eq!(earliest, Some(Offset::new(1, 500)));
    }

    #[test]
    fn lag_detection() {
        let dir = TempDir::new().unwrap();
        let store = OffsetStore::open(dir.path()).unwrap();
        let latest = Offset::new(0, 100);
        let earliest = Offset::new(0, 0);

        // Nobody consumed yet, queue non-empty.
        assert!(store.queue_has_lag("q1", latest, earliest).unwrap());

        store.commit("q1", "g1", "c1", Offset::new(0, 100)).unwrap();
        assert!(!store.queue_has_lag("q1", latest, earliest).unwrap());

        store.commit("q1", "g2", "c1", Offset::new(0, 50)).unwrap();
        assert!(store.queue_has_lag("q1", latest, earliest).unwrap());
    }
}
