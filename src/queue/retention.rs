//! Retention reaper for consumed segments.
//!
//! Runs on every `WriteComplete` / `ReadComplete`. A segment file is deleted
//! only when it is older than the local retention window AND every committed
//! group, every live cursor, and (when replication is on) the replication
//! watermark have all moved past it.

use std::sync::Weak;

use crate::config::RetentionConfig;
use crate::queue::events::QueueEvent;
use crate::queue::offsets::OffsetStore;
use crate::queue::replication::WatermarkStore;
use crate::queue::segment::segment_path;
use crate::queue::store::DiskQueueStore;
use crate::Result;

pub struct Reaper {
    cfg: RetentionConfig,
    replication_enabled: bool,
    store: Weak<DiskQueueStore>,
    offsets: OffsetStore,
    watermarks: WatermarkStore,
}

impl Reaper {
    pub fn new(
        cfg: RetentionConfig,
        replication_enabled: bool,
        store: Weak<DiskQueueStore>,
        offsets: OffsetStore,
        watermarks: WatermarkStore,
    ) -> Self {
        Self {
            cfg,
            replication_enabled,
            store,
            offsets,
            watermarks,
        }
    }

    pub fn handle(&self, event: &QueueEvent) {
        if let Err(err) = self.delete_unused_files(&event.queue, event.segment) {
            log::error!(
                "reaper failed on queue [{}] segment {}: {err}",
                event.queue,
                event.segment
            );
        }
    }

    pub fn delete_unused_files(&self, queue: &str, _segment: i64) -> Result<()> {
        let Some(store) = self.store.upgrade() else {
            return Ok(());
        };

        let write_segment = store.writer_segment(queue)?;
        // The live write segment is never a candidate, whatever the window.
        let start = (write_segment - self.cfg.max_num_of_local_files).min(write_segment - 1);
        if start < 0 {
            return Ok(());
        }

        let Some(min_live) = self.min_live_segment(queue, &store)? else {
            // Replication enabled but nothing shipped yet, or a cursor parked
            // at the beginning: nothing is safe to delete.
            return Ok(());
        };

        let limit = start.min(min_live - 1);
        if limit < 0 {
            return Ok(());
        }

        let dir = store.queue_dir(queue);
        log::trace!(
            "reaper on queue [{queue}]: start {start}, min live {min_live}, limit {limit}"
        );
        for n in (0..=limit).rev() {
            let path = segment_path(&dir, n);
            if !path.exists() {
                // Older files were reaped by a previous pass.
                break;
            }
            log::debug!("delete queue file {:?}", path);
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Lowest segment still needed by anyone. `None` means nothing may be
    /// deleted; `i64::MAX` means no constraint (no consumers, no replication).
    fn min_live_segment(
        &self,
        queue: &str,
        store: &DiskQueueStore,
    ) -> Result<Option<i64>> {
        let mut min_live = i64::MAX;

        let (groups, committed) = self.offsets.earliest_committed(queue)?;
        if groups > 0 {
            match committed {
                Some(offset) => min_live = min_live.min(offset.segment),
                None => return Ok(None),
            }
        }

        if let Some(active) = store.min_active_segment(queue) {
            min_live = min_live.min(active);
        }

        if self.replication_enabled {
            let watermark = self.watermarks.get(queue)?;
            if watermark < 0 {
                return Ok(None);
            }
            min_live = min_live.min(watermark);
        }

        Ok(Some(min_live))
    }
}
