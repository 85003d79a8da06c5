//! Off-host replication of sealed segments.
//!
//! Listens for `WriteComplete`, ships the sealed file through a
//! `SegmentUploader`, and records the per-queue watermark: the highest
//! segment known to live off-host. Replication never changes reader or
//! writer semantics; the reaper merely refuses to pass the watermark.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::ReplicationConfig;
use crate::kv::KvBucket;
use crate::queue::segment::{discover_segments, segment_filename};
use crate::{Error, Result};

const WATERMARK_NAMESPACE: &str = "last_success_file_for_queue";

/// Per-queue watermark of the last uploaded segment. Values are an i64 as
/// 8 bytes big-endian; `-1` means nothing has been shipped.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    bucket: KvBucket,
}

impl WatermarkStore {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            bucket: KvBucket::open(data_dir.as_ref().join("kv"))?,
        })
    }

    fn key(queue: &str) -> String {
        format!("{WATERMARK_NAMESPACE}|{queue}")
    }

    pub fn get(&self, queue: &str) -> Result<i64> {
        match self.bucket.get(&Self::key(queue))? {
            Some(raw) if raw.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&raw);
                Ok(i64::from_be_bytes(buf))
            }
            Some(_) => Err(Error::Unsupported("corrupt replication watermark")),
            None => Ok(-1),
        }
    }

    pub fn set(&self, queue: &str, segment: i64) -> Result<()> {
        self.bucket
            .put(&Self::key(queue), &segment.to_be_bytes())
    }
}

/// Destination for sealed segment files.
pub trait SegmentUploader: Send + Sync {
    /// Ship `local` to `remote_key`. Must be atomic enough that a partial
    /// upload is never mistaken for a complete one.
    fn upload(&self, local: &Path, remote_key: &str) -> Result<()>;
}

/// Uploader that mirrors segments into another directory tree (a mounted
/// bucket, NFS export, staging area for an external shipper).
pub struct DirUploader {
    root: PathBuf,
}

impl DirUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SegmentUploader for DirUploader {
    fn upload(&self, local: &Path, remote_key: &str) -> Result<()> {
        let target = self.root.join(remote_key);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = target.with_extension("upload");
        std::fs::copy(local, &tmp)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }
}

pub struct Replicator {
    cfg: ReplicationConfig,
    uploader: Arc<dyn SegmentUploader>,
    watermarks: WatermarkStore,
    // Serializes watermark read/advance across writer threads.
    upload_lock: Arc<Mutex<()>>,
}

impl Replicator {
    pub fn new(
        cfg: ReplicationConfig,
        uploader: Arc<dyn SegmentUploader>,
        watermarks: WatermarkStore,
    ) -> Self {
        Self {
            cfg,
            uploader,
            watermarks,
            upload_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// React to a sealed segment. Async mode hands the copy to a background
    /// thread and returns; sync mode reports the upload result.
    pub fn on_write_complete(&self, queue: &str, segment: i64, queue_dir: &Path) -> Result<()> {
        if !self.cfg.enabled {
            return Ok(());
        }

        let _guard = self.upload_lock.lock().expect("upload lock");
        let watermark = self.watermarks.get(queue)?;
        if segment <= watermark {
            log::trace!(
                "queue [{queue}] segment {segment} already shipped (watermark {watermark})"
            );
            return Ok(());
        }

        let local = crate::queue::segment::segment_path(queue_dir, segment);
        let remote_key = self.remote_key(queue, segment);

        if self.cfg.r#async {
            let uploader = Arc::clone(&self.uploader);
            let watermarks = self.watermarks.clone();
            let queue = queue.to_string();
            std::thread::spawn(move || {
                match uploader.upload(&local, &remote_key) {
                    Ok(()) => {
                        if let Err(err) = watermarks.set(&queue, segment) {
                            log::error!(
                                "queue [{queue}] segment {segment}: watermark update failed: {err}"
                            );
                        } else {
                            log::debug!("queue [{queue}] segment {segment} shipped");
                        }
                    }
                    Err(err) => {
                        log::error!("queue [{queue}] segment {segment}: upload failed: {err}")
                    }
                }
            });
            return Ok(());
        }

        self.uploader.upload(&local, &remote_key)?;
        self.watermarks.set(queue, segment)?;
        log::debug!("queue [{queue}] segment {segment} shipped");
        Ok(())
    }

    /// Ship every sealed segment between the watermark and the writer head.
    /// Run once at boot so an interrupted process leaves no gaps.
    pub fn catch_up(&self, queue: &str, queue_dir: &Path, write_segment: i64) -> Result<()> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let watermark = self.watermarks.get(queue)?;
        let on_disk = discover_segments(queue_dir)?;
        for segment in on_disk {
            if segment <= watermark || segment >= write_segment {
                continue;
            }
            log::debug!("queue [{queue}] catch-up upload of segment {segment}");
            self.on_write_complete(queue, segment, queue_dir)?;
        }
        Ok(())
    }

    fn remote_key(&self, queue: &str, segment: i64) -> String {
        let file = segment_filename(segment);
        let mut parts = Vec::new();
        for part in [
            self.cfg.bucket.as_str(),
            self.cfg.location.as_str(),
            queue,
        ] {
            if !part.is_empty() {
                parts.push(part);
            }
        }
        parts.push(&file);
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sync_cfg() -> ReplicationConfig {
        ReplicationConfig {
            enabled: true,
            r#async: false,
            server: "local".to_string(),
            location: "region-1".to_string(),
            bucket: "segments".to_string(),
        }
    }

    #[test]
    fn watermark_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = WatermarkStore::open(dir.path()).unwrap();
        assert_eq!(store.get("q1").unwrap(), -1);
        store.set("q1", 7).unwrap();
        assert_eq!(store.get("q1").unwrap(), 7);
        assert_eq!(store.get("q2").unwrap(), -1);
    }

    #[test]
    fn uploads_and_advances_watermark() {
        let dir = TempDir::new().unwrap();
        let queue_dir = dir.path().join("queue").join("q1");
        std::fs::create_dir_all(&queue_dir).unwrap();
        std::fs::write(queue_dir.join("000000000.dat"), b"payload").unwrap();

        let remote = dir.path().join("remote");
        let watermarks = WatermarkStore::open(dir.path()).unwrap();
        let replicator = Replicator::new(
            sync_cfg(),
            Arc::new(DirUploader::new(&remote)),
            watermarks.clone(),
        );

        replicator.on_write_complete("q1", 0, &queue_dir).unwrap();
        assert_eq!(watermarks.get("q1").unwrap(), 0);
        let shipped = remote
            .join("segments")
            .join("region-1")
            .join("q1")
            .join("000000000.dat");
        assert_eq!(std::fs::read(shipped).unwrap(), b"payload");

        // Re-sealing an already-shipped segment is a no-op.
        replicator.on_write_complete("q1", 0, &queue_dir).unwrap();
        assert_eq!(watermarks.get("q1").unwrap(), 0);
    }

    #[test]
    fn catch_up_ships_gap_only() {
        let dir = TempDir::new().unwrap();
        let queue_dir = dir.path().join("queue").join("q1");
        std::fs::create_dir_all(&queue_dir).unwrap();
        for n in 0..4i64 {
            std::fs::write(
                queue_dir.join(segment_filename(n)),
                format!("seg{n}").as_bytes(),
            )
            .unwrap();
        }

        let remote = dir.path().join("remote");
        let watermarks = WatermarkStore::open(dir.path()).unwrap();
        watermarks.set("q1", 0).unwrap();
        let replicator = Replicator::new(
            sync_cfg(),
            Arc::new(DirUploader::new(&remote)),
            watermarks.clone(),
        );

        // Write head is segment 3: only 1 and 2 are sealed and unshipped.
        replicator.catch_up("q1", &queue_dir, 3).unwrap();
        assert_eq!(watermarks.get("q1").unwrap(), 2);
        let base = remote.join("segments").join("region-1").join("q1");
        assert!(base.join(segment_filename(1)).exists());
        assert!(base.join(segment_filename(2)).exists());
        assert!(!base.join(segment_filename(3)).exists());
    }
}
