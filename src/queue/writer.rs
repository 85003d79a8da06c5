//! Per-queue segment writer.
//!
//! Appends are serialized behind a mutex. A record that would cross
//! `max_bytes_per_file` seals the current segment first, so records never
//! straddle files. Durability follows the sync cadence: every
//! `sync_every_records` appends or `sync_timeout_in_ms`, whichever comes
//! first.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::DiskQueueConfig;
use crate::queue::events::{EventBus, QueueEvent, QueueEventKind};
use crate::queue::segment::{discover_segments, segment_path, FRAME_HEADER_LEN};
use crate::queue::Offset;
use crate::{Error, Result};

const META_FILE: &str = "meta.json";

/// Writer head persisted beside the segments. Reconciled against the actual
/// file size on open, since a crash may land between a write and a meta sync.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct WriterMeta {
    write_segment: i64,
    write_pos: i64,
    appended: i64,
}

struct WriterState {
    file: File,
    write_pos: i64,
    unsynced_records: u64,
    last_sync: Instant,
    appended: i64,
}

pub(crate) struct DiskQueue {
    pub(crate) id: String,
    pub(crate) dir: PathBuf,
    cfg: Arc<DiskQueueConfig>,
    events: Arc<EventBus>,
    state: Mutex<WriterState>,
    write_segment: AtomicI64,
    appended: AtomicI64,
}

impl DiskQueue {
    pub(crate) fn open(
        id: &str,
        dir: PathBuf,
        cfg: Arc<DiskQueueConfig>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;

        let mut meta = load_meta(&dir.join(META_FILE))?.unwrap_or_default();
        if meta.write_segment == 0 && meta.write_pos == 0 {
            if let Some(&last) = discover_segments(&dir)?.last() {
                meta.write_segment = last;
            }
        }

        let path = segment_path(&dir, meta.write_segment);
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        let size = file.metadata()?.len() as i64;
        if size > meta.write_pos {
            // Records landed after the last meta sync; trust the file.
            meta.write_pos = size;
        }
        file.seek(SeekFrom::Start(meta.write_pos as u64))?;

        Ok(Self {
            id: id.to_string(),
            dir,
            cfg,
            events,
            state: Mutex::new(WriterState {
                file,
                write_pos: meta.write_pos,
                unsynced_records: 0,
                last_sync: Instant::now(),
                appended: meta.appended,
            }),
            write_segment: AtomicI64::new(meta.write_segment),
            appended: AtomicI64::new(meta.appended),
        })
    }

    /// Current segment being written. Safe to read concurrently with appends;
    /// cursors use it to decide whether an EOF is the writer head.
    pub(crate) fn write_segment(&self) -> i64 {
        self.write_segment.load(Ordering::Acquire)
    }

    pub(crate) fn latest_offset(&self) -> Offset {
        let state = self.state.lock().expect("writer lock");
        Offset::new(self.write_segment.load(Ordering::Acquire), state.write_pos)
    }

    pub(crate) fn earliest_offset(&self) -> Result<Offset> {
        let segments = discover_segments(&self.dir)?;
        let earliest = segments
            .first()
            .copied()
            .unwrap_or_else(|| self.write_segment.load(Ordering::Acquire));
        Ok(Offset::new(earliest, 0))
    }

    /// Total messages ever appended.
    pub(crate) fn depth(&self) -> i64 {
        self.appended.load(Ordering::Acquire)
    }

    pub(crate) fn append(&self, data: &[u8]) -> Result<Offset> {
        self.check_capacity()?;

        let stored;
        let payload: &[u8] = if self.cfg.compress.message.enabled {
            stored = zstd::bulk::compress(data, self.cfg.compress.message.level)
                .map_err(Error::Io)?;
            &stored
        } else {
            data
        };

        let len = payload.len();
        if len < self.cfg.min_msg_size as usize {
            return Err(Error::MessageTooSmall {
                size: len,
                min: self.cfg.min_msg_size as usize,
            });
        }
        if len > self.cfg.max_msg_size as usize {
            return Err(Error::MessageTooLarge {
                size: len,
                max: self.cfg.max_msg_size as usize,
            });
        }

        let record_len = (FRAME_HEADER_LEN + len) as i64;
        let mut sealed = None;

        let offset = {
            let mut state = self.state.lock().expect("writer lock");

            if state.write_pos > 0
                && state.write_pos + record_len > self.cfg.max_bytes_per_file as i64
            {
                sealed = Some(self.roll_segment(&mut state)?);
            }

            let segment = self.write_segment.load(Ordering::Acquire);
            let position = state.write_pos;

            state.file.write_all(&(len as u32).to_be_bytes())?;
            state.file.write_all(payload)?;
            state.write_pos += record_len;
            state.appended += 1;
            state.unsynced_records += 1;
            self.appended.store(state.appended, Ordering::Release);

            if state.unsynced_records >= self.cfg.sync_every_records
                || state.last_sync.elapsed().as_millis() as u64 >= self.cfg.sync_timeout_in_ms
            {
                self.sync_locked(&mut state)?;
            }

            Offset::new(segment, position)
        };

        if let Some(old_segment) = sealed {
            self.events.publish(QueueEvent {
                queue: self.id.clone(),
                kind: QueueEventKind::WriteComplete,
                segment: old_segment,
            });
        }

        Ok(offset)
    }

    pub(crate) fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().expect("writer lock");
        self.sync_locked(&mut state)
    }

    fn roll_segment(&self, state: &mut WriterState) -> Result<i64> {
        self.sync_locked(state)?;

        let old_segment = self.write_segment.load(Ordering::Acquire);
        let next_segment = old_segment + 1;
        let path = segment_path(&self.dir, next_segment);
        let file = OpenOptions::new().create(true).write(true).open(&path)?;

        state.file = file;
        state.write_pos = 0;
        self.write_segment.store(next_segment, Ordering::Release);
        self.persist_meta(state)?;

        log::debug!(
            "queue [{}] sealed segment {}, writing segment {}",
            self.id,
            old_segment,
            next_segment
        );
        Ok(old_segment)
    }

    fn sync_locked(&self, state: &mut WriterState) -> Result<()> {
        state.file.sync_data()?;
        state.unsynced_records = 0;
        state.last_sync = Instant::now();
        self.persist_meta(state)
    }

    fn persist_meta(&self, state: &WriterState) -> Result<()> {
        let meta = WriterMeta {
            write_segment: self.write_segment.load(Ordering::Acquire),
            write_pos: state.write_pos,
            appended: state.appended,
        };
        store_meta(&self.dir.join(META_FILE), &meta)
    }

    fn check_capacity(&self) -> Result<()> {
        if self.cfg.max_used_bytes > 0 {
            let segment = self.write_segment.load(Ordering::Acquire);
            let used = segment as u64 * self.cfg.max_bytes_per_file;
            if used >= self.cfg.max_used_bytes {
                return Err(Error::Backpressure {
                    queue: self.id.clone(),
                    reason: format!(
                        "queue exceeds max_used_bytes ({} >= {})",
                        used, self.cfg.max_used_bytes
                    ),
                });
            }
        }

        match free_disk_bytes(&self.dir) {
            Some(free) if free < self.cfg.reserved_free_bytes => Err(Error::Backpressure {
                queue: self.id.clone(),
                reason: format!(
                    "free disk {} below reserved {}",
                    free, self.cfg.reserved_free_bytes
                ),
            }),
            Some(free) if free < self.cfg.warning_free_bytes => {
                log::warn!(
                    "queue [{}]: free disk {} below warning threshold {}",
                    self.id,
                    free,
                    self.cfg.warning_free_bytes
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn load_meta(path: &Path) -> Result<Option<WriterMeta>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let meta = serde_json::from_slice(&data).map_err(|err| {
        log::error!("writer meta parse failed at {:?}: {err}", path);
        Error::Unsupported("corrupt writer meta")
    })?;
    Ok(Some(meta))
}

fn store_meta(path: &Path, meta: &WriterMeta) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec(meta).expect("writer meta serializes");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
pub(crate) fn free_disk_bytes(dir: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let cpath = std::ffi::CString::new(dir.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_bsize as u64)
}

#[cfg(not(unix))]
pub(crate) fn free_disk_bytes(_dir: &Path) -> Option<u64> {
    None
}
