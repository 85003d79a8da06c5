//! Consumer-group cursor over one queue.
//!
//! A cursor owns its read handle and a `(segment, position)` pair. Reads are
//! tolerant of a writer appending to the file underneath: on EOF the cursor
//! re-stats the file, reopens at the last record boundary and retries. Segment
//! boundaries emit `ReadComplete` so the reaper can advance.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ConsumerConfig, DiskQueueConfig};
use crate::queue::events::{EventBus, QueueEvent, QueueEventKind};
use crate::queue::segment::{segment_path, FRAME_HEADER_LEN};
use crate::queue::store::{ConsumerObserver, PauseGate};
use crate::queue::writer::DiskQueue;
use crate::queue::{Message, Offset};
use crate::{Error, Result};

/// Offset window of one fetch: where the cursor started and the first offset
/// it has not yet returned. Committing `next_offset` is the delivery boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchContext {
    pub init_offset: Offset,
    pub next_offset: Offset,
}

pub struct Consumer {
    id: u64,
    queue: String,
    dir: PathBuf,
    mcfg: Arc<DiskQueueConfig>,
    ccfg: ConsumerConfig,
    diskq: Arc<DiskQueue>,
    events: Arc<EventBus>,
    observer: Arc<ConsumerObserver>,
    gate: Arc<PauseGate>,

    segment: i64,
    read_pos: i64,
    /// Observed size of the current file when it was opened; the per-file
    /// read cap until a reopen observes growth.
    max_bytes_per_file_read: i64,
    reader: Option<BufReader<File>>,
    file_path: PathBuf,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: &str,
        dir: PathBuf,
        mcfg: Arc<DiskQueueConfig>,
        ccfg: ConsumerConfig,
        diskq: Arc<DiskQueue>,
        events: Arc<EventBus>,
        observer: Arc<ConsumerObserver>,
        gate: Arc<PauseGate>,
        offset: Offset,
    ) -> Result<Self> {
        let id = observer.register(queue, offset.segment);
        let mut consumer = Self {
            id,
            queue: queue.to_string(),
            dir,
            mcfg,
            ccfg,
            diskq,
            events,
            observer,
            gate,
            segment: offset.segment,
            read_pos: offset.position,
            max_bytes_per_file_read: 0,
            reader: None,
            file_path: PathBuf::new(),
        };
        consumer.reset_offset(offset.segment, offset.position)?;
        Ok(consumer)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn offset(&self) -> Offset {
        Offset::new(self.segment, self.read_pos)
    }

    /// Reposition the cursor. Seeking past the writer head yields `Error::Eof`;
    /// a reaped segment yields `Error::NotFound`.
    pub fn reset_offset(&mut self, segment: i64, read_pos: i64) -> Result<()> {
        if segment > self.diskq.write_segment() {
            log::error!(
                "queue [{}]: read segment {} is beyond write segment {}",
                self.queue,
                segment,
                self.diskq.write_segment()
            );
            return Err(Error::Eof);
        }

        if self.segment != segment {
            self.reader = None;
        }

        self.segment = segment;
        self.read_pos = read_pos;
        self.max_bytes_per_file_read = 0;
        self.observer.update(self.id, segment);

        let path = segment_path(&self.dir, segment);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path.display().to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata()?.len() as i64;
        if read_pos > 0 {
            file.seek(SeekFrom::Start(read_pos as u64))?;
        }
        self.max_bytes_per_file_read = size;
        self.reader = Some(BufReader::new(file));
        self.file_path = path;
        Ok(())
    }

    /// Fetch up to `fetch_max_messages` / `fetch_max_bytes` worth of records.
    /// An empty result against the writer head is not an error.
    pub fn fetch(&mut self, ctx: &mut FetchContext) -> Result<Vec<Message>> {
        self.gate.wait_while_paused(&self.queue);

        ctx.init_offset = self.offset();
        ctx.next_offset = ctx.init_offset;

        let mut messages: Vec<Message> = Vec::new();
        let mut total_size = 0usize;

        loop {
            let mut header = [0u8; FRAME_HEADER_LEN];
            match self.read_exact(&mut header) {
                Ok(()) => {}
                Err(err) if is_eof(&err) => {
                    match self.on_head_eof(ctx, messages.is_empty())? {
                        EofStep::Retry => continue,
                        EofStep::Return => return Ok(messages),
                    }
                }
                Err(err) => return Err(err.into()),
            }

            let len = i32::from_be_bytes(header);
            if len < self.mcfg.min_msg_size as i32 || len > self.mcfg.max_msg_size as i32 {
                // The tail may hold a record written after our open; re-stat
                // before declaring corruption.
                if self.file_size() > self.max_bytes_per_file_read {
                    self.reset_current(ctx)?;
                    return Ok(messages);
                }
                return Err(Error::CorruptFrame {
                    queue: self.queue.clone(),
                    offset: self.offset(),
                    reason: format!(
                        "message size {} outside [{}, {}]",
                        len, self.mcfg.min_msg_size, self.mcfg.max_msg_size
                    ),
                });
            }

            let mut payload = vec![0u8; len as usize];
            match self.read_exact(&mut payload) {
                Ok(()) => {}
                // Torn tail: the writer has framed the length but not yet the
                // payload. Leave the cursor at the record boundary.
                Err(err) if is_eof(&err) => {
                    self.reset_current(ctx)?;
                    return Ok(messages);
                }
                Err(err) => return Err(err.into()),
            }

            let stored_size = FRAME_HEADER_LEN + len as usize;
            let prev_pos = self.read_pos;
            let next_pos = self.read_pos + stored_size as i64;
            self.read_pos = next_pos;

            let data = if self.mcfg.compress.message.enabled {
                match zstd::stream::decode_all(&payload[..]) {
                    Ok(data) => data,
                    Err(err) => {
                        ctx.next_offset = Offset::new(self.segment, next_pos);
                        return Err(Error::Decompress {
                            queue: self.queue.clone(),
                            offset: Offset::new(self.segment, prev_pos),
                            source: err,
                        });
                    }
                }
            } else {
                payload
            };

            messages.push(Message {
                data,
                size: stored_size,
                offset: Offset::new(self.segment, prev_pos),
                next_offset: Offset::new(self.segment, next_pos),
            });
            ctx.next_offset = Offset::new(self.segment, next_pos);
            total_size += stored_size;

            if messages.len() >= self.ccfg.fetch_max_messages {
                return Ok(messages);
            }
            if self.ccfg.fetch_max_bytes > 0 && total_size > self.ccfg.fetch_max_bytes {
                return Ok(messages);
            }

            if next_pos >= self.max_bytes_per_file_read {
                if segment_path(&self.dir, self.segment + 1).exists() {
                    if self.file_size() > self.read_pos {
                        // Sealed file gained records after our open.
                        match tolerate_missing(self.reset_current(ctx), EofStep::Retry)? {
                            EofStep::Retry => {
                                self.eof_sleep();
                                continue;
                            }
                            EofStep::Return => return Ok(messages),
                        }
                    }
                    match tolerate_missing(self.advance_segment(ctx), EofStep::Retry)? {
                        EofStep::Retry => continue,
                        EofStep::Return => return Ok(messages),
                    }
                }
                return Ok(messages);
            }
        }
    }

    /// Fetch, blocking up to `fetch_max_wait_ms` for the first record. The
    /// second value reports whether the wait budget ran out empty-handed.
    pub fn fetch_wait(&mut self, ctx: &mut FetchContext) -> Result<(Vec<Message>, bool)> {
        let deadline =
            Instant::now() + Duration::from_millis(self.ccfg.fetch_max_wait_ms.max(1));
        loop {
            let messages = self.fetch(ctx)?;
            if !messages.is_empty() {
                return Ok((messages, false));
            }
            if Instant::now() >= deadline {
                return Ok((messages, true));
            }
        }
    }

    fn on_head_eof(&mut self, ctx: &mut FetchContext, empty: bool) -> Result<EofStep> {
        if self.file_size() > self.read_pos {
            // File grew while our handle saw EOF: reopen at the boundary.
            log::debug!(
                "queue [{}]: file grew past {}, reopening",
                self.queue,
                self.read_pos
            );
            self.eof_sleep();
            return tolerate_missing(self.reset_current(ctx), EofStep::Retry);
        }

        if segment_path(&self.dir, self.segment + 1).exists() {
            return tolerate_missing(self.advance_segment(ctx), EofStep::Retry);
        }

        if self.segment < self.diskq.write_segment() {
            self.advance_segment(ctx).or_else(not_found_ok)?;
            return Ok(EofStep::Return);
        }

        if empty {
            self.eof_sleep();
        }
        Ok(EofStep::Return)
    }

    fn advance_segment(&mut self, ctx: &mut FetchContext) -> Result<()> {
        self.events.publish(QueueEvent {
            queue: self.queue.clone(),
            kind: QueueEventKind::ReadComplete,
            segment: self.segment,
        });
        ctx.next_offset = self.offset();
        self.reset_offset(self.segment + 1, 0)?;
        ctx.next_offset = self.offset();
        Ok(())
    }

    fn reset_current(&mut self, ctx: &mut FetchContext) -> Result<()> {
        ctx.next_offset = self.offset();
        self.reset_offset(self.segment, self.read_pos)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        reader.read_exact(buf)
    }

    fn file_size(&self) -> i64 {
        std::fs::metadata(&self.file_path)
            .map(|m| m.len() as i64)
            .unwrap_or(-1)
    }

    fn eof_sleep(&self) {
        if self.ccfg.eof_retry_delay_in_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.ccfg.eof_retry_delay_in_ms));
        }
    }
}

enum EofStep {
    Retry,
    Return,
}

/// A segment reaped between the existence check and the open is an EOF-like
/// race, not a failure: hand back what we have.
fn tolerate_missing(result: Result<()>, on_ok: EofStep) -> Result<EofStep> {
    match result {
        Ok(()) => Ok(on_ok),
        Err(Error::NotFound(_)) => Ok(EofStep::Return),
        Err(err) => Err(err),
    }
}

fn not_found_ok(err: Error) -> Result<()> {
    match err {
        Error::NotFound(_) => Ok(()),
        other => Err(other),
    }
}

fn is_eof(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::UnexpectedEof
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.observer.remove(self.id);
    }
}
