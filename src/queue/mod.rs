//! Durable, segmented, file-backed message queues.
//!
//! A queue is a directory of append-only segment files plus per-group
//! committed offsets. Writers seal a segment when the next record would cross
//! the size cap; cursors follow the writer across segment boundaries and
//! tolerate concurrent file growth.

mod consumer;
mod events;
mod offsets;
mod registry;
mod replication;
mod retention;
mod segment;
mod store;
mod writer;

pub use consumer::{Consumer, FetchContext};
pub use events::{EventBus, QueueEvent, QueueEventKind};
pub use offsets::OffsetStore;
pub use registry::{QueueConfig, QueueSelector, Registry};
pub use replication::{DirUploader, Replicator, SegmentUploader, WatermarkStore};
pub use retention::Reaper;
pub use segment::{
    discover_segments, parse_segment_filename, segment_filename, segment_path, FRAME_HEADER_LEN,
};
pub use store::DiskQueueStore;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Position within a queue: segment number plus byte offset inside it.
///
/// The derived ordering is lexicographic over `(segment, position)`, which is
/// the total order consumers advance through.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Offset {
    pub segment: i64,
    pub position: i64,
}

impl Offset {
    pub fn new(segment: i64, position: i64) -> Self {
        Self { segment, position }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.segment, self.position)
    }
}

impl FromStr for Offset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (segment, position) = s
            .split_once(',')
            .ok_or_else(|| Error::InvalidOffset(s.to_string()))?;
        let segment = segment
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::InvalidOffset(s.to_string()))?;
        let position = position
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::InvalidOffset(s.to_string()))?;
        Ok(Self { segment, position })
    }
}

/// One record handed to the pipeline. `size` is the on-disk footprint
/// (header + stored payload), not the decompressed length.
#[derive(Debug, Clone)]
pub struct Message {
    pub data: Vec<u8>,
    pub size: usize,
    pub offset: Offset,
    pub next_offset: Offset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_text_roundtrip() {
        let offset = Offset::new(3, 1024);
        assert_eq!(offset.to_string(), "3,1024");
        assert_eq!("3,1024".parse::<Offset>().unwrap(), offset);
        assert!("3".parse::<Offset>().is_err());
        assert!("a,b".parse::<Offset>().is_err());
    }

    #[test]
    fn offset_order_is_lexicographic() {
        assert!(Offset::new(0, 500) < Offset::new(1, 0));
        assert!(Offset::new(1, 0) < Offset::new(1, 1));
        assert!(Offset::new(2, 0) > Offset::new(1, 99999));
    }
}
