//! Segmented disk-queue message pipeline with Elasticsearch bulk forwarding.
//!
//! Producers append newline-framed bulk bodies onto durable, segmented disk
//! queues; consumer pipelines drain them per queue and slice, replay the
//! batches as `_bulk` requests against the right cluster node, and commit
//! offsets only once every item of a batch is accounted for.

pub mod config;
pub mod elastic;
pub mod error;
pub mod event;
pub mod kv;
pub mod pipeline;
pub mod queue;
pub mod runtime;
pub mod stats;

pub use config::{ConsumerConfig, DiskQueueConfig};
pub use error::{Error, Result};
pub use queue::{Message, Offset};
pub use runtime::Runtime;
