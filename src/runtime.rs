//! The process runtime: one value owning every shared table.
//!
//! Components never reach for globals; they hold an `Arc<Runtime>` (or a
//! piece of it) handed to them at construction. Tests build a fresh runtime
//! per case against a temp directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ConsumerConfig, DiskQueueConfig};
use crate::elastic::ElasticRegistry;
use crate::queue::{
    DirUploader, DiskQueueStore, EventBus, Offset, OffsetStore, QueueConfig, QueueEventKind,
    Reaper, Registry, Replicator, SegmentUploader, WatermarkStore,
};
use crate::stats::Stats;
use crate::Result;

pub struct Runtime {
    pub data_dir: PathBuf,
    pub registry: Registry,
    pub queues: Arc<DiskQueueStore>,
    pub offsets: OffsetStore,
    pub watermarks: WatermarkStore,
    pub elastic: ElasticRegistry,
    pub stats: Arc<Stats>,
    replicator: Option<Arc<Replicator>>,
}

impl Runtime {
    /// Open a runtime rooted at `data_dir`. When replication is enabled the
    /// default uploader mirrors segments under the configured server path.
    pub fn open(data_dir: impl AsRef<Path>, cfg: DiskQueueConfig) -> Result<Arc<Self>> {
        let uploader: Option<Arc<dyn SegmentUploader>> =
            if cfg.replication.enabled && !cfg.replication.server.is_empty() {
                Some(Arc::new(DirUploader::new(cfg.replication.server.clone())))
            } else {
                None
            };
        Self::open_with_uploader(data_dir, cfg, uploader)
    }

    pub fn open_with_uploader(
        data_dir: impl AsRef<Path>,
        cfg: DiskQueueConfig,
        uploader: Option<Arc<dyn SegmentUploader>>,
    ) -> Result<Arc<Self>> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let events = Arc::new(EventBus::new());
        let stats = Arc::new(Stats::new());

        let queues = Arc::new(DiskQueueStore::open(
            &data_dir,
            cfg.clone(),
            Arc::clone(&events),
            Arc::clone(&stats),
        )?);
        let registry = Registry::open(&data_dir)?;
        registry.on_change(|registry| {
            if let Err(err) = registry.persist() {
                log::error!("queue registry persist failed: {err}");
            }
        });
        let offsets = OffsetStore::open(&data_dir)?;
        let watermarks = WatermarkStore::open(&data_dir)?;

        let replicator = match (cfg.replication.enabled, uploader) {
            (true, Some(uploader)) => Some(Arc::new(Replicator::new(
                cfg.replication.clone(),
                uploader,
                watermarks.clone(),
            ))),
            (true, None) => {
                log::error!("replication enabled but no upload destination configured");
                None
            }
            _ => None,
        };

        let reaper = Arc::new(Reaper::new(
            cfg.retention.clone(),
            replicator.is_some(),
            Arc::downgrade(&queues),
            offsets.clone(),
            watermarks.clone(),
        ));

        {
            let reaper = Arc::clone(&reaper);
            let replicator = replicator.clone();
            let store = Arc::downgrade(&queues);
            events.subscribe(move |event| {
                if event.kind == QueueEventKind::WriteComplete {
                    if let (Some(replicator), Some(store)) = (&replicator, store.upgrade()) {
                        let dir = store.queue_dir(&event.queue);
                        if let Err(err) =
                            replicator.on_write_complete(&event.queue, event.segment, &dir)
                        {
                            log::error!(
                                "replication of queue [{}] segment {} failed: {err}",
                                event.queue,
                                event.segment
                            );
                        }
                    }
                }
                reaper.handle(event);
            });
        }

        Ok(Arc::new(Self {
            data_dir,
            registry,
            queues,
            offsets,
            watermarks,
            elastic: ElasticRegistry::new(),
            stats,
            replicator,
        }))
    }

    /// Boot-time work: resume replication from the watermark for every
    /// registered queue.
    pub fn start(&self) -> Result<()> {
        let Some(replicator) = &self.replicator else {
            return Ok(());
        };
        for cfg in self.registry.all() {
            let dir = self.queues.queue_dir(&cfg.id);
            if !dir.exists() {
                continue;
            }
            let write_segment = self.queues.writer_segment(&cfg.id)?;
            replicator.catch_up(&cfg.id, &dir, write_segment)?;
        }
        Ok(())
    }

    /// Flush writers and persist the registry. Called after the pipeline
    /// runtime has quiesced.
    pub fn close(&self) -> Result<()> {
        self.queues.flush_all()?;
        self.registry.persist()
    }

    /// Append to a queue by name, registering it on first use.
    pub fn push(&self, queue_name: &str, data: &[u8]) -> Result<Offset> {
        let cfg = self.registry.get_or_init(queue_name);
        self.queues.append(&cfg.id, data)
    }

    /// Whether any consumer group of the queue still has messages ahead.
    pub fn has_lag(&self, cfg: &QueueConfig) -> bool {
        let latest = match self.queues.latest_offset(&cfg.id) {
            Ok(offset) => offset,
            Err(_) => return false,
        };
        let earliest = match self.queues.earliest_offset(&cfg.id) {
            Ok(offset) => offset,
            Err(_) => return false,
        };
        self.offsets
            .queue_has_lag(&cfg.id, latest, earliest)
            .unwrap_or(false)
    }

    /// Consumer config for `(queue, group, name)`. Registers the group with
    /// the offset store so retention respects it before its first commit;
    /// processors overlay their own fetch tuning on the returned defaults.
    pub fn get_or_init_consumer_config(
        &self,
        queue_id: &str,
        group: &str,
        name: &str,
    ) -> ConsumerConfig {
        if let Err(err) = self.offsets.init(queue_id, group, name) {
            log::error!("offset init for [{queue_id}|{group}|{name}] failed: {err}");
        }
        ConsumerConfig {
            group: group.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }
}
