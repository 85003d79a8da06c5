//! Bulk indexing sink.
//!
//! Drains queues whose labels point at an Elasticsearch cluster and replays
//! their messages as batched `_bulk` requests. The destination host follows
//! the queue's routing labels (node, or the primary of an index shard) and
//! falls back to any active host of the cluster. Offsets advance only after
//! a batch is fully accounted for: indexed, re-enqueued, or dead-lettered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::ConsumerConfig;
use crate::elastic::bulk::{
    walk_bulk_request, BufferPool, BulkBuffer, BulkProcessor, BulkProcessorConfig, BulkStats,
};
use crate::elastic::metadata::ElasticsearchMetadata;
use crate::pipeline::{PipelineContext, Processor};
use crate::queue::{FetchContext, Offset, QueueConfig, QueueSelector};
use crate::runtime::Runtime;
use crate::{Error, Result};

const DEAD_HOST_PROBE_DELAY: Duration = Duration::from_secs(1);
const WAITING_AFTER_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkIndexingConfig {
    pub max_workers: usize,
    pub idle_timeout_in_seconds: u64,
    pub detect_active_queue: bool,
    pub detect_interval_in_ms: u64,
    pub valid_request: bool,
    pub skip_empty_queue: bool,
    pub skip_info_missing: bool,
    pub queue_selector: QueueSelector,
    pub consumer: ConsumerConfig,
    pub bulk: BulkConfigDefaults,
    /// Fallback cluster id when a queue has no `elasticsearch` label.
    pub elasticsearch: String,
    pub waiting_after: Vec<String>,
}

/// Serializable subset of the bulk processor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfigDefaults {
    pub bulk_size_in_bytes: usize,
    pub bulk_max_docs_count: usize,
    pub max_retry_times: usize,
    pub retry_delay_in_ms: u64,
    pub dead_letter_queue: String,
}

impl Default for BulkConfigDefaults {
    fn default() -> Self {
        let cfg = BulkProcessorConfig::default();
        Self {
            bulk_size_in_bytes: cfg.bulk_size_in_bytes,
            bulk_max_docs_count: cfg.bulk_max_docs_count,
            max_retry_times: cfg.max_retry_times,
            retry_delay_in_ms: cfg.retry_delay_in_ms,
            dead_letter_queue: cfg.dead_letter_queue,
        }
    }
}

impl Default for BulkIndexingConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            idle_timeout_in_seconds: 5,
            detect_active_queue: true,
            detect_interval_in_ms: 10_000,
            valid_request: false,
            skip_empty_queue: true,
            skip_info_missing: false,
            queue_selector: QueueSelector::default(),
            consumer: ConsumerConfig {
                fetch_max_messages: 100,
                ..Default::default()
            },
            bulk: BulkConfigDefaults::default(),
            elasticsearch: String::new(),
            waiting_after: Vec::new(),
        }
    }
}

pub struct BulkIndexingProcessor {
    id: String,
    config: BulkIndexingConfig,
    runtime: Arc<Runtime>,
    buffers: BufferPool,
    in_flight: Mutex<HashMap<String, String>>,
    detector_running: AtomicBool,
    worker_failed: AtomicBool,
}

impl BulkIndexingProcessor {
    pub fn new(config: BulkIndexingConfig, runtime: Arc<Runtime>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            runtime,
            buffers: BufferPool::new(),
            in_flight: Mutex::new(HashMap::new()),
            detector_running: AtomicBool::new(false),
            worker_failed: AtomicBool::new(false),
        }
    }

    fn cluster_for_queue(&self, queue: &QueueConfig) -> Option<String> {
        match queue.elasticsearch() {
            Some(cluster) => Some(cluster.to_string()),
            None if !self.config.elasticsearch.is_empty() => {
                Some(self.config.elasticsearch.clone())
            }
            None => {
                log::error!("label [elasticsearch] was not found on queue [{}]", queue.name);
                None
            }
        }
    }

    /// Resolve the preferred host from the queue's routing labels, then
    /// dispatch a worker for the queue.
    fn handle_queue_config<'scope, 'env>(
        &'scope self,
        scope: &'scope std::thread::Scope<'scope, 'env>,
        ctx: &'scope PipelineContext,
        queue: &QueueConfig,
    ) {
        if self.config.skip_empty_queue && !self.runtime.has_lag(queue) {
            log::trace!("skip empty queue [{}]", queue.name);
            return;
        }

        let Some(cluster) = self.cluster_for_queue(queue) else {
            return;
        };
        let Some(meta) = self.runtime.elastic.metadata(&cluster) else {
            log::debug!("metadata for [{cluster}] is nil");
            return;
        };

        match queue.level() {
            Some("node") => {
                if let Some(node_id) = queue.node_id() {
                    if let Some(host) = meta.node_publish_host(node_id) {
                        self.spawn_worker(scope, ctx, queue, cluster, host);
                        return;
                    }
                    log::debug!("node info not found: {node_id}");
                } else {
                    log::debug!("node_id not found on queue [{}]", queue.name);
                }
                if self.config.skip_info_missing {
                    return;
                }
            }
            Some("shard") | Some("partition") => {
                if let (Some(index), Some(shard)) = (queue.index(), queue.shard()) {
                    if let Some(node) = meta.primary_shard_node(index, shard) {
                        if let Some(host) = meta.node_publish_host(&node) {
                            self.spawn_worker(scope, ctx, queue, cluster, host);
                            return;
                        }
                        log::debug!("node info not found: {node}");
                    } else {
                        log::debug!(
                            "routing table not found for [{index}] shard [{shard}]"
                        );
                    }
                } else {
                    log::debug!("index/shard labels incomplete on queue [{}]", queue.name);
                }
                if self.config.skip_info_missing {
                    return;
                }
            }
            _ => {}
        }

        match self.runtime.elastic.hosts.active_host(&meta) {
            Ok(host) => {
                log::debug!("random choose node [{host}] to consume queue [{}]", queue.id);
                self.spawn_worker(scope, ctx, queue, cluster, host);
            }
            Err(err) => log::warn!("no active host for cluster [{cluster}]: {err}"),
        }
    }

    fn spawn_worker<'scope, 'env>(
        &'scope self,
        scope: &'scope std::thread::Scope<'scope, 'env>,
        ctx: &'scope PipelineContext,
        queue: &QueueConfig,
        cluster: String,
        host: String,
    ) {
        if self.config.max_workers > 0
            && self.in_flight.lock().expect("in-flight lock").len() > self.config.max_workers
        {
            log::debug!("reached max workers, skip queue [{}]", queue.name);
            return;
        }

        // One bulk worker per queue.
        let key = queue.id.clone();
        let mut in_flight = self.in_flight.lock().expect("in-flight lock");
        if in_flight.contains_key(&key) {
            log::debug!("queue [{}] already has a bulk worker", queue.id);
            return;
        }
        let worker_id = uuid::Uuid::new_v4().to_string();
        in_flight.insert(key.clone(), worker_id.clone());

        let queue = queue.clone();
        scope.spawn(move || {
            log::debug!(
                "starting bulk worker [{}], queue [{}], host [{}]",
                worker_id,
                queue.name,
                host
            );
            let result = self.bulk_worker(ctx, &queue, &cluster, host);
            if let Err(err) = result {
                log::error!(
                    "error in bulk worker [{}], queue [{}]: {}",
                    worker_id,
                    queue.id,
                    err
                );
                ctx.record_error(format!("bulk worker on queue [{}]: {err}", queue.id));
                self.worker_failed.store(true, Ordering::SeqCst);
            }
            self.in_flight.lock().expect("in-flight lock").remove(&key);
        });
    }

    fn bulk_worker(
        &self,
        parent: &PipelineContext,
        queue: &QueueConfig,
        cluster: &str,
        mut host: String,
    ) -> Result<()> {
        let meta = self
            .runtime
            .elastic
            .metadata(cluster)
            .ok_or_else(|| Error::MetadataNotReady(cluster.to_string()))?;

        if self.runtime.elastic.hosts.is_dead(&host) {
            host = self.runtime.elastic.hosts.active_host(&meta)?;
        }

        let mut bulk_cfg = BulkProcessorConfig {
            bulk_size_in_bytes: self.config.bulk.bulk_size_in_bytes,
            bulk_max_docs_count: self.config.bulk.bulk_max_docs_count,
            max_retry_times: self.config.bulk.max_retry_times,
            retry_delay_in_ms: self.config.bulk.retry_delay_in_ms,
            dead_letter_queue: self.config.bulk.dead_letter_queue.clone(),
        };
        if bulk_cfg.dead_letter_queue.is_empty() {
            bulk_cfg.dead_letter_queue = format!("{cluster}-bulk-dead_letter-items");
        }
        let bulk = BulkProcessor::new(bulk_cfg);

        let mut consumer_cfg = self.runtime.get_or_init_consumer_config(
            &queue.id,
            &self.config.consumer.group,
            &self.config.consumer.name,
        );
        consumer_cfg.merge(&self.config.consumer);

        let init_offset =
            self.runtime
                .offsets
                .get(&queue.id, &consumer_cfg.group, &consumer_cfg.name)?;
        let mut committed = init_offset;
        let mut offset = init_offset;

        let mut consumer = self
            .runtime
            .queues
            .acquire_consumer(&queue.id, &consumer_cfg, init_offset)?;
        let mut fctx = FetchContext::default();

        let mut buf = self.buffers.acquire(&queue.id);
        let idle = Duration::from_secs(self.config.idle_timeout_in_seconds.max(1));
        let mut last_commit = Instant::now();

        let result = loop {
            if parent.is_canceled() {
                break Ok(());
            }

            if !self.runtime.elastic.hosts.is_available(&host) {
                if self.runtime.elastic.hosts.is_dead(&host) {
                    let previous = host.clone();
                    host = self.runtime.elastic.hosts.active_host(&meta)?;
                    log::info!("host [{previous}] is dead, use: [{host}]");
                } else {
                    std::thread::sleep(DEAD_HOST_PROBE_DELAY);
                }
                continue;
            }

            if self.wait_for_upstreams(parent, queue) {
                continue;
            }

            let (messages, timed_out) = match consumer.fetch_wait(&mut fctx) {
                Ok(result) => result,
                Err(Error::Eof) => break Ok(()),
                Err(err) => break Err(err),
            };

            let mut aborted = None;
            for message in &messages {
                if self.config.valid_request {
                    match walk_bulk_request(&message.data) {
                        Err(err) => log::warn!(
                            "invalid bulk body at {} in queue [{}]: {err}",
                            message.offset,
                            queue.id
                        ),
                        Ok(docs) => {
                            let caps = meta.caps();
                            if !caps.supports_doc_type()
                                && docs.iter().any(|d| d.doc_type.is_some())
                            {
                                log::warn!(
                                    "bulk body at {} carries _type, which cluster [{}] no longer accepts",
                                    message.offset,
                                    meta.config.id
                                );
                            }
                            if caps.requires_doc_type()
                                && docs.iter().any(|d| d.doc_type.is_none())
                            {
                                log::warn!(
                                    "bulk body at {} is missing _type, which cluster [{}] requires",
                                    message.offset,
                                    meta.config.id
                                );
                            }
                        }
                    }
                }

                buf.write_message_id(message.offset.to_string());
                buf.write_bytes(&message.data);

                let over_size = buf.message_size() > bulk.config.bulk_size_in_bytes;
                let over_count = bulk.config.bulk_max_docs_count > 0
                    && buf.message_count() > bulk.config.bulk_max_docs_count;
                if over_size || over_count {
                    log::trace!(
                        "queue [{}] hit buffer limit (size {}, count {}), submitting",
                        queue.name,
                        buf.message_size(),
                        buf.message_count()
                    );
                    match self.submit(parent, &bulk, &meta, &host, &mut buf, &queue.id) {
                        Ok(_) => {
                            offset = message.next_offset;
                            self.commit(queue, &consumer_cfg, &mut committed, offset)?;
                        }
                        Err(err) => {
                            aborted = Some(err);
                            break;
                        }
                    }
                }
            }
            if let Some(err) = aborted {
                break Err(err);
            }
            offset = fctx.next_offset;

            let flush_idle = last_commit.elapsed() > idle && buf.message_size() > 0;
            if flush_idle || timed_out {
                match self.submit(parent, &bulk, &meta, &host, &mut buf, &queue.id) {
                    Ok(_) => {
                        self.commit(queue, &consumer_cfg, &mut committed, offset)?;
                        last_commit = Instant::now();
                    }
                    Err(err) => break Err(err),
                }
                if timed_out && messages.is_empty() {
                    // Nothing new inside the wait budget: let the detector
                    // re-dispatch when the queue has lag again.
                    break Ok(());
                }
            }
        };

        // Flush whatever is buffered before leaving, even on the error path:
        // the batch must reach a durable place or the offset must stay put.
        let final_flush = self.submit(parent, &bulk, &meta, &host, &mut buf, &queue.id);
        match (&result, final_flush) {
            (Ok(()), Ok(_)) => {
                self.commit(queue, &consumer_cfg, &mut committed, offset)?;
            }
            (Ok(()), Err(err)) => {
                log::error!(
                    "error between queue [{}] offset [{}]-[{}]",
                    queue.id,
                    init_offset,
                    offset
                );
                self.buffers.release(buf);
                return Err(err);
            }
            (Err(_), _) => {}
        }
        self.buffers.release(buf);
        result
    }

    /// Submit the buffer, pausing on 429 until it goes through or the
    /// pipeline is canceled. A non-throttle refusal is a hard error.
    fn submit(
        &self,
        parent: &PipelineContext,
        bulk: &BulkProcessor,
        meta: &ElasticsearchMetadata,
        host: &str,
        buf: &mut BulkBuffer,
        queue_id: &str,
    ) -> Result<BulkStats> {
        loop {
            if buf.message_count() == 0 {
                return Ok(BulkStats::default());
            }
            let start = Instant::now();
            let outcome = bulk.bulk(
                meta,
                &self.runtime.elastic.hosts,
                &self.runtime.elastic.limiters,
                &self.runtime.queues,
                host,
                buf,
            );
            self.runtime.stats.increment_by(
                &format!("elasticsearch.{}.bulk", meta.config.id),
                "elapsed_ms",
                start.elapsed().as_millis() as i64,
            );

            if outcome.continue_next {
                let queue = buf.queue.clone();
                buf.reset();
                buf.queue = queue;
                return Ok(outcome.stats);
            }
            if outcome.throttled && !parent.is_canceled() {
                log::debug!(
                    "bulk throttled on queue [{queue_id}], keeping batch and backing off"
                );
                std::thread::sleep(Duration::from_millis(bulk.config.retry_delay_in_ms));
                continue;
            }
            return Err(outcome.error.unwrap_or(Error::Unsupported(
                "bulk submission refused without a cause",
            )));
        }
    }

    fn commit(
        &self,
        queue: &QueueConfig,
        consumer_cfg: &ConsumerConfig,
        committed: &mut Offset,
        offset: Offset,
    ) -> Result<()> {
        if offset == *committed {
            return Ok(());
        }
        self.runtime
            .offsets
            .commit(&queue.id, &consumer_cfg.group, &consumer_cfg.name, offset)?;
        *committed = offset;
        Ok(())
    }

    fn wait_for_upstreams(&self, parent: &PipelineContext, queue: &QueueConfig) -> bool {
        for name in &self.config.waiting_after {
            if parent.is_canceled() {
                return false;
            }
            let upstream = self.runtime.registry.get_or_init(name);
            if self.runtime.has_lag(&upstream) {
                log::trace!(
                    "[{}] has pending messages, draining it before [{}]",
                    upstream.name,
                    queue.name
                );
                std::thread::sleep(WAITING_AFTER_DELAY);
                return true;
            }
        }
        false
    }

    fn detector<'scope, 'env>(
        &'scope self,
        scope: &'scope std::thread::Scope<'scope, 'env>,
        ctx: &'scope PipelineContext,
    ) {
        log::debug!("detector for bulk indexing [{}] started", self.id);
        loop {
            if ctx.is_canceled() {
                return;
            }
            let cfgs = self
                .runtime
                .registry
                .get_by_selector(&self.config.queue_selector);
            for cfg in cfgs {
                if ctx.is_canceled() {
                    return;
                }
                if self.runtime.has_lag(&cfg) {
                    let busy = self
                        .in_flight
                        .lock()
                        .expect("in-flight lock")
                        .contains_key(&cfg.id);
                    if !busy {
                        log::trace!("detecting new queue [{}]", cfg.name);
                        self.handle_queue_config(scope, ctx, &cfg);
                    }
                }
            }
            if self.config.detect_interval_in_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.config.detect_interval_in_ms));
            }
        }
    }
}

impl Processor for BulkIndexingProcessor {
    fn name(&self) -> &str {
        "bulk_indexing"
    }

    fn process(&self, ctx: &PipelineContext) -> anyhow::Result<()> {
        self.worker_failed.store(false, Ordering::SeqCst);
        std::thread::scope(|scope| {
            if self.config.detect_active_queue {
                if !self.detector_running.swap(true, Ordering::SeqCst) {
                    scope.spawn(move || {
                        self.detector(scope, ctx);
                        self.detector_running.store(false, Ordering::SeqCst);
                    });
                }
            } else {
                let cfgs = self
                    .runtime
                    .registry
                    .get_by_selector(&self.config.queue_selector);
                log::debug!("selector matched {} queues", cfgs.len());
                for cfg in cfgs {
                    self.handle_queue_config(scope, ctx, &cfg);
                }
            }
        });
        if self.worker_failed.load(Ordering::SeqCst) {
            anyhow::bail!("bulk indexing worker failed; offsets were preserved");
        }
        Ok(())
    }
}
