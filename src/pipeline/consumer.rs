//! Queue consumer processor.
//!
//! Drains every queue matched by its selector through an inner processor
//! chain, one worker per `(queue, slice)`. Slicing partitions messages by
//! `xxh32(_id) mod N` so N workers can share one queue without reordering
//! any single document's updates. Offsets commit only after the inner chain
//! has accepted the batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh32::xxh32;

use crate::config::ConsumerConfig;
use crate::elastic::first_action_id;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::{Processor, ProcessorChain};
use crate::queue::{FetchContext, Message, Offset, QueueConfig, QueueSelector};
use crate::runtime::Runtime;
use crate::Error;

const WAITING_AFTER_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerProcessorConfig {
    pub num_of_slices: usize,
    /// Explicit slice whitelist; empty means all slices.
    pub slices: Vec<usize>,
    pub idle_timeout_in_seconds: u64,
    pub max_workers: usize,
    pub queue_selector: QueueSelector,
    pub consumer: ConsumerConfig,
    pub detect_active_queue: bool,
    pub detect_interval_in_ms: u64,
    pub quit_detect_after_idle_in_ms: u64,
    pub skip_empty_queue: bool,
    pub quit_on_eof_queue: bool,
    pub waiting_after: Vec<String>,
    pub retry_delay_interval_in_ms: u64,
}

impl Default for ConsumerProcessorConfig {
    fn default() -> Self {
        Self {
            num_of_slices: 1,
            slices: Vec::new(),
            idle_timeout_in_seconds: 5,
            max_workers: 10,
            queue_selector: QueueSelector::default(),
            consumer: ConsumerConfig::default(),
            detect_active_queue: true,
            detect_interval_in_ms: 5000,
            quit_detect_after_idle_in_ms: 30_000,
            skip_empty_queue: true,
            quit_on_eof_queue: true,
            waiting_after: Vec::new(),
            retry_delay_interval_in_ms: 5000,
        }
    }
}

pub struct QueueConsumerProcessor {
    id: String,
    config: ConsumerProcessorConfig,
    runtime: Arc<Runtime>,
    chain: Arc<ProcessorChain>,
    in_flight: Mutex<HashMap<String, String>>,
    detector_running: AtomicBool,
}

impl QueueConsumerProcessor {
    pub fn new(
        mut config: ConsumerProcessorConfig,
        runtime: Arc<Runtime>,
        chain: ProcessorChain,
    ) -> Self {
        if config.num_of_slices == 0 {
            config.num_of_slices = 1;
        }
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            runtime,
            chain: Arc::new(chain),
            in_flight: Mutex::new(HashMap::new()),
            detector_running: AtomicBool::new(false),
        }
    }

    fn failed_slices_key(queue: &QueueConfig) -> String {
        format!("{}FAILED_SLICES", queue.id)
    }

    /// Slice a message belongs to: hash of the bulk `_id`, or its byte
    /// offset when the meta line carries no id.
    pub fn slice_for_message(message: &Message, num_of_slices: usize) -> usize {
        match first_action_id(&message.data) {
            Some(id) if !id.is_empty() => xxh32(id.as_bytes(), 0) as usize % num_of_slices,
            _ => (message.offset.position.unsigned_abs() % num_of_slices as u64) as usize,
        }
    }

    fn detector<'scope, 'env>(
        &'scope self,
        scope: &'scope std::thread::Scope<'scope, 'env>,
        ctx: &'scope PipelineContext,
    ) {
        log::debug!("detector for consumer processor [{}] started", self.id);
        let mut last_dispatch = Instant::now();

        loop {
            if ctx.is_canceled() {
                return;
            }

            let cfgs = self
                .runtime
                .registry
                .get_by_selector(&self.config.queue_selector);
            log::trace!("detector matched {} queues", cfgs.len());

            for cfg in cfgs {
                if ctx.is_canceled() {
                    return;
                }
                if !self.config.skip_empty_queue || self.runtime.has_lag(&cfg) {
                    let key_prefix = format!("{}-", cfg.id);
                    let already_running = {
                        let in_flight = self.in_flight.lock().expect("in-flight lock");
                        in_flight.keys().any(|k| k.starts_with(&key_prefix))
                    };
                    if !already_running {
                        log::trace!("detector dispatching queue [{}]", cfg.name);
                        last_dispatch = Instant::now();
                        self.handle_queue_config(scope, ctx, &cfg);
                    }
                }
            }

            if self.config.detect_interval_in_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.config.detect_interval_in_ms));
            }

            if last_dispatch.elapsed()
                > Duration::from_millis(self.config.quit_detect_after_idle_in_ms)
            {
                let inflight = self.in_flight.lock().expect("in-flight lock").len();
                if inflight == 0 {
                    log::debug!(
                        "detector idle for {}ms, exiting",
                        self.config.quit_detect_after_idle_in_ms
                    );
                    return;
                }
            }
        }
    }

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

        let failed_key = Self::failed_slices_key(queue);
        if ctx.stat(&failed_key) >= self.config.num_of_slices as i64 {
            log::debug!("all slices failed for queue [{}], skip", queue.name);
            return;
        }

        for slice_id in 0..self.config.num_of_slices {
            if !self.config.slices.is_empty() && !self.config.slices.contains(&slice_id) {
                log::debug!("skipping slice_id {slice_id}");
                continue;
            }

            if self.config.max_workers > 0
                && self.in_flight.lock().expect("in-flight lock").len() > self.config.max_workers
            {
                log::debug!(
                    "reached max workers, skip queue [{}] slice {}",
                    queue.name,
                    slice_id
                );
                return;
            }

            let key = format!("{}-{}", queue.id, slice_id);
            {
                let mut in_flight = self.in_flight.lock().expect("in-flight lock");
                if in_flight.contains_key(&key) {
                    log::debug!("queue [{}] slice {} already has a worker", queue.id, slice_id);
                    continue;
                }
                let worker_id = uuid::Uuid::new_v4().to_string();
                in_flight.insert(key.clone(), worker_id.clone());

                let queue = queue.clone();
                scope.spawn(move || {
                    self.run_slice_worker(ctx, queue, worker_id, key, slice_id);
                });
            }
        }
    }

    fn run_slice_worker(
        &self,
        parent: &PipelineContext,
        queue: QueueConfig,
        worker_id: String,
        key: String,
        slice_id: usize,
    ) {
        log::debug!(
            "starting worker [{}], queue [{}], slice_id {}",
            worker_id,
            queue.name,
            slice_id
        );

        let outcome = self.slice_worker_loop(parent, &queue, slice_id);

        if let Err(failure) = outcome {
            log::error!(
                "worker [{}], queue [{}], slice {}, offset window [{}]->[{}]: {}",
                worker_id,
                queue.id,
                slice_id,
                failure.init_offset,
                failure.last_offset,
                failure.error
            );
            parent.record_error(format!(
                "queue [{}] slice {} failed between [{}] and [{}]: {}",
                queue.id, slice_id, failure.init_offset, failure.last_offset, failure.error
            ));
            parent.increment(&Self::failed_slices_key(&queue), 1);
        }

        self.in_flight.lock().expect("in-flight lock").remove(&key);
        log::trace!("exit slice worker, queue [{}], slice {}", queue.id, slice_id);
    }

    fn slice_worker_loop(
        &self,
        parent: &PipelineContext,
        queue: &QueueConfig,
        slice_id: usize,
    ) -> std::result::Result<(), WorkerFailure> {
        let max_slices = self.config.num_of_slices;
        let group_name = if max_slices > 1 {
            format!("{}-{}", self.config.consumer.group, slice_id)
        } else {
            self.config.consumer.group.clone()
        };

        let mut consumer_cfg = self.runtime.get_or_init_consumer_config(
            &queue.id,
            &group_name,
            &self.config.consumer.name,
        );
        consumer_cfg.merge(&self.config.consumer);

        let init_offset = self
            .runtime
            .offsets
            .get(&queue.id, &group_name, &consumer_cfg.name)
            .map_err(|err| WorkerFailure::at(Offset::default(), Offset::default(), err))?;
        let mut committed = init_offset;
        let mut offset = init_offset;

        let fail = |last: Offset, err: Error| WorkerFailure::at(init_offset, last, err);

        let mut consumer = self
            .runtime
            .queues
            .acquire_consumer(&queue.id, &consumer_cfg, init_offset)
            .map_err(|err| fail(init_offset, err))?;

        let mut fctx = FetchContext::default();
        let idle = Duration::from_secs(self.config.idle_timeout_in_seconds.max(1));
        let mut last_commit = Instant::now();

        loop {
            if parent.is_canceled() || parent.is_failed() {
                break;
            }

            if self.wait_for_upstreams(parent, queue) {
                continue;
            }

            let messages = match consumer.fetch(&mut fctx) {
                Ok(messages) => messages,
                Err(Error::Eof) => break,
                // Transient I/O backs off without giving up the slice.
                Err(err) if err.is_transient() => {
                    log::warn!(
                        "queue [{}] slice {}: {err}, retrying in {}ms",
                        queue.id,
                        slice_id,
                        self.config.retry_delay_interval_in_ms
                    );
                    std::thread::sleep(Duration::from_millis(
                        self.config.retry_delay_interval_in_ms,
                    ));
                    continue;
                }
                Err(err) => {
                    self.commit(queue, &group_name, &consumer_cfg.name, &mut committed, offset)
                        .map_err(|err| fail(offset, err))?;
                    return Err(fail(offset, err));
                }
            };

            let empty_fetch = messages.is_empty();
            let retained: Vec<Message> = if max_slices > 1 {
                messages
                    .into_iter()
                    .filter(|m| Self::slice_for_message(m, max_slices) == slice_id)
                    .collect()
            } else {
                messages
            };

            if !retained.is_empty() {
                let wctx = PipelineContext::new();
                wctx.set_init_offset(fctx.init_offset);
                wctx.set_next_offset(fctx.next_offset);
                wctx.put_messages(retained);
                self.chain
                    .process(&wctx)
                    .map_err(|err| fail(offset, Error::Unsupported("processor failed"))
                        .with_message(format!("{err:#}")))?;
            }

            // The batch was accepted: reading may continue past it.
            offset = fctx.next_offset;

            if last_commit.elapsed() > idle || empty_fetch {
                self.commit(queue, &group_name, &consumer_cfg.name, &mut committed, offset)
                    .map_err(|err| fail(offset, err))?;
                last_commit = Instant::now();

                if empty_fetch && self.config.quit_on_eof_queue {
                    log::trace!("queue [{}] drained, slice {} exiting", queue.name, slice_id);
                    break;
                }
            }
        }

        self.commit(queue, &group_name, &consumer_cfg.name, &mut committed, offset)
            .map_err(|err| fail(offset, err))?;
        Ok(())
    }

    /// `waiting_after` queues must be empty before this processor runs.
    /// Returns true when the caller should re-check from the top.
    fn wait_for_upstreams(&self, parent: &PipelineContext, queue: &QueueConfig) -> bool {
        for name in &self.config.waiting_after {
            if parent.is_canceled() {
                return false;
            }
            let upstream = self.runtime.registry.get_or_init(name);
            if self.runtime.has_lag(&upstream) {
                log::warn!(
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

    fn commit(
        &self,
        queue: &QueueConfig,
        group: &str,
        name: &str,
        committed: &mut Offset,
        offset: Offset,
    ) -> crate::Result<()> {
        if offset == *committed {
            return Ok(());
        }
        self.runtime.offsets.commit(&queue.id, group, name, offset)?;
        *committed = offset;
        Ok(())
    }
}

struct WorkerFailure {
    init_offset: Offset,
    last_offset: Offset,
    error: String,
}

impl WorkerFailure {
    fn at(init_offset: Offset, last_offset: Offset, error: Error) -> Self {
        Self {
            init_offset,
            last_offset,
            error: error.to_string(),
        }
    }

    fn with_message(mut self, message: String) -> Self {
        self.error = message;
        self
    }
}

impl Processor for QueueConsumerProcessor {
    fn name(&self) -> &str {
        "consumer"
    }

    fn process(&self, ctx: &PipelineContext) -> anyhow::Result<()> {
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
        // Worker failures are surfaced through the context error stack and
        // the per-queue FAILED_SLICES counters, not as a processor error.
        Ok(())
    }

    fn release(&self) {
        self.chain.release();
    }
}
