//! Bulk request assembly, submission and per-item result handling.
//!
//! Queue messages are already newline-framed bulk bodies; the buffer
//! concatenates them per destination host. After a 2xx with per-item errors
//! the walker re-pairs response items with request docs so retriable ones go
//! back onto the source queue and permanent rejects land in the dead-letter
//! queue. Only then may the caller advance its offset.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::elastic::hosts::HostTable;
use crate::elastic::metadata::ElasticsearchMetadata;
use crate::elastic::rate::RateLimiterRegistry;
use crate::queue::DiskQueueStore;
use crate::{Error, Result};

const THROTTLE_QUANTUM: Duration = Duration::from_millis(10);
const DEFAULT_MAX_WAIT_IN_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct BulkProcessorConfig {
    pub bulk_size_in_bytes: usize,
    pub bulk_max_docs_count: usize,
    pub max_retry_times: usize,
    pub retry_delay_in_ms: u64,
    pub dead_letter_queue: String,
}

impl Default for BulkProcessorConfig {
    fn default() -> Self {
        Self {
            bulk_size_in_bytes: 10 * 1024 * 1024,
            bulk_max_docs_count: 1000,
            max_retry_times: 3,
            retry_delay_in_ms: 1000,
            dead_letter_queue: String::new(),
        }
    }
}

// ============================================================================
// Bulk buffer
// ============================================================================

/// Accumulates whole queue messages (bulk body fragments) plus their offsets
/// until a flush threshold trips.
#[derive(Default)]
pub struct BulkBuffer {
    pub queue: String,
    bytes: Vec<u8>,
    message_ids: Vec<String>,
}

impl BulkBuffer {
    pub fn write_message_id(&mut self, id: impl Into<String>) {
        self.message_ids.push(id.into());
    }

    /// Append one message, keeping the NDJSON framing intact.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
        if !data.ends_with(b"\n") {
            self.bytes.push(b'\n');
        }
    }

    pub fn message_count(&self) -> usize {
        self.message_ids.len()
    }

    pub fn message_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn message_ids(&self) -> &[String] {
        &self.message_ids
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.bytes.clear();
        self.message_ids.clear();
    }
}

/// Reuse buffers across batches; bulk bodies are large enough that the
/// allocations are worth keeping.
#[derive(Default)]
pub struct BufferPool {
    inner: Mutex<Vec<BulkBuffer>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, queue: &str) -> BulkBuffer {
        let mut buf = self
            .inner
            .lock()
            .expect("buffer pool lock")
            .pop()
            .unwrap_or_default();
        buf.queue = queue.to_string();
        buf
    }

    pub fn release(&self, mut buf: BulkBuffer) {
        buf.reset();
        self.inner.lock().expect("buffer pool lock").push(buf);
    }
}

// ============================================================================
// Request walking
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    Index,
    Create,
    Update,
    Delete,
}

impl BulkAction {
    fn from_key(key: &str) -> Option<Self> {
        match key {
            "index" => Some(Self::Index),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One action of a bulk body: the raw meta line, the raw payload line (absent
/// for deletes) and the parsed routing fields.
#[derive(Debug, Clone)]
pub struct BulkDoc<'a> {
    pub action: BulkAction,
    pub meta: &'a [u8],
    pub payload: Option<&'a [u8]>,
    pub index: Option<String>,
    pub doc_type: Option<String>,
    pub id: Option<String>,
    pub routing: Option<String>,
}

impl BulkDoc<'_> {
    /// Re-frame the doc as a standalone bulk body.
    pub fn to_request_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.meta.len() + self.payload.map_or(0, |p| p.len()) + 2,
        );
        out.extend_from_slice(self.meta);
        out.push(b'\n');
        if let Some(payload) = self.payload {
            out.extend_from_slice(payload);
            out.push(b'\n');
        }
        out
    }
}

/// Walk an NDJSON bulk body into `(meta, payload?)` pairs.
pub fn walk_bulk_request(body: &[u8]) -> Result<Vec<BulkDoc<'_>>> {
    let mut docs = Vec::new();
    let mut lines = body.split(|&b| b == b'\n').filter(|line| !line.is_empty());

    while let Some(meta_line) = lines.next() {
        let value: serde_json::Value = serde_json::from_slice(meta_line)
            .map_err(|err| Error::InvalidBulkRequest(format!("meta line: {err}")))?;
        let object = value
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| {
                Error::InvalidBulkRequest("meta line is not a single-key object".to_string())
            })?;
        let (key, fields) = object.iter().next().expect("single key checked");
        let action = BulkAction::from_key(key).ok_or_else(|| {
            Error::InvalidBulkRequest(format!("unknown bulk action [{key}]"))
        })?;

        let get = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let payload = if action == BulkAction::Delete {
            None
        } else {
            Some(lines.next().ok_or_else(|| {
                Error::InvalidBulkRequest(format!(
                    "action [{}] is missing its payload line",
                    action.as_str()
                ))
            })?)
        };

        docs.push(BulkDoc {
            action,
            meta: meta_line,
            payload,
            index: get("_index"),
            doc_type: get("_type"),
            id: get("_id"),
            routing: get("routing"),
        });
    }

    Ok(docs)
}

/// `_id` of the first action in a bulk body; the slicing key.
pub fn first_action_id(body: &[u8]) -> Option<String> {
    let meta_line = body.split(|&b| b == b'\n').find(|line| !line.is_empty())?;
    let value: serde_json::Value = serde_json::from_slice(meta_line).ok()?;
    let object = value.as_object()?;
    let (_, fields) = object.iter().next()?;
    fields
        .get("_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Shape check used before submitting when `validate_request` is on.
pub fn validate_bulk_request(body: &[u8]) -> Result<()> {
    let docs = walk_bulk_request(body)?;
    if docs.is_empty() {
        return Err(Error::InvalidBulkRequest("empty bulk body".to_string()));
    }
    Ok(())
}

// ============================================================================
// Response classification
// ============================================================================

fn status_is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

fn status_is_retriable(status: u16) -> bool {
    status == 429 || status == 503
}

#[derive(Debug, Default, Clone)]
pub struct BulkClassification {
    pub success: Vec<usize>,
    pub retriable: Vec<usize>,
    pub permanent: Vec<usize>,
}

/// Pair response items with request docs by position and bucket them.
pub fn classify_bulk_response(
    body: &serde_json::Value,
    doc_count: usize,
) -> Result<BulkClassification> {
    let items = body
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::InvalidBulkResponse("missing items array".to_string()))?;
    if items.len() != doc_count {
        return Err(Error::InvalidBulkResponse(format!(
            "{} response items for {} request docs",
            items.len(),
            doc_count
        )));
    }

    let mut out = BulkClassification::default();
    for (i, item) in items.iter().enumerate() {
        let status = item
            .as_object()
            .and_then(|o| o.values().next())
            .and_then(|action| action.get("status"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                Error::InvalidBulkResponse(format!("item {i} has no status"))
            })? as u16;

        if status_is_success(status) {
            out.success.push(i);
        } else if status_is_retriable(status) {
            out.retriable.push(i);
        } else {
            out.permanent.push(i);
        }
    }
    Ok(out)
}

// ============================================================================
// Bulk processor
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct BulkStats {
    pub request_size: usize,
    pub message_count: usize,
    pub success_items: usize,
    pub retriable_items: usize,
    pub permanent_items: usize,
}

/// Result of one buffer submission. `continue_next == false` means the batch
/// is NOT accounted for and the caller must not advance its offset;
/// `throttled` distinguishes a 429 pause from a hard failure.
pub struct BulkOutcome {
    pub continue_next: bool,
    pub throttled: bool,
    pub stats: BulkStats,
    pub error: Option<Error>,
}

impl BulkOutcome {
    fn ok(stats: BulkStats) -> Self {
        Self {
            continue_next: true,
            throttled: false,
            stats,
            error: None,
        }
    }
}

pub struct BulkProcessor {
    pub config: BulkProcessorConfig,
}

impl BulkProcessor {
    pub fn new(config: BulkProcessorConfig) -> Self {
        Self { config }
    }

    /// Submit the buffer to `host`, classify the response, and route
    /// retriable/permanent rejects to durable queues.
    pub fn bulk(
        &self,
        meta: &ElasticsearchMetadata,
        hosts: &HostTable,
        limiters: &RateLimiterRegistry,
        queues: &DiskQueueStore,
        host: &str,
        buf: &BulkBuffer,
    ) -> BulkOutcome {
        let mut stats = BulkStats {
            request_size: buf.message_size(),
            message_count: buf.message_count(),
            ..Default::default()
        };
        if buf.message_count() == 0 {
            return BulkOutcome::ok(stats);
        }

        self.throttle(meta, limiters, buf.message_size());

        let mut host = host.to_string();
        let mut last_error: Option<Error> = None;
        let mut throttled = false;

        for attempt in 0..=self.config.max_retry_times {
            if attempt > 0 {
                std::thread::sleep(Duration::from_millis(
                    self.config.retry_delay_in_ms * attempt as u64,
                ));
                if hosts.is_dead(&host) {
                    if let Ok(active) = hosts.active_host(meta) {
                        host = active;
                    }
                }
            }

            let client = match hosts.client(&host, meta) {
                Ok(client) => client,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };

            let url = format!("http://{}{}", host, meta.caps().bulk_path());
            let response = client
                .post(&url)
                .header("content-type", "application/x-ndjson")
                .body(buf.as_slice().to_vec())
                .send();

            let response = match response {
                Ok(response) => response,
                Err(source) => {
                    hosts.mark_dead(&host, &source.to_string());
                    last_error = Some(Error::Http {
                        host: host.clone(),
                        source,
                    });
                    throttled = false;
                    continue;
                }
            };

            let status = response.status().as_u16();
            if status == 429 {
                log::debug!("host [{host}] rejected bulk with 429, backing off");
                throttled = true;
                last_error = None;
                continue;
            }
            if status >= 500 {
                log::warn!("host [{host}] returned {status} for bulk request");
                hosts.mark_dead(&host, &format!("status {status}"));
                throttled = false;
                last_error = None;
                continue;
            }
            if !status_is_success(status) {
                // 4xx at the request level: nothing per-item to salvage.
                return BulkOutcome {
                    continue_next: false,
                    throttled: false,
                    stats,
                    error: Some(Error::InvalidBulkResponse(format!(
                        "bulk request rejected with status {status}"
                    ))),
                };
            }

            hosts.mark_alive(&host);
            meta.record_success();

            let body: serde_json::Value = match response.json() {
                Ok(body) => body,
                Err(source) => {
                    return BulkOutcome {
                        continue_next: false,
                        throttled: false,
                        stats,
                        error: Some(Error::Http {
                            host: host.clone(),
                            source,
                        }),
                    };
                }
            };

            let has_errors = body.get("errors").and_then(|v| v.as_bool()).unwrap_or(false);
            if !has_errors {
                stats.success_items = buf.message_count();
                return BulkOutcome::ok(stats);
            }

            return match self.handle_partial_failure(&body, queues, buf, &mut stats) {
                Ok(()) => BulkOutcome::ok(stats),
                Err(err) => BulkOutcome {
                    continue_next: false,
                    throttled: false,
                    stats,
                    error: Some(err),
                },
            };
        }

        BulkOutcome {
            continue_next: false,
            throttled,
            stats,
            error: last_error,
        }
    }

    /// Re-enqueue retriable items to the source queue; dead-letter the rest.
    /// The batch counts as accounted for only when every reject landed on a
    /// durable queue.
    pub fn handle_partial_failure(
        &self,
        body: &serde_json::Value,
        queues: &DiskQueueStore,
        buf: &BulkBuffer,
        stats: &mut BulkStats,
    ) -> Result<()> {
        let docs = walk_bulk_request(buf.as_slice())?;
        let classification = classify_bulk_response(body, docs.len())?;

        stats.success_items = classification.success.len();
        stats.retriable_items = classification.retriable.len();
        stats.permanent_items = classification.permanent.len();

        for &i in &classification.retriable {
            queues.append(&buf.queue, &docs[i].to_request_bytes())?;
        }
        for &i in &classification.permanent {
            log::warn!(
                "dead-lettering doc {:?} from queue [{}]",
                docs[i].id,
                buf.queue
            );
            queues.append(&self.config.dead_letter_queue, &docs[i].to_request_bytes())?;
        }
        Ok(())
    }

    fn throttle(&self, meta: &ElasticsearchMetadata, limiters: &RateLimiterRegistry, size: usize) {
        let Some(tc) = meta.config.traffic_control.as_ref() else {
            return;
        };
        let max_wait = if tc.max_wait_time_in_ms > 0 {
            tc.max_wait_time_in_ms
        } else {
            DEFAULT_MAX_WAIT_IN_MS
        };
        let deadline = Instant::now() + Duration::from_millis(max_wait);
        let cluster = meta.config.id.as_str();

        loop {
            if Instant::now() >= deadline {
                log::warn!("reached max traffic control time, throttle exit");
                return;
            }
            if tc.max_qps_per_node > 0
                && !limiters.allow(cluster, "req-max_qps", tc.max_qps_per_node)
            {
                std::thread::sleep(THROTTLE_QUANTUM);
                continue;
            }
            if tc.max_bytes_per_node > 0
                && !limiters.allow_n(cluster, "req-max_bps", tc.max_bytes_per_node, size as u64)
            {
                std::thread::sleep(THROTTLE_QUANTUM);
                continue;
            }
            return;
        }
    }
}
