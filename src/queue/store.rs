//! Process-wide disk queue store.
//!
//! Owns every queue's writer and the bookkeeping the reaper needs: which
//! segments live cursors are holding, and which queues are paused for reads.
//! Queues are initialized lazily on first use, one directory per queue id
//! under `<data>/queue/`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use crate::config::{ConsumerConfig, DiskQueueConfig};
use crate::queue::consumer::Consumer;
use crate::queue::events::EventBus;
use crate::queue::writer::DiskQueue;
use crate::queue::Offset;
use crate::stats::Stats;
use crate::Result;

/// Cursor positions, pushed by the cursors themselves so the store can answer
/// "lowest segment any live reader of queue Q still needs".
#[derive(Default)]
pub(crate) struct ConsumerObserver {
    inner: Mutex<HashMap<u64, (String, i64)>>,
    next_id: AtomicU64,
}

impl ConsumerObserver {
    pub(crate) fn register(&self, queue: &str, segment: i64) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .expect("observer lock")
            .insert(id, (queue.to_string(), segment));
        id
    }

    pub(crate) fn update(&self, id: u64, segment: i64) {
        if let Some(entry) = self.inner.lock().expect("observer lock").get_mut(&id) {
            entry.1 = segment;
        }
    }

    pub(crate) fn remove(&self, id: u64) {
        self.inner.lock().expect("observer lock").remove(&id);
    }

    pub(crate) fn min_active_segment(&self, queue: &str) -> Option<i64> {
        self.inner
            .lock()
            .expect("observer lock")
            .values()
            .filter(|(q, _)| q == queue)
            .map(|(_, segment)| *segment)
            .min()
    }
}

/// Read-side pause switch. `pause_read` parks every fetch on the queue until
/// `resume_read`.
#[derive(Default)]
pub(crate) struct PauseGate {
    paused: Mutex<HashSet<String>>,
    cond: Condvar,
}

impl PauseGate {
    pub(crate) fn pause(&self, queue: &str) {
        self.paused
            .lock()
            .expect("pause lock")
            .insert(queue.to_string());
    }

    pub(crate) fn resume(&self, queue: &str) {
        self.paused.lock().expect("pause lock").remove(queue);
        self.cond.notify_all();
    }

    pub(crate) fn wait_while_paused(&self, queue: &str) {
        let mut paused = self.paused.lock().expect("pause lock");
        while paused.contains(queue) {
            log::debug!("queue [{queue}] is paused for reads, waiting");
            paused = self.cond.wait(paused).expect("pause lock");
        }
    }
}

pub struct DiskQueueStore {
    data_dir: PathBuf,
    cfg: Arc<DiskQueueConfig>,
    queues: RwLock<HashMap<String, Arc<DiskQueue>>>,
    events: Arc<EventBus>,
    observer: Arc<ConsumerObserver>,
    gate: Arc<PauseGate>,
    stats: Arc<Stats>,
}

impl DiskQueueStore {
    pub fn open(
        data_dir: impl AsRef<Path>,
        cfg: DiskQueueConfig,
        events: Arc<EventBus>,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(data_dir.join("queue"))?;
        Ok(Self {
            data_dir,
            cfg: Arc::new(cfg),
            queues: RwLock::new(HashMap::new()),
            events,
            observer: Arc::new(ConsumerObserver::default()),
            gate: Arc::new(PauseGate::default()),
            stats,
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &Arc<DiskQueueConfig> {
        &self.cfg
    }

    pub fn queue_dir(&self, queue: &str) -> PathBuf {
        self.data_dir.join("queue").join(queue.to_lowercase())
    }

    /// Create the queue's writer if this is the first use.
    pub fn init(&self, queue: &str) -> Result<()> {
        self.get_or_init(queue).map(|_| ())
    }

    pub fn append(&self, queue: &str, data: &[u8]) -> Result<Offset> {
        let q = self.get_or_init(queue)?;
        match q.append(data) {
            Ok(offset) => {
                self.stats.increment(&format!("queue.{queue}"), "push");
                Ok(offset)
            }
            Err(err) => {
                self.stats.increment(&format!("queue.{queue}"), "push_error");
                Err(err)
            }
        }
    }

    pub fn acquire_consumer(
        &self,
        queue: &str,
        ccfg: &ConsumerConfig,
        offset: Offset,
    ) -> Result<Consumer> {
        let q = self.get_or_init(queue)?;
        log::debug!(
            "acquire consumer [{}] on queue [{}] at {}",
            ccfg.key(),
            queue,
            offset
        );
        Consumer::new(
            queue,
            self.queue_dir(queue),
            Arc::clone(&self.cfg),
            ccfg.clone(),
            q,
            Arc::clone(&self.events),
            Arc::clone(&self.observer),
            Arc::clone(&self.gate),
            offset,
        )
    }

    pub fn depth(&self, queue: &str) -> Result<i64> {
        Ok(self.get_or_init(queue)?.depth())
    }

    pub fn latest_offset(&self, queue: &str) -> Result<Offset> {
        Ok(self.get_or_init(queue)?.latest_offset())
    }

    pub fn earliest_offset(&self, queue: &str) -> Result<Offset> {
        self.get_or_init(queue)?.earliest_offset()
    }

    pub fn writer_segment(&self, queue: &str) -> Result<i64> {
        Ok(self.get_or_init(queue)?.write_segment())
    }

    /// Lowest segment any live cursor of the queue points at.
    pub fn min_active_segment(&self, queue: &str) -> Option<i64> {
        self.observer.min_active_segment(queue)
    }

    pub fn pause_read(&self, queue: &str) {
        self.gate.pause(queue);
    }

    pub fn resume_read(&self, queue: &str) {
        self.gate.resume(queue);
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues
            .read()
            .expect("queues lock")
            .keys()
            .cloned()
            .collect()
    }

    pub fn flush_all(&self) -> Result<()> {
        let queues: Vec<Arc<DiskQueue>> = {
            let queues = self.queues.read().expect("queues lock");
            queues.values().cloned().collect()
        };
        for q in queues {
            q.flush()?;
        }
        Ok(())
    }

    fn get_or_init(&self, queue: &str) -> Result<Arc<DiskQueue>> {
        {
            let queues = self.queues.read().expect("queues lock");
            if let Some(q) = queues.get(queue) {
                return Ok(Arc::clone(q));
            }
        }
        let mut queues = self.queues.write().expect("queues lock");
        if let Some(q) = queues.get(queue) {
            return Ok(Arc::clone(q));
        }
        log::debug!("init queue [{queue}]");
        let q = Arc::new(DiskQueue::open(
            queue,
            self.queue_dir(queue),
            Arc::clone(&self.cfg),
            Arc::clone(&self.events),
        )?);
        queues.insert(queue.to_string(), Arc::clone(&q));
        Ok(q)
    }
}
