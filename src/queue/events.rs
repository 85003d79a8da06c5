//! In-process queue lifecycle signals.
//!
//! Writers announce `WriteComplete` when a segment seals; cursors announce
//! `ReadComplete` when they leave one behind. The replication hook and the
//! retention reaper subscribe at construction. Dispatch is synchronous; a
//! listener that wants to do slow work spawns its own thread.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEventKind {
    WriteComplete,
    ReadComplete,
}

#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub queue: String,
    pub kind: QueueEventKind,
    pub segment: i64,
}

type Listener = Box<dyn Fn(&QueueEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&QueueEvent) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("event bus lock")
            .push(Box::new(listener));
    }

    pub fn publish(&self, event: QueueEvent) {
        log::trace!(
            "queue event: {:?} [{}] segment {}",
            event.kind,
            event.queue,
            event.segment
        );
        let listeners = self.listeners.lock().expect("event bus lock");
        for listener in listeners.iter() {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[test]
    fn all_listeners_see_events() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicI64::new(0));
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |event| {
                if event.kind == QueueEventKind::WriteComplete {
                    seen.fetch_add(event.segment, Ordering::SeqCst);
                }
            });
        }
        bus.publish(QueueEvent {
            queue: "q1".to_string(),
            kind: QueueEventKind::WriteComplete,
            segment: 7,
        });
        bus.publish(QueueEvent {
            queue: "q1".to_string(),
            kind: QueueEventKind::ReadComplete,
            segment: 100,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 14);
    }
}
