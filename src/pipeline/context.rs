//! Pipeline execution context.
//!
//! Shared between the pipeline control loop and every processor it runs.
//! Carries the running-state machine, cancellation and failure flags, an
//! error stack, a key/value bag, counters, the in-flight message batch, and
//! the offset window consumer processors maintain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::queue::{Message, Offset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningState {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Finished,
}

impl RunningState {
    /// The only edges the state machine accepts; everything else is a no-op.
    fn can_move_to(self, next: RunningState) -> bool {
        use RunningState::*;
        matches!(
            (self, next),
            (Starting, Started)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Started, Stopping)
                | (Started, Failed)
                | (Started, Finished)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Stopped, Starting)
                | (Failed, Starting)
                | (Finished, Starting)
        )
    }
}

pub struct PipelineContext {
    state: Mutex<RunningState>,
    canceled: AtomicBool,
    paused: AtomicBool,
    exited: AtomicBool,
    errors: Mutex<Vec<String>>,
    bag: Mutex<HashMap<String, String>>,
    counters: Mutex<HashMap<String, i64>>,
    messages: Mutex<Vec<Message>>,
    init_offset: Mutex<Offset>,
    next_offset: Mutex<Offset>,
    start_time: Mutex<Option<SystemTime>>,
    end_time: Mutex<Option<SystemTime>>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self {
            state: Mutex::new(RunningState::Stopped),
            canceled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
            bag: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            messages: Mutex::new(Vec::new()),
            init_offset: Mutex::new(Offset::default()),
            next_offset: Mutex::new(Offset::default()),
            start_time: Mutex::new(None),
            end_time: Mutex::new(None),
        }
    }
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RunningState {
        *self.state.lock().expect("state lock")
    }

    fn transition(&self, next: RunningState) -> bool {
        let mut state = self.state.lock().expect("state lock");
        if !state.can_move_to(next) {
            log::trace!("ignored pipeline transition {:?} -> {:?}", *state, next);
            return false;
        }
        *state = next;
        true
    }

    pub fn starting(&self) -> bool {
        let moved = self.transition(RunningState::Starting);
        if moved {
            self.canceled.store(false, Ordering::SeqCst);
            *self.start_time.lock().expect("time lock") = Some(SystemTime::now());
            *self.end_time.lock().expect("time lock") = None;
        }
        moved
    }

    pub fn started(&self) -> bool {
        self.transition(RunningState::Started)
    }

    pub fn stopping(&self) -> bool {
        self.transition(RunningState::Stopping)
    }

    pub fn stopped(&self) -> bool {
        let moved = self.transition(RunningState::Stopped);
        if moved {
            *self.end_time.lock().expect("time lock") = Some(SystemTime::now());
        }
        moved
    }

    pub fn failed(&self) -> bool {
        let moved = self.transition(RunningState::Failed);
        if moved {
            *self.end_time.lock().expect("time lock") = Some(SystemTime::now());
        }
        moved
    }

    pub fn finished(&self) -> bool {
        let moved = self.transition(RunningState::Finished);
        if moved {
            *self.end_time.lock().expect("time lock") = Some(SystemTime::now());
        }
        moved
    }

    // Flags.

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.state() == RunningState::Failed
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn exit(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Clear pause/exit and re-arm a terminal state for another run.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.exited.store(false, Ordering::SeqCst);
        let state = self.state();
        if matches!(
            state,
            RunningState::Stopped | RunningState::Failed | RunningState::Finished
        ) {
            self.starting();
        }
    }

    // Error stack.

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::debug!("pipeline context error: {message}");
        self.errors.lock().expect("errors lock").push(message);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().expect("errors lock").is_empty()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("errors lock").clone()
    }

    // Key/value bag.

    pub fn put_value(&self, key: &str, value: impl Into<String>) {
        self.bag
            .lock()
            .expect("bag lock")
            .insert(key.to_string(), value.into());
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        self.bag.lock().expect("bag lock").get(key).cloned()
    }

    // Counters (e.g. per-queue FAILED_SLICES).

    pub fn increment(&self, key: &str, delta: i64) {
        *self
            .counters
            .lock()
            .expect("counters lock")
            .entry(key.to_string())
            .or_insert(0) += delta;
    }

    pub fn stat(&self, key: &str) -> i64 {
        self.counters
            .lock()
            .expect("counters lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn clear_stat(&self, key: &str) {
        self.counters.lock().expect("counters lock").remove(key);
    }

    // Message batch.

    pub fn put_messages(&self, messages: Vec<Message>) {
        *self.messages.lock().expect("messages lock") = messages;
    }

    pub fn take_messages(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock().expect("messages lock"))
    }

    // Offset window.

    pub fn set_init_offset(&self, offset: Offset) {
        *self.init_offset.lock().expect("offset lock") = offset;
    }

    pub fn init_offset(&self) -> Offset {
        *self.init_offset.lock().expect("offset lock")
    }

    pub fn set_next_offset(&self, offset: Offset) {
        *self.next_offset.lock().expect("offset lock") = offset;
    }

    pub fn next_offset(&self) -> Offset {
        *self.next_offset.lock().expect("offset lock")
    }

    pub fn start_time(&self) -> Option<SystemTime> {
        *self.start_time.lock().expect("time lock")
    }

    pub fn end_time(&self) -> Option<SystemTime> {
        *self.end_time.lock().expect("time lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        let ctx = PipelineContext::new();
        assert_eq!(ctx.state(), RunningState::Stopped);
        assert!(ctx.starting());
        assert!(ctx.started());
        assert!(ctx.finished());
        assert!(ctx.starting());
        assert!(ctx.started());
        assert!(ctx.stopping());
        assert!(ctx.stopped());
    }

    #[test]
    fn invalid_transitions_are_noops() {
        let ctx = PipelineContext::new();
        assert!(!ctx.started()); // stopped -> started is not an edge
        assert_eq!(ctx.state(), RunningState::Stopped);
        ctx.starting();
        assert!(!ctx.finished()); // starting -> finished is not an edge
        assert_eq!(ctx.state(), RunningState::Starting);
    }

    #[test]
    fn resume_rearms_terminal_states() {
        let ctx = PipelineContext::new();
        ctx.starting();
        ctx.started();
        ctx.failed();
        ctx.pause();
        ctx.resume();
        assert_eq!(ctx.state(), RunningState::Starting);
        assert!(!ctx.is_paused());
    }

    #[test]
    fn starting_clears_cancellation() {
        let ctx = PipelineContext::new();
        ctx.starting();
        ctx.started();
        ctx.cancel();
        assert!(ctx.is_canceled());
        ctx.stopping();
        ctx.stopped();
        ctx.starting();
        assert!(!ctx.is_canceled());
    }
}
