//! Process-wide deadline timer
//!
//! One worker thread sleeps until the earliest deadline and runs its callback.
//! Callbacks must be short; they run on the timer thread.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, LazyLock, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::error::{Error, Result, eyre};
use crate::sync::lock;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy)]
struct Entry {
    deadline: Instant,
    id: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// min-heap on deadline
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Entry>,
    /// Armed callbacks; a heap entry without one was cancelled
    callbacks: HashMap<u64, Callback>,
    next_id: u64,
}

pub struct TimerQueue {
    state: Mutex<TimerState>,
    cv: Condvar,
    worker: OnceLock<()>,
}

static TIMER: LazyLock<Arc<TimerQueue>> = LazyLock::new(|| {
    Arc::new(TimerQueue {
        state: Mutex::new(TimerState::default()),
        cv: Condvar::new(),
        worker: OnceLock::new(),
    })
});

/// Cancels the timer when dropped
#[must_use = "the timer is cancelled when the guard is dropped"]
pub struct TimerGuard {
    id: u64,
    queue: Arc<TimerQueue>,
}

impl TimerGuard {
    pub fn cancel(self) {}
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.queue.state);
        state.callbacks.remove(&self.id);
    }
}

impl std::fmt::Debug for TimerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerGuard").field("id", &self.id).finish()
    }
}

/// Run `callback` once `after` has elapsed, unless the guard is dropped first
pub fn schedule(after: Duration, callback: impl FnOnce() + Send + 'static) -> Result<TimerGuard> {
    let queue = Arc::clone(&TIMER);
    queue.ensure_worker()?;
    let deadline = Instant::now() + after;
    let id = {
        let mut state = lock(&queue.state);
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, Box::new(callback));
        state.heap.push(Entry { deadline, id });
        id
    };
    queue.cv.notify_one();
    Ok(TimerGuard { id, queue })
}

impl TimerQueue {
    fn ensure_worker(self: &Arc<Self>) -> Result<()> {
        if self.worker.get().is_some() {
            return Ok(());
        }
        let mut spawn_result = Ok(());
        self.worker.get_or_init(|| {
            let queue = Arc::clone(self);
            spawn_result = std::thread::Builder::new()
                .name("zero-tds-timer".to_string())
                .spawn(move || queue.run())
                .map(drop);
        });
        spawn_result.map_err(|e| Error::LibraryBug(eyre!("failed to spawn timer thread: {}", e)))
    }

    fn run(&self) {
        loop {
            let callback = {
                let mut state = lock(&self.state);
                loop {
                    let Some(entry) = state.heap.peek().copied() else {
                        state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
                        continue;
                    };
                    if !state.callbacks.contains_key(&entry.id) {
                        state.heap.pop();
                        continue;
                    }
                    let now = Instant::now();
                    if entry.deadline <= now {
                        state.heap.pop();
                        if let Some(cb) = state.callbacks.remove(&entry.id) {
                            break cb;
                        }
                        continue;
                    }
                    let wait = entry.deadline.saturating_duration_since(now);
                    state = self
                        .cv
                        .wait_timeout(state, wait)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
            };
            tracing::debug!("timer fired");
            callback();
        }
    }
}
