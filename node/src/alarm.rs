//! Time-ordered task queue with a dedicated thread.
//!
//! Maintenance work (keepalives, cookie purges, rep crawls, weight
//! recalculation) is scheduled as one-shot operations; recurring tasks
//! reschedule themselves. The thread sleeps until the earliest wakeup and
//! drops whatever is still queued at shutdown. Tasks either run fully or
//! not at all.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

struct Operation {
    wakeup: Instant,
    function: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.wakeup == other.wakeup
    }
}
impl Eq for Operation {}
impl PartialOrd for Operation {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Operation {
    // Reversed so the BinaryHeap pops the earliest wakeup first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.wakeup.cmp(&self.wakeup)
    }
}

struct State {
    operations: BinaryHeap<Operation>,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    condition: Condvar,
}

/// One thread running scheduled operations in wakeup order.
pub struct Alarm {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Alarm {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                operations: BinaryHeap::new(),
                stopped: false,
            }),
            condition: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name("alarm".into())
            .spawn(move || Self::run(worker))
            .expect("spawning the alarm thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Schedule `function` to run `delay` from now.
    pub fn add(&self, delay: Duration, function: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        if state.stopped {
            return;
        }
        state.operations.push(Operation {
            wakeup: Instant::now() + delay,
            function: Box::new(function),
        });
        self.shared.condition.notify_all();
    }

    fn run(shared: Arc<Shared>) {
        let mut state = shared.state.lock().unwrap();
        loop {
            if state.stopped {
                break;
            }
            let now = Instant::now();
            match state.operations.peek() {
                None => {
                    state = shared.condition.wait(state).unwrap();
                }
                Some(operation) if operation.wakeup <= now => {
                    let operation = state.operations.pop().unwrap();
                    drop(state);
                    (operation.function)();
                    state = shared.state.lock().unwrap();
                }
                Some(operation) => {
                    let timeout = operation.wakeup - now;
                    let (guard, _) = shared
                        .condition
                        .wait_timeout(state, timeout)
                        .unwrap();
                    state = guard;
                }
            }
        }
        debug!("alarm stopped");
    }

    /// Stop the thread; queued operations are discarded.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stopped = true;
            state.operations.clear();
            self.shared.condition.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Default for Alarm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_in_wakeup_order() {
        let alarm = Alarm::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_a = log.clone();
        alarm.add(Duration::from_millis(60), move || {
            log_a.lock().unwrap().push("late");
        });
        let log_b = log.clone();
        alarm.add(Duration::from_millis(10), move || {
            log_b.lock().unwrap().push("early");
        });

        thread::sleep(Duration::from_millis(200));
        assert_eq!(log.lock().unwrap().as_slice(), &["early", "late"]);
    }

    #[test]
    fn stop_discards_pending() {
        let mut alarm = Alarm::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        alarm.add(Duration::from_secs(60), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        alarm.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn add_after_stop_is_ignored() {
        let mut alarm = Alarm::new();
        alarm.stop();
        alarm.add(Duration::from_millis(1), || {});
    }
}
