//! Deferred Work
//!
//! One worker thread per queue runs the queue's completion work outside
//! interrupt context. Scheduling is coalesced: any number of `schedule`
//! calls before the worker picks the request up result in one run, and a
//! request made while the work runs causes exactly one more run.
//!
//! Each unit also carries a one-shot fallback timer that schedules the work
//! when it expires.

use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{QdioError, QdioResult};

#[derive(Default)]
struct WorkState {
    scheduled: bool,
    running: bool,
    deadline: Option<Instant>,
    disabled: bool,
    exit: bool,
}

struct Shared {
    state: Mutex<WorkState>,
    cond: Condvar,
}

/// Coalescing work unit with a fallback timer
pub(crate) struct Deferred {
    name: String,
    shared: std::sync::Arc<Shared>,
    worker: ThreadId,
    thread: Option<JoinHandle<()>>,
}

impl Deferred {
    /// Start the worker thread running `work` on demand
    pub fn spawn(name: String, work: impl FnMut() + Send + 'static) -> QdioResult<Self> {
        let shared = std::sync::Arc::new(Shared {
            state: Mutex::new(WorkState::default()),
            cond: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(worker_shared, work))
            .map_err(|e| QdioError::OutOfMemory(format!("spawn {name}: {e}")))?;

        Ok(Self {
            name,
            worker: thread.thread().id(),
            shared,
            thread: Some(thread),
        })
    }

    /// Request a run. Returns false while the unit is disabled.
    pub fn schedule(&self) -> bool {
        let mut st = self.shared.state.lock();
        if st.disabled || st.exit {
            return false;
        }
        st.scheduled = true;
        drop(st);
        self.shared.cond.notify_all();
        true
    }

    /// Arm the timer unless it is already pending. Returns true if armed.
    pub fn arm_timer_if_idle(&self, after: Duration) -> bool {
        let mut st = self.shared.state.lock();
        if st.disabled || st.deadline.is_some() {
            return false;
        }
        st.deadline = Some(Instant::now() + after);
        drop(st);
        self.shared.cond.notify_all();
        true
    }

    /// Arm the timer to expire no later than `after` from now, pulling in a
    /// later pending deadline. Returns true if the deadline moved.
    pub fn arm_timer_within(&self, after: Duration) -> bool {
        let mut st = self.shared.state.lock();
        if st.disabled {
            return false;
        }
        let deadline = Instant::now() + after;
        if st.deadline.is_some_and(|d| d <= deadline) {
            return false;
        }
        st.deadline = Some(deadline);
        drop(st);
        self.shared.cond.notify_all();
        true
    }

    /// Disarm the timer
    pub fn cancel_timer(&self) {
        self.shared.state.lock().deadline = None;
    }

    /// Timer armed and not yet expired
    pub fn timer_pending(&self) -> bool {
        self.shared.state.lock().deadline.is_some()
    }

    /// Disable the unit, drop pending requests and the timer, and wait for
    /// a running instance to finish. Called from the worker itself it does
    /// not wait.
    pub fn kill(&self) {
        let mut st = self.shared.state.lock();
        st.disabled = true;
        st.scheduled = false;
        st.deadline = None;

        if thread::current().id() == self.worker {
            tracing::debug!(unit = %self.name, "kill from own worker, not waiting");
            return;
        }
        while st.running {
            self.shared.cond.wait(&mut st);
        }
    }

    /// Called on the worker thread
    pub fn on_worker(&self) -> bool {
        thread::current().id() == self.worker
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock();
            st.exit = true;
            st.scheduled = false;
            st.deadline = None;
        }
        self.shared.cond.notify_all();

        if let Some(handle) = self.thread.take() {
            if thread::current().id() == self.worker {
                // last owner dropped from inside the work; the loop exits on its own
                return;
            }
            if handle.join().is_err() {
                tracing::error!(unit = %self.name, "deferred worker panicked");
            }
        }
    }
}

fn run(shared: std::sync::Arc<Shared>, mut work: impl FnMut()) {
    let mut st = shared.state.lock();
    loop {
        if st.exit {
            break;
        }
        if let Some(deadline) = st.deadline {
            if deadline <= Instant::now() {
                st.deadline = None;
                if !st.disabled {
                    st.scheduled = true;
                }
            }
        }
        if st.scheduled && !st.disabled {
            st.scheduled = false;
            st.running = true;
            MutexGuard::unlocked(&mut st, &mut work);
            st.running = false;
            shared.cond.notify_all();
            continue;
        }
        match st.deadline {
            Some(deadline) => {
                shared.cond.wait_until(&mut st, deadline);
            }
            None => shared.cond.wait(&mut st),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};

    fn wait_for(pred: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn busy(unit: &Deferred) -> bool {
        let st = unit.shared.state.lock();
        st.scheduled || st.running
    }

    #[test]
    fn test_schedule_runs_work() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let unit = Deferred::spawn("test-run".into(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(unit.schedule());
        wait_for(|| runs.load(Ordering::SeqCst) == 1);
        wait_for(|| !busy(&unit));
    }

    #[test]
    fn test_schedule_while_running_reruns_once() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let unit = Deferred::spawn("test-coalesce".into(), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                entered_tx.send(()).unwrap();
                release_rx.lock().recv().unwrap();
            }
        })
        .unwrap();

        unit.schedule();
        entered_rx.recv().unwrap();
        unit.schedule();
        unit.schedule();
        release_tx.send(()).unwrap();

        wait_for(|| runs.load(Ordering::SeqCst) == 2 && !busy(&unit));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_timer_fires() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let unit = Deferred::spawn("test-timer".into(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(unit.arm_timer_if_idle(Duration::from_millis(10)));
        assert!(!unit.arm_timer_if_idle(Duration::from_millis(10)));
        assert!(unit.timer_pending());
        wait_for(|| runs.load(Ordering::SeqCst) == 1);
        assert!(!unit.timer_pending());
    }

    #[test]
    fn test_arm_within_shortens_deadline() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let unit = Deferred::spawn("test-within".into(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(unit.arm_timer_if_idle(Duration::from_secs(60)));
        assert!(unit.arm_timer_within(Duration::from_millis(5)));
        assert!(!unit.arm_timer_within(Duration::from_secs(30)));
        wait_for(|| runs.load(Ordering::SeqCst) == 1);
        assert!(!unit.timer_pending());

        unit.kill();
        assert!(!unit.arm_timer_within(Duration::from_millis(1)));
    }

    #[test]
    fn test_cancel_timer() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let unit = Deferred::spawn("test-cancel".into(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        unit.arm_timer_if_idle(Duration::from_millis(20));
        unit.cancel_timer();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_kill_waits_for_running_work() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();

        let unit = Arc::new(
            Deferred::spawn("test-kill".into(), move || {
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap(),
        );

        unit.schedule();
        entered_rx.recv().unwrap();
        unit.kill();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!unit.schedule());
        assert!(!unit.arm_timer_if_idle(Duration::from_millis(1)));
        assert!(!unit.timer_pending());
    }

    #[test]
    fn test_kill_from_worker_does_not_wait() {
        let slot: Arc<Mutex<Option<Arc<Deferred>>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let (tx, rx) = mpsc::channel();

        let unit = Arc::new(
            Deferred::spawn("test-self-kill".into(), move || {
                if let Some(me) = inner.lock().clone() {
                    me.kill();
                    tx.send(me.on_worker()).unwrap();
                }
            })
            .unwrap(),
        );
        *slot.lock() = Some(unit.clone());

        unit.schedule();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        slot.lock().take();
    }
}
