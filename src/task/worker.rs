//! Threaded worker
//!
//! A long-lived unit of execution on its own OS thread, for anything that
//! must not run on the shared I/O executor. Supports a start/stop
//! lifecycle, an event-driven kick signal, and panic capture.

use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

#[derive(Default)]
struct WorkerState {
    running: bool,
    stop_requested: bool,
    kicked: bool,
    thread_id: Option<ThreadId>,
    panic: Option<Box<dyn Any + Send>>,
}

struct Shared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

/// A dedicated worker thread.
///
/// The loop body receives a [`WorkerControl`] and is expected to block in
/// [`WorkerControl::wait_for_kick`] between rounds of work; `kick()` wakes
/// it, `stop()` makes the next wait return false so the loop exits. On loop
/// exit, by return or by a captured panic, the worker transitions back to
/// not-started and may be started again.
pub struct Worker {
    name: String,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle given to the worker's loop body
#[derive(Clone)]
pub struct WorkerControl {
    shared: Arc<Shared>,
}

impl WorkerControl {
    /// Block until kicked, stopped, or the timeout elapses.
    ///
    /// Returns false exactly when a stop has been requested; a kick or a
    /// timeout both return true. A pending kick is consumed.
    pub fn wait_for_kick(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.stop_requested {
                return false;
            }
            if state.kicked {
                state.kicked = false;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    /// True once a stop has been requested
    pub fn stop_requested(&self) -> bool {
        self.shared.state.lock().unwrap().stop_requested
    }
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(WorkerState::default()),
                cond: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the worker thread running `body`.
    ///
    /// Returns false without doing anything if the worker is already
    /// started. A panic in the body is captured, not propagated; the
    /// worker still transitions back to not-started.
    pub fn start<F>(&self, body: F) -> bool
    where
        F: FnOnce(WorkerControl) + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.running {
                return false;
            }
            state.running = true;
            state.stop_requested = false;
            state.kicked = false;
            state.panic = None;
        }

        let shared = self.shared.clone();
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                shared.state.lock().unwrap().thread_id = Some(thread::current().id());
                let control = WorkerControl {
                    shared: shared.clone(),
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| body(control)));
                let mut state = shared.state.lock().unwrap();
                if let Err(panic) = outcome {
                    log::warn!("worker {} exited by panic", name);
                    state.panic = Some(panic);
                }
                state.thread_id = None;
                state.running = false;
                shared.cond.notify_all();
            })
            .expect("spawn worker thread");
        *self.handle.lock().unwrap() = Some(handle);

        log::debug!("worker {} started", self.name);
        true
    }

    /// Wake a worker blocked in `wait_for_kick`
    pub fn kick(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.kicked = true;
        self.shared.cond.notify_all();
    }

    /// Request termination; with `wait` set, block until the thread joins.
    ///
    /// Panics if called from the worker's own thread: a worker stopping
    /// itself is a programming error.
    pub fn stop(&self, wait: bool) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(tid) = state.thread_id {
                assert_ne!(
                    tid,
                    thread::current().id(),
                    "worker {} must not stop() its own thread",
                    self.name
                );
            }
            state.stop_requested = true;
            self.shared.cond.notify_all();
        }
        if wait {
            if let Some(handle) = self.handle.lock().unwrap().take() {
                // The thread catches its own panics, so join cannot fail
                let _ = handle.join();
            }
        }
        log::debug!("worker {} stopped", self.name);
    }

    /// True while the worker thread is executing its loop
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().unwrap().running
    }

    /// True when the last run ended in a captured panic
    pub fn has_panicked(&self) -> bool {
        self.shared.state.lock().unwrap().panic.is_some()
    }

    /// Human-readable form of the captured panic, if any
    pub fn panic_message(&self) -> Option<String> {
        let state = self.shared.state.lock().unwrap();
        state.panic.as_ref().map(|p| {
            if let Some(s) = p.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = p.downcast_ref::<String>() {
                s.clone()
            } else {
                "opaque panic payload".to_string()
            }
        })
    }

    /// Re-raise the captured panic on the calling thread
    pub fn rethrow(&self) {
        let panic = self.shared.state.lock().unwrap().panic.take();
        if let Some(panic) = panic {
            resume_unwind(panic);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Best effort: a worker dropped while running is asked to stop but
        // not joined (drop may run on any thread)
        let mut state = self.shared.state.lock().unwrap();
        if state.running {
            state.stop_requested = true;
            self.shared.cond.notify_all();
        }
    }
}
