//! Cancellable task group
//!
//! Runs independently-spawned asynchronous units under one executor as a
//! single logical unit: the first non-cancellation failure cancels every
//! sibling and becomes the group's one result.

use crate::network::NetError;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identifies one spawned task inside its group
pub type TaskId = u64;

struct GroupInner {
    /// Cancellation token per still-running task
    tasks: HashMap<TaskId, CancellationToken>,
    next_id: TaskId,
    closed: bool,
}

/// A group of cooperative tasks that completes as one.
///
/// Completion notifications flow through a single ordered channel and the
/// bookkeeping map is mutated under one lock, so `spawn` and completions
/// are safe to interleave. Cancellation is cooperative: tasks observe their
/// token at suspension points and unwind; nothing is forcibly terminated.
pub struct TaskGroup {
    inner: Arc<Mutex<GroupInner>>,
    root: CancellationToken,
    done_tx: mpsc::UnboundedSender<(TaskId, Result<(), NetError>)>,
    done_rx: mpsc::UnboundedReceiver<(TaskId, Result<(), NetError>)>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Mutex::new(GroupInner {
                tasks: HashMap::new(),
                next_id: 0,
                closed: false,
            })),
            root: CancellationToken::new(),
            done_tx,
            done_rx,
        }
    }

    /// Token cancelled when the group shuts down; child tokens handed to
    /// tasks derive from it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Number of tasks not yet completed
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn one unit of work under the group.
    ///
    /// The closure receives the task's cancellation token and must observe
    /// it at its suspension points. Panics inside the task are captured and
    /// reported as a failure, not propagated.
    ///
    /// Panics if the group has been closed; spawning into a closed group is
    /// a programming error.
    pub fn spawn<F, Fut>(&self, name: &str, f: F) -> TaskId
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), NetError>> + Send + 'static,
    {
        let token = self.root.child_token();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            assert!(!inner.closed, "spawn on a closed task group");
            let id = inner.next_id;
            inner.next_id += 1;
            inner.tasks.insert(id, token.clone());
            id
        };
        log::trace!("task group: spawned {} (#{})", name, id);

        let fut = f(token);
        let done_tx = self.done_tx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(NetError::TaskPanicked(panic_message(&panic))),
            };
            if let Err(e) = &outcome {
                if !e.is_cancellation() {
                    log::debug!("task {} (#{}) failed: {}", name, id, e);
                }
            }
            // The group may already be gone during teardown
            let _ = done_tx.send((id, outcome));
        });
        id
    }

    /// Request cancellation of every task and close the group for spawning.
    /// The single external shutdown entry point.
    pub fn cancel(&self) {
        self.inner.lock().unwrap().closed = true;
        self.root.cancel();
    }

    /// Suspend until every task has completed.
    ///
    /// The first non-cancellation failure cancels all siblings; the group
    /// then still drains every completion before resolving to that single
    /// error. Cancellation-caused completions never become the result.
    pub async fn wait(&mut self) -> Result<(), NetError> {
        let mut first_error: Option<NetError> = None;
        loop {
            if self.inner.lock().unwrap().tasks.is_empty() {
                break;
            }
            let Some((id, outcome)) = self.done_rx.recv().await else {
                break;
            };
            self.inner.lock().unwrap().tasks.remove(&id);
            if let Err(e) = outcome {
                if e.is_cancellation() {
                    continue;
                }
                if first_error.is_none() {
                    first_error = Some(e);
                    self.cancel();
                } else {
                    // Later genuine failures lose the race; keep a trace
                    log::trace!("task group: secondary failure from #{}: {}", id, e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
