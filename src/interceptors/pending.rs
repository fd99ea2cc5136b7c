//! Outstanding-work tracker used to detect when the application is idle.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Shared counter of in-flight requests.
///
/// Every request entering an [`InterceptorChain`](super::InterceptorChain) holds a
/// [`PendingTask`] until its stream finishes or is dropped.
#[derive(Clone)]
pub struct PendingTasks {
    count: Arc<watch::Sender<usize>>,
    idle_hooks: Arc<Mutex<Vec<IdleHook>>>,
}

type IdleHook = Box<dyn Fn() + Send + Sync>;

impl PendingTasks {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
            idle_hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run `hook` every time the last pending task is released.
    ///
    /// Hooks run synchronously on the thread that drops the task, so they must not block.
    pub fn on_idle(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.idle_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(hook));
    }

    fn release(&self) {
        let mut became_idle = false;
        self.count.send_modify(|n| {
            became_idle = *n == 1;
            *n = n.saturating_sub(1);
        });
        if became_idle {
            for hook in self.idle_hooks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
                hook();
            }
        }
    }

    /// Register one unit of work. It is released when the returned task is dropped.
    pub fn add(&self) -> PendingTask {
        self.count.send_modify(|n| *n += 1);
        PendingTask {
            tasks: self.clone(),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_stable(&self) -> bool {
        self.count() == 0
    }

    /// Resolves once no work is pending; immediately if that is already the case.
    pub async fn when_stable(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for PendingTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PendingTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTasks")
            .field("count", &self.count())
            .finish()
    }
}

/// Token for one unit of pending work; dropping it releases the work exactly once.
#[must_use = "the task is released as soon as it is dropped"]
pub struct PendingTask {
    tasks: PendingTasks,
}

impl Drop for PendingTask {
    fn drop(&mut self) {
        self.tasks.release();
    }
}

impl fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingTask")
    }
}
