use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// A unit of deferred work. Operations are plain futures; they do nothing
/// until the queue worker polls them.
pub type Operation = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Default)]
struct OperationsState {
    queue: VecDeque<Operation>,
    busy: bool,
}

/// Operations is a task executor that runs enqueued operations one at a time,
/// in the order they were enqueued, on a single logical worker.
///
/// The worker is spawned lazily when the first operation arrives and exits
/// once the queue is drained. Each operation runs in its own task so that a
/// panicking operation is logged and the worker moves on to the next one.
#[derive(Default, Clone)]
pub struct Operations {
    inner: Arc<Mutex<OperationsState>>,
}

impl fmt::Debug for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = lock(&self.inner);
        f.debug_struct("Operations")
            .field("pending", &s.queue.len())
            .field("busy", &s.busy)
            .finish()
    }
}

fn lock(inner: &Mutex<OperationsState>) -> MutexGuard<'_, OperationsState> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Operations {
    pub fn new() -> Self {
        Self::default()
    }

    /// enqueue adds a new operation to the queue. It must be called from within
    /// a tokio runtime.
    pub fn enqueue<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let start_worker = {
            let mut s = lock(&self.inner);
            s.queue.push_back(Box::pin(op));
            !std::mem::replace(&mut s.busy, true)
        };

        if start_worker {
            log::trace!("operations worker started");
            tokio::spawn(Operations::start(Arc::clone(&self.inner)));
        }
    }

    /// is_empty reports whether nothing is queued and no operation is running.
    pub fn is_empty(&self) -> bool {
        let s = lock(&self.inner);
        s.queue.is_empty() && !s.busy
    }

    /// len returns the number of operations waiting to run, excluding the one
    /// currently running.
    pub fn len(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    /// done blocks until every operation enqueued before the call, and every
    /// operation those enqueue in turn, has finished.
    pub async fn done(&self) {
        loop {
            let (tx, rx) = oneshot::channel();
            let inner = Arc::clone(&self.inner);
            self.enqueue(async move {
                let drained = lock(&inner).queue.is_empty();
                let _ = tx.send(drained);
            });

            match rx.await {
                Ok(false) => continue,
                Ok(true) | Err(_) => return,
            }
        }
    }

    async fn start(inner: Arc<Mutex<OperationsState>>) {
        loop {
            let op = {
                let mut s = lock(&inner);
                match s.queue.pop_front() {
                    Some(op) => op,
                    None => {
                        s.busy = false;
                        log::trace!("operations worker idle");
                        return;
                    }
                }
            };

            if let Err(err) = tokio::spawn(op).await {
                if err.is_panic() {
                    log::error!("operation panicked, continuing with the next one: {err}");
                } else {
                    log::warn!("operation was cancelled: {err}");
                }
            }
        }
    }
}
