use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type PostedJob = Box<dyn FnOnce(JobOutcome) -> BoxFuture + Send>;

/// Why a posted job is finally being run (or not run at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Run,
    TimedOut,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler has been stopped")]
    Stopped,
    #[error("queue {0:?} is not registered")]
    UnknownQueue(String),
}

struct Item {
    post_id: u64,
    deadline: Option<Instant>,
    job: PostedJob,
}

struct QueueState {
    priority: i32,
    capacity: usize,
    blocked: bool,
    closed: bool,
    items: VecDeque<Item>,
}

struct Inner {
    queues: HashMap<String, QueueState>,
    stopped: bool,
}

/// A single-threaded work queue (§4.1 of the design doc): jobs posted to the
/// same named queue run in post order; across queues only relative priority
/// is guaranteed, and a blocked or closed queue never yields a job no matter
/// its priority. Used both by the manager (one queue) and by each
/// `PluginWrapper` (a lifecycle queue plus one queue per open connection).
///
/// Modeled as a dedicated tokio task draining a `Mutex`-protected queue set,
/// rather than an OS thread and condvar: the externally observable
/// contract — strict per-queue ordering, no two jobs ever running
/// concurrently — is the same either way.
pub struct Handler {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl Handler {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let inner = Arc::new(Mutex::new(Inner {
            queues: HashMap::new(),
            stopped: false,
        }));
        let notify = Arc::new(Notify::new());
        let join = tokio::spawn(Self::run(inner.clone(), notify.clone(), name.clone()));
        Arc::new(Handler {
            inner,
            notify,
            worker: Mutex::new(Some(join)),
            name,
        })
    }

    pub fn register_queue(&self, queue: &str, priority: i32, capacity: usize) {
        let mut inner = self.inner.lock();
        inner
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState {
                priority,
                capacity,
                blocked: false,
                closed: false,
                items: VecDeque::new(),
            });
    }

    /// Enqueues `job`. `job` always runs eventually (with `JobOutcome::Run`,
    /// `TimedOut`, or `Cancelled`) unless the handler is stopped before it is
    /// reached, in which case `post` itself returns `Err`.
    pub fn post(
        &self,
        queue: &str,
        post_id: u64,
        timeout: Option<Duration>,
        job: PostedJob,
    ) -> Result<(), HandlerError> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return Err(HandlerError::Stopped);
        }
        let q = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| HandlerError::UnknownQueue(queue.to_string()))?;
        if q.closed {
            return Err(HandlerError::UnknownQueue(queue.to_string()));
        }
        if q.items.len() >= q.capacity {
            warn!(handler = %self.name, queue, depth = q.items.len(), "queue at capacity");
        }
        let deadline = timeout.map(|d| Instant::now() + d);
        q.items.push_back(Item { post_id, deadline, job });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    pub fn set_blocked(&self, queue: &str, blocked: bool) {
        let mut inner = self.inner.lock();
        if let Some(q) = inner.queues.get_mut(queue) {
            q.blocked = blocked;
        }
        drop(inner);
        if !blocked {
            self.notify.notify_one();
        }
    }

    /// Closes a queue, returning its still-pending jobs so the caller can run
    /// them with `JobOutcome::Cancelled`.
    pub fn close_queue(&self, queue: &str) -> Vec<PostedJob> {
        let mut inner = self.inner.lock();
        match inner.queues.get_mut(queue) {
            Some(q) => {
                q.closed = true;
                q.items.drain(..).map(|item| item.job).collect()
            }
            None => Vec::new(),
        }
    }

    /// Stops accepting new posts and waits for in-flight and already-queued
    /// jobs to drain, then joins the worker task.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.lock();
            inner.stopped = true;
        }
        self.notify.notify_one();
        let join = self.worker.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }

    async fn run(inner: Arc<Mutex<Inner>>, notify: Arc<Notify>, name: String) {
        loop {
            let next = {
                let mut guard = inner.lock();
                Self::pop_highest(&mut guard)
            };
            match next {
                Some(item) => {
                    let expired = item.deadline.map(|d| Instant::now() >= d).unwrap_or(false);
                    let outcome = if expired {
                        JobOutcome::TimedOut
                    } else {
                        JobOutcome::Run
                    };
                    trace!(handler = %name, post_id = item.post_id, ?outcome, "running posted job");
                    (item.job)(outcome).await;
                }
                None => {
                    if inner.lock().stopped {
                        break;
                    }
                    notify.notified().await;
                }
            }
        }
        debug!(handler = %name, "worker stopped");
    }

    fn pop_highest(guard: &mut Inner) -> Option<Item> {
        let queue_name = guard
            .queues
            .iter()
            .filter(|(_, q)| !q.blocked && !q.items.is_empty())
            .max_by_key(|(_, q)| q.priority)
            .map(|(name, _)| name.clone())?;
        guard.queues.get_mut(&queue_name).and_then(|q| q.items.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn job_that_sends(tx: oneshot::Sender<JobOutcome>) -> PostedJob {
        Box::new(move |outcome| {
            Box::pin(async move {
                let _ = tx.send(outcome);
            })
        })
    }

    #[tokio::test]
    async fn jobs_on_one_queue_run_in_post_order() {
        let handler = Handler::new("test");
        handler.register_queue("q", 0, 8);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        handler
            .post(
                "q",
                1,
                None,
                Box::new(move |outcome| {
                    Box::pin(async move {
                        o1.lock().push(1);
                        let _ = tx1.send(outcome);
                    })
                }),
            )
            .unwrap();
        handler
            .post(
                "q",
                2,
                None,
                Box::new(move |outcome| {
                    Box::pin(async move {
                        o2.lock().push(2);
                        let _ = tx2.send(outcome);
                    })
                }),
            )
            .unwrap();
        assert_eq!(rx1.await.unwrap(), JobOutcome::Run);
        assert_eq!(rx2.await.unwrap(), JobOutcome::Run);
        assert_eq!(*order.lock(), vec![1, 2]);
        handler.stop().await;
    }

    #[tokio::test]
    async fn higher_priority_queue_runs_first() {
        let handler = Handler::new("test");
        handler.register_queue("low", 0, 8);
        handler.register_queue("high", 10, 8);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Block the handler on a barrier job first so both posts land before
        // either runs, making the priority ordering deterministic.
        let (gate_tx, gate_rx) = oneshot::channel();
        let (go_tx, go_rx) = oneshot::channel();
        handler.register_queue("gate", 100, 1);
        handler
            .post(
                "gate",
                0,
                None,
                Box::new(move |_| {
                    Box::pin(async move {
                        let _ = gate_tx.send(());
                        let _ = go_rx.await;
                    })
                }),
            )
            .unwrap();
        gate_rx.await.unwrap();

        let (tx_low, rx_low) = oneshot::channel();
        let (tx_high, rx_high) = oneshot::channel();
        let o1 = order.clone();
        let o2 = order.clone();
        handler
            .post("low", 1, None, job_order(o1, 1, tx_low))
            .unwrap();
        handler
            .post("high", 2, None, job_order(o2, 2, tx_high))
            .unwrap();
        let _ = go_tx.send(());

        rx_low.await.unwrap();
        rx_high.await.unwrap();
        assert_eq!(*order.lock(), vec![2, 1]);
        handler.stop().await;
    }

    fn job_order(
        order: Arc<Mutex<Vec<i32>>>,
        tag: i32,
        tx: oneshot::Sender<JobOutcome>,
    ) -> PostedJob {
        Box::new(move |outcome| {
            Box::pin(async move {
                order.lock().push(tag);
                let _ = tx.send(outcome);
            })
        })
    }

    #[tokio::test]
    async fn closing_a_queue_cancels_its_pending_jobs() {
        let handler = Handler::new("test");
        handler.register_queue("q", 0, 8);
        handler.register_queue("gate", 100, 1);
        let (gate_tx, gate_rx) = oneshot::channel();
        let (go_tx, go_rx) = oneshot::channel();
        handler
            .post(
                "gate",
                0,
                None,
                Box::new(move |_| {
                    Box::pin(async move {
                        let _ = gate_tx.send(());
                        let _ = go_rx.await;
                    })
                }),
            )
            .unwrap();
        gate_rx.await.unwrap();

        let (tx, rx) = oneshot::channel();
        handler.post("q", 1, None, job_that_sends(tx)).unwrap();
        let cancelled = handler.close_queue("q");
        let _ = go_tx.send(());
        for job in cancelled {
            job(JobOutcome::Cancelled).await;
        }
        assert_eq!(rx.await.unwrap(), JobOutcome::Cancelled);
        handler.stop().await;
    }

    #[tokio::test]
    async fn post_after_stop_is_rejected() {
        let handler = Handler::new("test");
        handler.register_queue("q", 0, 8);
        handler.stop().await;
        let err = handler
            .post("q", 1, None, Box::new(|_| Box::pin(async {})))
            .unwrap_err();
        assert!(matches!(err, HandlerError::Stopped));
    }
}
