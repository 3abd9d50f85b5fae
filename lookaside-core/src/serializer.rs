//! Serialized execution of control-plane work.
//!
//! Each policy instance owns one `WorkSerializer`. Closures submitted to it
//! run on a single spawned task in submission order, so config updates, child
//! policy updates and lookup completions never race with each other. The
//! data path never runs here; it synchronizes with the policy mutex instead.

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct WorkSerializer {
    tx: mpsc::UnboundedSender<(&'static str, Job)>,
}

impl WorkSerializer {
    /// Spawns the drain task. The task exits once every handle is dropped
    /// and the queue has been emptied.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, Job)>();
        tokio::spawn(async move {
            while let Some((name, job)) = rx.recv().await {
                trace!(event = "serializer_run", job = name);
                job();
            }
        });
        WorkSerializer { tx }
    }

    /// Enqueues `job` to run after all previously scheduled work.
    ///
    /// Jobs submitted after the drain task has stopped are silently dropped;
    /// that only happens once the owning policy is gone.
    pub fn schedule(&self, name: &'static str, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send((name, Box::new(job)));
    }

    /// Completes once every job scheduled before the call has run.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.schedule("flush", move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.await;
    }
}

impl Default for WorkSerializer {
    fn default() -> Self {
        WorkSerializer::new()
    }
}
