//! Single-writer FIFO for disk writes.
//!
//! `store.jsonl` and `index.json` are not safe under concurrent appends or
//! overwrites, so every write goes through this queue. At most one task
//! runs at a time; a task's failure is isolated to its completion handle
//! and subsequent tasks proceed.

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use rlm_domain::{Error, Result};

struct Job {
    name: String,
    fut: BoxFuture<'static, Result<()>>,
    done: oneshot::Sender<Result<()>>,
}

/// Completion handle returned by [`WriteQueue::enqueue`].
pub struct WriteHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl WriteHandle {
    /// Wait for the task to complete and surface its result.
    pub async fn wait(self) -> Result<()> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::Other("write queue shut down".into())))
    }
}

/// FIFO of named async write tasks, executed strictly one at a time.
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl WriteQueue {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = job.fut.await;
                if let Err(e) = &result {
                    tracing::warn!(task = %job.name, error = %e, "write task failed");
                }
                // Callers are free to drop their handle.
                let _ = job.done.send(result);
            }
        });
        Self { tx }
    }

    /// Append a task to the queue. Returns a handle the caller can await.
    pub fn enqueue(
        &self,
        name: impl Into<String>,
        fut: BoxFuture<'static, Result<()>>,
    ) -> WriteHandle {
        let (done, rx) = oneshot::channel();
        let job = Job {
            name: name.into(),
            fut,
            done,
        };
        if self.tx.send(job).is_err() {
            tracing::warn!("write queue worker is gone; task dropped");
        }
        WriteHandle { rx }
    }

    /// Resolve once every previously enqueued task has completed and the
    /// queue is idle.
    pub async fn flush(&self) -> Result<()> {
        self.enqueue("flush", Box::pin(async { Ok(()) })).wait().await
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}
