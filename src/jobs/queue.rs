/// Bounded in-process job queue with a single worker
///
/// `submit` never blocks: a saturated queue reports `QueueFull` and leaves the
/// queue unchanged. `stop` tells the worker to take no further jobs; the job
/// in hand runs to completion.
use crate::error::{AppError, AppResult};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Producer side of a job queue
pub struct JobQueue<J> {
    name: &'static str,
    tx: mpsc::Sender<J>,
    stop: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Worker side of a job queue
pub struct JobReceiver<J> {
    rx: mpsc::Receiver<J>,
    stop: watch::Receiver<bool>,
}

impl<J: Send + 'static> JobQueue<J> {
    /// Create a queue holding at most `capacity` waiting jobs
    pub fn bounded(name: &'static str, capacity: usize) -> (Self, JobReceiver<J>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop, stop_rx) = watch::channel(false);

        let queue = Self {
            name,
            tx,
            stop,
            worker: Mutex::new(None),
        };
        (queue, JobReceiver { rx, stop: stop_rx })
    }

    /// Enqueue without waiting
    pub fn submit(&self, job: J) -> AppResult<()> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AppError::QueueFull(self.name),
            mpsc::error::TrySendError::Closed(_) => {
                AppError::Internal(format!("{} worker is not running", self.name))
            }
        })
    }

    /// Enqueue, waiting for room. Fails only once the worker is gone.
    pub async fn submit_wait(&self, job: J) -> AppResult<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| AppError::Internal(format!("{} worker is not running", self.name)))
    }

    /// Jobs waiting to be picked up
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Keep the worker's handle so shutdown can wait for it
    pub fn attach(&self, handle: JoinHandle<()>) {
        *self.worker.lock() = Some(handle);
    }

    /// Signal the worker to stop taking jobs
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stop and wait for the worker to finish its current job
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(queue = self.name, error = %e, "Worker task failed");
            }
        }
    }
}

impl<J> JobReceiver<J> {
    /// Next job, or `None` once the queue is stopped or every producer is gone
    pub async fn next(&mut self) -> Option<J> {
        if *self.stop.borrow() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.stop.changed() => None,
            job = self.rx.recv() => job,
        }
    }
}
