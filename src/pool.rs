use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::debug;

pub type Task<S> = BoxFuture<'static, S>;
type TaskWithReply<S> = (Task<S>, oneshot::Sender<S>);

/// The pool has been shut down; the caller should skip the submission
/// silently (spec §4.8 step 3).
#[derive(Debug)]
pub struct SubmitRejected;

/// Bounded worker pool generalized from the teacher's `chan_exec::ChanExec`:
/// same mpsc-channel-plus-oneshot-reply shape, but owns a fixed number of
/// persistent worker loops instead of handing the receiver stream back to a
/// caller to drive, and exposes an explicit `shutdown()` that stops accepting
/// submissions without killing whatever a worker is already running (spec
/// §4.8, §9 "worker pool with cooperative cancellation").
pub struct WorkerPool<S> {
    sender: mpsc::Sender<TaskWithReply<S>>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl<S: Send + 'static> WorkerPool<S> {
    pub fn new(n_threads: usize, queue_size: usize) -> Self {
        let n_threads = n_threads.max(1);
        let (sender, receiver) = mpsc::channel::<TaskWithReply<S>>(queue_size.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..n_threads)
            .map(|_| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let next = { receiver.lock().await.recv().await };
                        match next {
                            Some((task, reply)) => {
                                let result = task.await;
                                let _ = reply.send(result);
                            }
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            sender,
            shutdown,
            workers,
        }
    }

    /// Submits a task and awaits its result once some worker has run it.
    /// Rejected if the pool has already been shut down.
    pub async fn submit(&self, task: Task<S>) -> Result<S, SubmitRejected> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(SubmitRejected);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.sender.send((task, reply_tx)).await.is_err() {
            return Err(SubmitRejected);
        }
        reply_rx.await.map_err(|_| SubmitRejected)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stops accepting new submissions. In-flight work runs to completion;
    /// no worker task is forcibly killed (spec §9).
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            debug!("worker pool shutting down");
        }
    }
}

impl<S> Drop for WorkerPool<S> {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}
