//! Per-application serialization of deployments.
//!
//! Each key gets one worker task draining a FIFO channel, so two deployments of the
//! same application never overlap while different applications run in parallel.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

type Job = BoxFuture<'static, ()>;

pub struct DeploymentQueue {
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    pending: watch::Sender<usize>,
}

impl Default for DeploymentQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentQueue {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            pending: watch::channel(0).0,
        }
    }

    /// Run `job` after every job previously enqueued under `key`.
    pub fn enqueue(&self, key: &str, job: Job) {
        self.pending.send_modify(|n| *n += 1);

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let job = match workers.get(key) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let tx = self.spawn_worker(key);
        if let Err(mpsc::error::SendError(_)) = tx.send(job) {
            error!("Queue worker for {} is gone", key);
            self.pending.send_modify(|n| *n -= 1);
        }
        workers.insert(key.to_string(), tx);
    }

    fn spawn_worker(&self, key: &str) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = self.pending.clone();
        let key = key.to_string();
        debug!("Starting queue worker for {}", key);

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("A queued deployment of {} panicked", key);
                }
                pending.send_modify(|n| *n -= 1);
            }
        });
        tx
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Resolve once every enqueued job, including ones enqueued meanwhile, is done.
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn same_key_runs_in_order() {
        let queue = DeploymentQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3u64 {
            let order = order.clone();
            queue.enqueue(
                "shop",
                async move {
                    tokio::time::sleep(Duration::from_millis(10 * (3 - i))).await;
                    order.lock().unwrap().push(i);
                }
                .boxed(),
            );
        }
        queue.wait_idle().await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let queue = DeploymentQueue::new();
        let barrier = Arc::new(Barrier::new(2));

        for key in ["shop", "blog"] {
            let barrier = barrier.clone();
            queue.enqueue(
                key,
                async move {
                    barrier.wait().await;
                }
                .boxed(),
            );
        }

        tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .expect("jobs under different keys should not block each other");
    }

    #[tokio::test]
    async fn panicking_job_does_not_stall_the_key() {
        let queue = DeploymentQueue::new();
        let ran = Arc::new(Mutex::new(false));

        queue.enqueue("shop", async { panic!("boom") }.boxed());
        let flag = ran.clone();
        queue.enqueue(
            "shop",
            async move {
                *flag.lock().unwrap() = true;
            }
            .boxed(),
        );

        tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .unwrap();
        assert!(*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn idle_queue_resolves_immediately() {
        DeploymentQueue::new().wait_idle().await;
    }
}
