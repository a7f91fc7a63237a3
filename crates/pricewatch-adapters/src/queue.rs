//! Single-worker FIFO queue that spaces outbound retailer calls.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("request queue closed")]
pub struct QueueClosed;

/// Runs submitted work one unit at a time, in submission order, sleeping
/// `delay` after each unit before picking up the next.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Job>,
    delay: Duration,
}

impl RequestQueue {
    /// Spawns the worker task; must be called inside a tokio runtime.
    pub fn new(delay: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
                if !delay.is_zero() {
                    trace!(delay_ms = delay.as_millis() as u64, "request queue cooling down");
                    tokio::time::sleep(delay).await;
                }
            }
            debug!("request queue drained and closed");
        });
        Self { tx, delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Enqueues `work` and waits for its output.
    ///
    /// Dropping the returned future does not withdraw the work; it still runs
    /// in its slot and its output is discarded.
    pub async fn submit<F, T>(&self, work: F) -> Result<T, QueueClosed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = done_tx.send(work.await);
        });
        self.tx.send(job).map_err(|_| QueueClosed)?;
        done_rx.await.map_err(|_| QueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[tokio::test]
    async fn runs_jobs_in_submission_order_without_overlap() {
        let queue = RequestQueue::new(Duration::from_millis(40));
        let active = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..3u32 {
            let queue = queue.clone();
            let active = Arc::clone(&active);
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                queue
                    .submit(async move {
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0, "jobs overlapped");
                        let started = Instant::now();
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        log.lock().unwrap().push((id, started));
                        id * 10
                    })
                    .await
                    .unwrap()
            }));
            // Give each spawn a chance to enqueue before the next.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let mut outputs = Vec::new();
        for handle in handles {
            outputs.push(handle.await.unwrap());
        }
        assert_eq!(outputs, vec![0, 10, 20]);

        let log = log.lock().unwrap();
        let ids: Vec<_> = log.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        for pair in log.windows(2) {
            let gap = pair[1].1.duration_since(pair[0].1);
            assert!(gap >= Duration::from_millis(60), "gap was {gap:?}");
        }
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_block_the_queue() {
        let queue = RequestQueue::new(Duration::ZERO);
        let slow = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit(async { tokio::time::sleep(Duration::from_millis(30)).await })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        slow.abort();

        let value = queue.submit(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }
}
