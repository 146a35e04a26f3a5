//! Bounded fan-out with a fan-in channel
//!
//! Each job holds a semaphore permit while it runs and pushes its outcome on
//! an mpsc channel; the collector drains until every sender is gone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

pub async fn fan_in<I, T, F, Fut>(inputs: I, concurrency: usize, pacing: Duration, job: F) -> Vec<T>
where
    I: IntoIterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let concurrency = concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let (tx, mut rx) = mpsc::channel::<T>(concurrency);
    let job = Arc::new(job);

    let producer = async move {
        for (i, input) in inputs.into_iter().enumerate() {
            if i > 0 && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                warn!("Job semaphore closed, dropping remaining jobs");
                break;
            };
            let tx = tx.clone();
            let job = job.clone();
            tokio::spawn(async move {
                let outcome = job(input).await;
                drop(permit);
                let _ = tx.send(outcome).await;
            });
        }
    };

    let collector = async move {
        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    };

    let ((), outcomes) = tokio::join!(producer, collector);
    outcomes
}
