//! Bounded fan-out/fan-in worker pool.
//!
//! Tasks are queued on a channel, a fixed number of workers claim them one
//! at a time, and results come back on a second channel in completion order.
//! The results channel closes once every worker has exited, which is the
//! barrier callers wait on before aggregating.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Number of workers for `items` units of work, capped at `limit`.
///
/// Any non-empty batch gets at least one worker, so a zero `limit` still
/// makes progress.
pub fn pool_size(limit: usize, items: usize) -> usize {
    limit.max(1).min(items)
}

/// Runs `work` over `tasks` on at most `limit` concurrent workers.
///
/// Workers stop claiming tasks once `cancel` fires; tasks still queued at
/// that point produce no result. A unit of work already running is expected
/// to observe `cancel` itself.
pub fn spawn_pool<T, R, F, Fut>(
    tasks: Vec<T>,
    limit: usize,
    cancel: &CancellationToken,
    work: F,
) -> mpsc::Receiver<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let capacity = tasks.len().max(1);
    let workers = pool_size(limit, tasks.len());

    let (task_tx, task_rx) = mpsc::channel::<T>(capacity);
    let (result_tx, result_rx) = mpsc::channel::<R>(capacity);

    for task in tasks {
        // Capacity equals the task count, so this never fails.
        let _ = task_tx.try_send(task);
    }
    drop(task_tx);

    let task_rx = Arc::new(Mutex::new(task_rx));
    let work = Arc::new(work);

    for _ in 0..workers {
        let task_rx = Arc::clone(&task_rx);
        let result_tx = result_tx.clone();
        let work = Arc::clone(&work);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(task) = task_rx.lock().await.recv().await else {
                    break;
                };
                let result = work(task).await;
                if result_tx.send(result).await.is_err() {
                    break;
                }
            }
        });
    }

    result_rx
}

/// Drains `results`, stopping at the first error.
///
/// On error `cancel` is fired so the remaining workers of the pool stop
/// claiming work, and the error is returned.
pub async fn try_collect<R, E>(
    mut results: mpsc::Receiver<Result<R, E>>,
    cancel: &CancellationToken,
) -> Result<Vec<R>, E> {
    let mut collected = Vec::new();
    while let Some(result) = results.recv().await {
        match result {
            Ok(value) => collected.push(value),
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        }
    }
    Ok(collected)
}
