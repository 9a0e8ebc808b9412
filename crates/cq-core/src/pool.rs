//! Bounded worker pool for verification tasks.
//!
//! A fixed set of worker tasks pulls jobs from one FIFO channel. Each round
//! of submissions gets its own completion channel: every task carries a
//! sender, [`TaskPool::join`] drops the pool's copy and drains until all
//! senders are gone, so it returns exactly when the last task of the round
//! has finished.
//!
//! Both `add_task` and `join` take `&mut self`: one producer submits a round
//! and joins it before the next round starts, and nothing can be submitted
//! while a join is in flight.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Errors surfaced by [`TaskPool::join`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("task `{task}` failed: {error:#}")]
    TaskFailed { task: String, error: anyhow::Error },

    #[error("task `{task}` panicked: {message}")]
    TaskPanicked { task: String, message: String },

    #[error("task `{task}` was submitted after the pool closed")]
    Closed { task: String },
}

struct Task<T> {
    description: String,
    future: BoxFuture<'static, anyhow::Result<T>>,
    done: mpsc::UnboundedSender<Result<T, PoolError>>,
}

enum Job<T> {
    Run(Task<T>),
    Stop,
}

struct Round<T> {
    done_tx: mpsc::UnboundedSender<Result<T, PoolError>>,
    done_rx: mpsc::UnboundedReceiver<Result<T, PoolError>>,
    submitted: usize,
}

impl<T> Round<T> {
    fn new() -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            done_tx,
            done_rx,
            submitted: 0,
        }
    }
}

/// Fixed-size pool of workers running boxed futures.
pub struct TaskPool<T> {
    jobs: mpsc::UnboundedSender<Job<T>>,
    workers: Vec<JoinHandle<()>>,
    round: Option<Round<T>>,
}

impl<T: Send + 'static> TaskPool<T> {
    /// Spawn `workers` workers (at least one) on the current tokio runtime.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (jobs, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers)
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&rx))))
            .collect();
        debug!(workers, "Task pool started");
        Self {
            jobs,
            workers: handles,
            round: None,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of tasks submitted since the last `join`.
    pub fn outstanding(&self) -> usize {
        self.round.as_ref().map_or(0, |round| round.submitted)
    }

    /// Queue a task for the current round. Never blocks.
    pub fn add_task<F>(&mut self, description: impl Into<String>, future: F)
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let round = self.round.get_or_insert_with(Round::new);
        round.submitted += 1;
        let task = Task {
            description: description.into(),
            future: future.boxed(),
            done: round.done_tx.clone(),
        };
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(Job::Run(task)) {
            if let Job::Run(task) = job {
                let _ = task.done.send(Err(PoolError::Closed {
                    task: task.description,
                }));
            }
        }
    }

    /// Wait for every task of the round.
    ///
    /// Returns outputs in completion order. If any task failed, the first
    /// failure to complete is returned instead, but only after all its
    /// siblings have finished. The round is reset either way.
    pub async fn join(&mut self) -> Result<Vec<T>, PoolError> {
        let Some(round) = self.round.take() else {
            return Ok(Vec::new());
        };
        let Round {
            done_tx,
            mut done_rx,
            submitted,
        } = round;
        drop(done_tx);

        let mut outputs = Vec::with_capacity(submitted);
        let mut first_error = None;
        while let Some(outcome) = done_rx.recv().await {
            match outcome {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }

    /// Stop every worker and wait for them to exit.
    pub async fn close(self) {
        for _ in 0..self.workers.len() {
            let _ = self.jobs.send(Job::Stop);
        }
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Task pool worker did not exit cleanly");
            }
        }
        debug!("Task pool closed");
    }
}

async fn worker_loop<T: Send + 'static>(id: usize, jobs: Arc<Mutex<mpsc::UnboundedReceiver<Job<T>>>>) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Task {
            description,
            future,
            done,
        } = match job {
            Some(Job::Run(task)) => task,
            Some(Job::Stop) | None => break,
        };

        let outcome = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(error)) => {
                error!(worker = id, task = %description, error = %format!("{error:#}"), "Task failed");
                Err(PoolError::TaskFailed {
                    task: description,
                    error,
                })
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker = id, task = %description, panic = %message, "Task panicked");
                Err(PoolError::TaskPanicked {
                    task: description,
                    message,
                })
            }
        };
        let _ = done.send(outcome);
    }
    debug!(worker = id, "Worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn join_returns_every_output() {
        let mut pool = TaskPool::new(3);
        for i in 0..10u32 {
            pool.add_task(format!("echo {i}"), async move { Ok(i) });
        }
        assert_eq!(pool.outstanding(), 10);

        let outputs: BTreeSet<u32> = pool.join().await.unwrap().into_iter().collect();
        assert_eq!(outputs, (0..10).collect());
        assert_eq!(pool.outstanding(), 0);
        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn outputs_arrive_in_completion_order() {
        let mut pool = TaskPool::new(2);
        pool.add_task("slow", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("slow")
        });
        pool.add_task("fast", async { Ok("fast") });

        assert_eq!(pool.join().await.unwrap(), vec!["fast", "slow"]);
        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failure_is_raised_after_all_siblings_ran() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool = TaskPool::new(2);
        for i in 0..6usize {
            let ran = Arc::clone(&ran);
            pool.add_task(format!("task {i}"), async move {
                if i == 0 {
                    ran.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("verifier bug");
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(i)
            });
        }

        let err = pool.join().await.unwrap_err();
        assert_eq!(ran.load(Ordering::SeqCst), 6);
        match err {
            PoolError::TaskFailed { task, error } => {
                assert_eq!(task, "task 0");
                assert!(error.to_string().contains("verifier bug"));
            }
            other => panic!("expected TaskFailed, got {other:?}"),
        }
        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panics_are_captured_and_workers_survive() {
        let mut pool = TaskPool::new(1);
        pool.add_task("explodes", async {
            if true {
                panic!("index out of bounds");
            }
            Ok(0u8)
        });
        let err = pool.join().await.unwrap_err();
        assert!(
            matches!(err, PoolError::TaskPanicked { ref message, .. } if message.contains("index out of bounds"))
        );

        pool.add_task("after", async { Ok(7u8) });
        assert_eq!(pool.join().await.unwrap(), vec![7]);
        pool.close().await;
    }

    #[tokio::test]
    async fn pool_is_reusable_across_rounds() {
        let mut pool = TaskPool::new(2);
        pool.add_task("a", async { Ok(1) });
        assert_eq!(pool.join().await.unwrap(), vec![1]);

        assert!(pool.join().await.unwrap().is_empty());

        pool.add_task("b", async { Ok(2) });
        assert_eq!(pool.join().await.unwrap(), vec![2]);
        pool.close().await;
    }

    #[tokio::test]
    async fn close_stops_idle_workers() {
        let pool: TaskPool<()> = TaskPool::new(4);
        assert_eq!(pool.worker_count(), 4);
        tokio::time::timeout(Duration::from_secs(5), pool.close())
            .await
            .expect("close should return once every worker exited");
    }
}
