use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::QueueError;

/// Tuning knobs for the pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Jobs that may wait in the channel before `submit` applies back-pressure.
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { workers: 4, capacity: 256 }
    }
}

/// Why a job did not finish cleanly.
#[derive(Debug, Clone, PartialEq)]
pub enum JobFailure {
    /// The handler returned an error.
    Error(String),
    /// The handler panicked or its task was aborted.
    Panicked(String),
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(msg) => write!(f, "job failed: {msg}"),
            Self::Panicked(msg) => write!(f, "job panicked: {msg}"),
        }
    }
}

/// Processes jobs taken off the pool.
#[async_trait]
pub trait JobHandler<J>: Send + Sync + 'static {
    async fn handle(&self, job: J) -> anyhow::Result<()>;

    /// Called after `handle` errored or panicked.  Must not panic itself.
    async fn on_failure(&self, job: J, failure: JobFailure);
}

/// Fixed-size pool of workers draining a bounded job channel.
pub struct WorkerPool<J> {
    sender: Mutex<Option<mpsc::Sender<J>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<J> WorkerPool<J>
where
    J: Clone + Debug + Send + 'static,
{
    pub fn start<H>(config: PoolConfig, handler: Arc<H>) -> Self
    where
        H: JobHandler<J>,
    {
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));

        let handles = (0..workers)
            .map(|index| tokio::spawn(worker_loop(index, rx.clone(), handler.clone())))
            .collect();

        info!(workers, capacity = config.capacity, "worker pool started");

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue a job, waiting for channel capacity if necessary.
    pub async fn submit(&self, job: J) -> Result<(), QueueError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| QueueError::Closed)?
            .clone()
            .ok_or(QueueError::Closed)?;
        sender.send(job).await.map_err(|_| QueueError::Closed)
    }

    /// Stop accepting jobs and wait for queued ones to drain.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handles = self
            .workers
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop<J, H>(
    index: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<J>>>,
    handler: Arc<H>,
) where
    J: Clone + Debug + Send + 'static,
    H: JobHandler<J>,
{
    loop {
        // Hold the receiver lock only while waiting for the next job.
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            debug!(worker = index, "job channel closed");
            break;
        };

        debug!(worker = index, ?job, "job picked up");

        let task = {
            let handler = handler.clone();
            let job = job.clone();
            tokio::spawn(async move { handler.handle(job).await })
        };

        let failure = match task.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(JobFailure::Error(format!("{e:#}"))),
            Err(join_err) => Some(JobFailure::Panicked(panic_message(join_err))),
        };

        if let Some(failure) = failure {
            warn!(worker = index, ?job, %failure, "job did not complete");
            handler.on_failure(job, failure).await;
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    #[derive(Debug, Clone, PartialEq)]
    enum Job {
        Ok(u32),
        Err(u32),
        Panic(u32),
    }

    struct Recorder {
        done: UnboundedSender<u32>,
        failed: UnboundedSender<(Job, JobFailure)>,
    }

    #[async_trait]
    impl JobHandler<Job> for Recorder {
        async fn handle(&self, job: Job) -> anyhow::Result<()> {
            match job {
                Job::Ok(n) => {
                    let _ = self.done.send(n);
                    Ok(())
                }
                Job::Err(n) => anyhow::bail!("job {n} refused"),
                Job::Panic(n) => panic!("job {n} exploded"),
            }
        }

        async fn on_failure(&self, job: Job, failure: JobFailure) {
            let _ = self.failed.send((job, failure));
        }
    }

    fn pool() -> (
        WorkerPool<Job>,
        mpsc::UnboundedReceiver<u32>,
        mpsc::UnboundedReceiver<(Job, JobFailure)>,
    ) {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (fail_tx, fail_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Recorder { done: done_tx, failed: fail_tx });
        let pool = WorkerPool::start(PoolConfig { workers: 2, capacity: 8 }, handler);
        (pool, done_rx, fail_rx)
    }

    #[tokio::test]
    async fn runs_submitted_jobs() {
        let (pool, mut done, _failed) = pool();
        for n in 0..5 {
            pool.submit(Job::Ok(n)).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(tokio::time::timeout(Duration::from_secs(1), done.recv()).await.unwrap().unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn errors_and_panics_reach_the_failure_hook() {
        let (pool, mut done, mut failed) = pool();
        pool.submit(Job::Err(1)).await.unwrap();
        pool.submit(Job::Panic(2)).await.unwrap();
        pool.submit(Job::Ok(3)).await.unwrap();

        let mut failures = Vec::new();
        for _ in 0..2 {
            failures.push(tokio::time::timeout(Duration::from_secs(1), failed.recv()).await.unwrap().unwrap());
        }
        failures.sort_by_key(|(job, _)| format!("{job:?}"));

        assert_eq!(failures[0].0, Job::Err(1));
        assert!(matches!(&failures[0].1, JobFailure::Error(m) if m.contains("refused")));
        assert_eq!(failures[1].0, Job::Panic(2));
        assert!(matches!(&failures[1].1, JobFailure::Panicked(m) if m.contains("exploded")));

        // Workers survive the panic.
        assert_eq!(tokio::time::timeout(Duration::from_secs(1), done.recv()).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let (pool, mut done, _failed) = pool();
        pool.submit(Job::Ok(7)).await.unwrap();
        pool.shutdown().await;

        assert_eq!(done.recv().await, Some(7));
        assert_eq!(pool.submit(Job::Ok(8)).await, Err(QueueError::Closed));
    }
}
