//! Worker pool and watchdog.
//!
//! Workers are interchangeable tasks pulling job ids off one shared queue.
//! They hold nothing between jobs: each id is handed to
//! `Orchestrator::run_job`, which reloads the job from the store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::orchestrator::Orchestrator;

pub type JobReceiver = mpsc::UnboundedReceiver<Uuid>;

/// The queue the orchestrator pushes job ids into.
pub fn job_queue() -> (mpsc::UnboundedSender<Uuid>, JobReceiver) {
    mpsc::unbounded_channel()
}

pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    receiver: Arc<Mutex<JobReceiver>>,
    workers: usize,
    watchdog_interval: Duration,
    shutdown: CancellationToken,
}

/// Running pool; dropping it does not stop the tasks, `shutdown` does.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<Orchestrator>, receiver: JobReceiver) -> Self {
        let config = orchestrator.config();
        Self {
            workers: config.workers.max(1),
            watchdog_interval: config.watchdog_interval,
            orchestrator,
            receiver: Arc::new(Mutex::new(receiver)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Re-queue every job that was not terminal when the engine last
    /// stopped. Returns how many were queued.
    pub async fn resume(&self) -> Result<usize> {
        let active = self.orchestrator.db().call(|db| db.list_active_jobs()).await?;
        for job in &active {
            debug!(job_id = %job.id, status = %job.status, "Resuming job");
            self.orchestrator.enqueue(job.id);
        }
        if !active.is_empty() {
            info!(count = active.len(), "Resumed unfinished jobs");
        }
        Ok(active.len())
    }

    /// Spawn the workers and the watchdog.
    pub fn start(self) -> WorkerHandle {
        let mut tasks = Vec::with_capacity(self.workers + 1);
        for worker_id in 0..self.workers {
            tasks.push(tokio::spawn(worker_loop(
                worker_id,
                self.orchestrator.clone(),
                self.receiver.clone(),
                self.shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(watchdog_loop(
            self.orchestrator.clone(),
            self.watchdog_interval,
            self.shutdown.clone(),
        )));
        info!(workers = self.workers, "Worker pool started");
        WorkerHandle {
            shutdown: self.shutdown,
            tasks,
        }
    }
}

impl WorkerHandle {
    /// Stop taking new jobs and wait for the tasks to exit. A job in flight
    /// is abandoned where it stands and resumes on the next start.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    orchestrator: Arc<Orchestrator>,
    receiver: Arc<Mutex<JobReceiver>>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => None,
            id = async { receiver.lock().await.recv().await } => id,
        };
        let Some(job_id) = next else {
            debug!(worker_id, "Worker exiting");
            return;
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                warn!(worker_id, job_id = %job_id, "Shutdown while running job");
                return;
            }
            result = orchestrator.run_job(job_id) => match result {
                Ok(status) => debug!(worker_id, job_id = %job_id, %status, "Worker finished job"),
                Err(e) => error!(worker_id, job_id = %job_id, error = %e, "Job run failed"),
            },
        }
    }
}

async fn watchdog_loop(orchestrator: Arc<Orchestrator>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                match orchestrator.watchdog_scan().await {
                    Ok(ids) if !ids.is_empty() => warn!(count = ids.len(), "Watchdog timed out jobs"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Watchdog scan failed"),
                }
            }
        }
    }
}
