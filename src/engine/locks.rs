use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;
use uuid::Uuid;

/// Per-job execution lock: at most one worker drives a given job.
#[derive(Clone, Default)]
pub struct JobLockMap {
    locks: Arc<DashMap<Uuid, Instant>>,
}

/// Releases the job's lock when dropped.
pub struct JobLockGuard {
    map: JobLockMap,
    job_id: Uuid,
}

impl JobLockGuard {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        if let Some((_, since)) = self.map.locks.remove(&self.job_id) {
            debug!(job_id = %self.job_id, held = ?since.elapsed(), "Released job lock");
        }
    }
}

impl JobLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when another worker already holds the job.
    pub fn try_lock(&self, job_id: Uuid) -> Option<JobLockGuard> {
        match self.locks.entry(job_id) {
            Entry::Occupied(entry) => {
                debug!(job_id = %job_id, held = ?entry.get().elapsed(), "Job already locked");
                None
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                debug!(job_id = %job_id, "Acquired job lock");
                Some(JobLockGuard {
                    map: self.clone(),
                    job_id,
                })
            }
        }
    }

    pub fn is_locked(&self, job_id: Uuid) -> bool {
        self.locks.contains_key(&job_id)
    }

    pub fn held(&self) -> usize {
        self.locks.len()
    }
}
