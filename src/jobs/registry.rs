//! In-memory job registry.
//!
//! One mutex guards the job map, the admission count, and the statistics,
//! keeping the invariant that the count of active jobs and registry contents
//! always agree. The sweeper takes the lock only to flip terminal jobs to
//! `cleaned`; directory deletion happens outside it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ConvertError;
use crate::jobs::{Job, JobSnapshot, JobStatus};

/// Aggregate counters, exposed through the orchestrator.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RegistryStats {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
    pub cleaned_jobs: u64,
    pub total_processing_secs: u64,
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, JobEntry>,
    stats: RegistryStats,
}

/// Thread-safe mapping from job id to job record.
#[derive(Default)]
pub struct JobRegistry {
    inner: Mutex<RegistryInner>,
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new job with its cancellation token.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when the id already exists; ids come from a UUID
    /// source so a collision is an invariant violation.
    pub fn insert(&self, job: Job, cancel: CancellationToken) -> Result<(), ConvertError> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(ConvertError::Internal(format!(
                "duplicate job id {}",
                job.id
            )));
        }
        inner.stats.total_jobs += 1;
        inner.jobs.insert(job.id.clone(), JobEntry { job, cancel });
        Ok(())
    }

    /// Admission-controlled insert: the active-job count check and the
    /// insertion happen under one lock acquisition.
    ///
    /// # Errors
    ///
    /// - [`ConvertError::CapacityExceeded`] when `limit` active jobs exist.
    /// - [`ConvertError::Internal`] on a duplicate id.
    pub fn admit(
        &self,
        job: Job,
        cancel: CancellationToken,
        limit: usize,
    ) -> Result<(), ConvertError> {
        let mut inner = self.inner.lock();
        let active = inner
            .jobs
            .values()
            .filter(|e| e.job.status.is_active())
            .count();
        if active >= limit {
            return Err(ConvertError::CapacityExceeded { limit });
        }
        if inner.jobs.contains_key(&job.id) {
            return Err(ConvertError::Internal(format!(
                "duplicate job id {}",
                job.id
            )));
        }
        inner.stats.total_jobs += 1;
        inner.jobs.insert(job.id.clone(), JobEntry { job, cancel });
        Ok(())
    }

    /// Count of jobs holding an admission slot (`pending` or `running`).
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|e| e.job.status.is_active())
            .count()
    }

    /// Runs `f` against a job under the registry lock.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn with_job<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Job) -> R,
    ) -> Result<R, ConvertError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| ConvertError::NotFound(id.to_string()))?;
        Ok(f(&mut entry.job))
    }

    /// Clone of the full job record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn get(&self, id: &str) -> Result<Job, ConvertError> {
        self.with_job(id, |job| job.clone())
    }

    /// Consistent status snapshot; updates the monotone progress floor.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn snapshot(&self, id: &str) -> Result<JobSnapshot, ConvertError> {
        self.with_job(id, Job::snapshot)
    }

    /// The job's cancellation token.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn cancel_token(&self, id: &str) -> Result<CancellationToken, ConvertError> {
        let inner = self.inner.lock();
        inner
            .jobs
            .get(id)
            .map(|e| e.cancel.clone())
            .ok_or_else(|| ConvertError::NotFound(id.to_string()))
    }

    /// Jobs matching `filter`, newest first, paginated.
    #[must_use]
    pub fn list(&self, filter: Option<JobStatus>, limit: usize, offset: usize) -> Vec<Job> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|e| filter.is_none_or(|status| e.job.status == status))
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.into_iter().skip(offset).take(limit).collect()
    }

    #[must_use]
    pub fn count(&self, filter: Option<JobStatus>) -> usize {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|e| filter.is_none_or(|status| e.job.status == status))
            .count()
    }

    /// Removes a job record entirely.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn remove(&self, id: &str) -> Result<Job, ConvertError> {
        self.inner
            .lock()
            .jobs
            .remove(id)
            .map(|e| e.job)
            .ok_or_else(|| ConvertError::NotFound(id.to_string()))
    }

    /// Records a finished run in the aggregate counters.
    pub fn record_outcome(&self, id: &str) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.jobs.get(id) else {
            return;
        };
        let status = entry.job.status;
        let elapsed = match (entry.job.started_at, entry.job.completed_at) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0) as u64,
            _ => 0,
        };
        match status {
            JobStatus::Completed => inner.stats.completed_jobs += 1,
            JobStatus::Failed => inner.stats.failed_jobs += 1,
            JobStatus::Cancelled => inner.stats.cancelled_jobs += 1,
            _ => return,
        }
        inner.stats.total_processing_secs += elapsed;
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.inner.lock().stats
    }

    /// Flips terminal jobs older than `retention` to `cleaned` and returns
    /// the directories to delete. Deletion is the caller's job, outside the
    /// lock.
    #[must_use]
    pub fn sweep(&self, retention: chrono::Duration) -> Vec<(String, PathBuf, PathBuf)> {
        let cutoff = Utc::now() - retention;
        let mut reclaimable = Vec::new();
        let mut inner = self.inner.lock();
        let mut cleaned = 0;
        for entry in inner.jobs.values_mut() {
            let job = &mut entry.job;
            if !job.status.is_terminal() || job.status == JobStatus::Cleaned {
                continue;
            }
            let Some(completed_at) = job.completed_at else {
                continue;
            };
            if completed_at >= cutoff {
                continue;
            }
            if job.transition(JobStatus::Cleaned).is_ok() {
                cleaned += 1;
                reclaimable.push((job.id.clone(), job.work_dir.clone(), job.output_dir.clone()));
            }
        }
        inner.stats.cleaned_jobs += cleaned;
        reclaimable
    }
}

/// Spawns the background sweeper. It wakes every `interval`, reclaims
/// expired jobs, and stops when `shutdown` fires.
pub fn spawn_sweeper(
    registry: Arc<JobRegistry>,
    interval: Duration,
    retention: chrono::Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh boot does not
        // sweep before anything can exist.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let reclaimed = registry.sweep(retention);
            for (id, work_dir, output_dir) in reclaimed {
                info!(job = %id, "sweeping expired job artifacts");
                for dir in [work_dir, output_dir] {
                    if dir.exists() {
                        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                            // The record stays `cleaned` either way.
                            warn!(job = %id, dir = %dir.display(), %err, "failed to delete job directory");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::ConversionOptions;

    fn sample_job(id: &str) -> Job {
        Job::new(
            id.to_string(),
            "a.zip".to_string(),
            PathBuf::from(format!("/tmp/u/{id}")),
            PathBuf::from(format!("/tmp/o/{id}")),
            ConversionOptions::default(),
        )
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let registry = JobRegistry::new();
        registry
            .insert(sample_job("a"), CancellationToken::new())
            .unwrap();
        assert!(registry
            .insert(sample_job("a"), CancellationToken::new())
            .is_err());
        assert_eq!(registry.count(None), 1);
    }

    #[test]
    fn admit_enforces_the_concurrency_cap() {
        let registry = JobRegistry::new();
        registry
            .admit(sample_job("a"), CancellationToken::new(), 2)
            .unwrap();
        registry
            .admit(sample_job("b"), CancellationToken::new(), 2)
            .unwrap();
        let err = registry
            .admit(sample_job("c"), CancellationToken::new(), 2)
            .unwrap_err();
        assert!(matches!(err, ConvertError::CapacityExceeded { limit: 2 }));
        assert_eq!(registry.count(None), 2);

        // A finished job frees its slot.
        registry
            .with_job("a", |job| {
                job.transition(JobStatus::Running).unwrap();
                job.transition(JobStatus::Completed).unwrap();
            })
            .unwrap();
        assert!(registry
            .admit(sample_job("c"), CancellationToken::new(), 2)
            .is_ok());
    }

    #[test]
    fn active_count_tracks_lifecycle() {
        let registry = JobRegistry::new();
        registry
            .insert(sample_job("a"), CancellationToken::new())
            .unwrap();
        registry
            .insert(sample_job("b"), CancellationToken::new())
            .unwrap();
        assert_eq!(registry.active_count(), 2);

        registry
            .with_job("a", |job| {
                job.transition(JobStatus::Running).unwrap();
                job.transition(JobStatus::Completed).unwrap();
            })
            .unwrap();
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn list_is_newest_first_and_paginated() {
        let registry = JobRegistry::new();
        for id in ["a", "b", "c"] {
            let mut job = sample_job(id);
            job.created_at = Utc::now()
                + chrono::Duration::milliseconds(i64::from(id.as_bytes()[0]));
            registry.insert(job, CancellationToken::new()).unwrap();
        }
        let page = registry.list(None, 2, 0);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "c");
        let rest = registry.list(None, 2, 2);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "a");
    }

    #[test]
    fn sweep_reclaims_only_expired_terminal_jobs() {
        let registry = JobRegistry::new();
        for id in ["old", "fresh", "active"] {
            registry
                .insert(sample_job(id), CancellationToken::new())
                .unwrap();
        }
        registry
            .with_job("old", |job| {
                job.transition(JobStatus::Running).unwrap();
                job.transition(JobStatus::Completed).unwrap();
                job.completed_at = Some(Utc::now() - chrono::Duration::hours(48));
            })
            .unwrap();
        registry
            .with_job("fresh", |job| {
                job.transition(JobStatus::Running).unwrap();
                job.transition(JobStatus::Failed).unwrap();
            })
            .unwrap();
        registry
            .with_job("active", |job| {
                job.transition(JobStatus::Running).unwrap();
            })
            .unwrap();

        let reclaimed = registry.sweep(chrono::Duration::hours(24));
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].0, "old");
        assert_eq!(
            registry.get("old").unwrap().status,
            JobStatus::Cleaned
        );
        assert_eq!(registry.get("fresh").unwrap().status, JobStatus::Failed);
        assert_eq!(registry.get("active").unwrap().status, JobStatus::Running);

        // A second sweep finds nothing new.
        assert!(registry.sweep(chrono::Duration::hours(24)).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sweeper_task_flips_status_and_deletes_directories() {
        let base = tempfile::tempdir().unwrap();
        let work_dir = base.path().join("uploads/j");
        let output_dir = base.path().join("outputs/j");
        std::fs::create_dir_all(&work_dir).unwrap();
        std::fs::create_dir_all(&output_dir).unwrap();

        let registry = Arc::new(JobRegistry::new());
        let mut job = Job::new(
            "j".to_string(),
            "a.zip".to_string(),
            work_dir.clone(),
            output_dir.clone(),
            ConversionOptions::default(),
        );
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        job.completed_at = Some(Utc::now() - chrono::Duration::hours(48));
        registry.insert(job, CancellationToken::new()).unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn_sweeper(
            Arc::clone(&registry),
            Duration::from_millis(20),
            chrono::Duration::hours(24),
            shutdown.clone(),
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = registry.get("j").unwrap().status;
            if status == JobStatus::Cleaned && !work_dir.exists() && !output_dir.exists() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "sweeper never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        let _ = handle.await;
    }

    #[test]
    fn outcome_counters_accumulate() {
        let registry = JobRegistry::new();
        registry
            .insert(sample_job("a"), CancellationToken::new())
            .unwrap();
        registry
            .with_job("a", |job| {
                job.transition(JobStatus::Running).unwrap();
                job.transition(JobStatus::Completed).unwrap();
            })
            .unwrap();
        registry.record_outcome("a");
        let stats = registry.stats();
        assert_eq!(stats.total_jobs, 1);
        assert_eq!(stats.completed_jobs, 1);
    }
}
