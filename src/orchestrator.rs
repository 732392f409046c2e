//! The conversion orchestrator: admission control, dispatch, status,
//! cancellation, results, and graceful shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ConvertError;
use crate::jobs::registry::{spawn_sweeper, JobRegistry, RegistryStats};
use crate::jobs::{
    ConversionOptions, ConversionReport, Job, JobFailure, JobSnapshot, JobStatus,
};
use crate::pipeline::{run_job, PipelineServices};
use crate::settings::Settings;

/// Drain window for graceful shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Result of a finished job: the report on success, the failure otherwise.
pub type JobOutcome = Result<ConversionReport, JobFailure>;

pub struct Orchestrator {
    settings: Arc<Settings>,
    registry: Arc<JobRegistry>,
    services: Arc<PipelineServices>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Builds the orchestrator, creates the storage roots, and starts the
    /// sweeper.
    ///
    /// # Errors
    ///
    /// Fails when the upload/output roots cannot be created.
    pub fn new(settings: Settings) -> Result<Self, ConvertError> {
        settings.ensure_roots().map_err(ConvertError::internal)?;

        let settings = Arc::new(settings);
        let registry = Arc::new(JobRegistry::new());
        let services = Arc::new(PipelineServices::new(
            Arc::clone(&settings),
            Arc::clone(&registry),
        ));
        let shutdown = CancellationToken::new();
        let sweeper = spawn_sweeper(
            Arc::clone(&registry),
            Duration::from_secs(settings.sweep_interval_seconds),
            chrono::Duration::hours(settings.retention_hours as i64),
            shutdown.clone(),
        );

        info!(
            max_concurrent = settings.max_concurrent,
            upload_root = %settings.upload_root.display(),
            "orchestrator ready"
        );
        Ok(Self {
            settings,
            registry,
            services,
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Probes every external tool once, logging versions.
    ///
    /// # Errors
    ///
    /// Returns the first probe failure; deployments without working tools
    /// should not accept jobs.
    pub async fn verify_tools(&self) -> Result<(), ConvertError> {
        let compiler = self.services.compile.probe().await?;
        info!(version = %compiler, "compiler verified");
        let converter = self.services.convert.probe().await?;
        info!(version = %converter, "converter verified");
        Ok(())
    }

    /// Admits a submission and schedules its execution.
    ///
    /// Admission and registry insertion happen under one lock; directory
    /// creation follows, and both succeed or the registration is rolled
    /// back. Dispatch never holds the admission lock.
    ///
    /// # Errors
    ///
    /// - [`ConvertError::CapacityExceeded`] at the concurrency cap.
    /// - [`ConvertError::UnsafeArchive`] for missing or oversized payloads.
    /// - [`ConvertError::Internal`] during shutdown or on I/O failure.
    pub async fn submit(
        &self,
        archive: &Path,
        options: ConversionOptions,
    ) -> Result<String, ConvertError> {
        if self.shutdown.is_cancelled() {
            return Err(ConvertError::Internal(
                "shutting down, not accepting submissions".to_string(),
            ));
        }

        let metadata = tokio::fs::metadata(archive)
            .await
            .map_err(|_| ConvertError::UnsafeArchive {
                reason: format!("archive not readable: {}", archive.display()),
            })?;
        if metadata.len() > self.settings.max_file_size_bytes {
            return Err(ConvertError::UnsafeArchive {
                reason: format!(
                    "archive of {} bytes exceeds the {} byte limit",
                    metadata.len(),
                    self.settings.max_file_size_bytes
                ),
            });
        }

        let job_id = Uuid::new_v4().to_string();
        let filename = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "submission.zip".to_string());
        let work_dir = self.settings.job_upload_dir(&job_id);
        let output_dir = self.settings.job_output_dir(&job_id);
        let cancel = CancellationToken::new();

        // Admission: the capacity check and insertion share one lock
        // acquisition inside `admit`.
        let job = Job::new(
            job_id.clone(),
            filename.clone(),
            work_dir.clone(),
            output_dir.clone(),
            options,
        );
        self.registry
            .admit(job, cancel.clone(), self.settings.max_concurrent)?;

        // Registration and directory creation succeed or fail together.
        if let Err(err) = self.materialize_dirs(archive, &work_dir, &output_dir, &filename).await {
            let _ = self.registry.remove(&job_id);
            let _ = tokio::fs::remove_dir_all(&work_dir).await;
            let _ = tokio::fs::remove_dir_all(&output_dir).await;
            return Err(err);
        }

        info!(job = %job_id, file = %filename, "job admitted");
        tokio::spawn(run_job(
            Arc::clone(&self.services),
            job_id.clone(),
            cancel,
        ));
        Ok(job_id)
    }

    async fn materialize_dirs(
        &self,
        archive: &Path,
        work_dir: &Path,
        output_dir: &Path,
        filename: &str,
    ) -> Result<(), ConvertError> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(ConvertError::internal)?;
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(ConvertError::internal)?;
        tokio::fs::copy(archive, work_dir.join(filename))
            .await
            .map_err(ConvertError::internal)?;
        Ok(())
    }

    /// A consistent snapshot of a job.
    ///
    /// # Errors
    ///
    /// [`ConvertError::NotFound`] for an unknown id.
    pub fn status(&self, job_id: &str) -> Result<JobSnapshot, ConvertError> {
        self.registry.snapshot(job_id)
    }

    /// Cancels a job. Idempotent; a no-op on terminal jobs.
    ///
    /// # Errors
    ///
    /// [`ConvertError::NotFound`] for an unknown id.
    pub fn cancel(&self, job_id: &str) -> Result<(), ConvertError> {
        let token = self.registry.cancel_token(job_id)?;
        self.registry.with_job(job_id, |job| {
            if job.status.is_terminal() {
                return;
            }
            token.cancel();
            // Pending or running both may move straight to cancelled; the
            // worker's later transition attempts lose benignly.
            if job.transition(JobStatus::Cancelled).is_ok() {
                if job.failure.is_none() {
                    job.failure = Some(JobFailure {
                        error: ConvertError::Cancelled,
                        stage: None,
                        suggestions: Vec::new(),
                        stderr: String::new(),
                    });
                }
                info!(job = %job_id, "job cancelled");
            }
        })
    }

    /// The outcome of a finished job.
    ///
    /// # Errors
    ///
    /// - [`ConvertError::NotFound`] for an unknown id.
    /// - [`ConvertError::NotReady`] while the job is pending or running.
    pub fn result(&self, job_id: &str) -> Result<JobOutcome, ConvertError> {
        let job = self.registry.get(job_id)?;
        match job.status {
            JobStatus::Pending | JobStatus::Running => {
                Err(ConvertError::NotReady(job_id.to_string()))
            }
            JobStatus::Completed => job
                .report
                .map(Ok)
                .ok_or_else(|| ConvertError::internal("completed job without a report")),
            JobStatus::Failed | JobStatus::Cancelled | JobStatus::Cleaned => Ok(Err(job
                .failure
                .unwrap_or_else(|| JobFailure {
                    error: ConvertError::internal("job ended without a failure record"),
                    stage: None,
                    suggestions: Vec::new(),
                    stderr: String::new(),
                }))),
        }
    }

    /// Packages a completed job's output into a download ZIP.
    ///
    /// # Errors
    ///
    /// - [`ConvertError::NotFound`] for an unknown id.
    /// - [`ConvertError::NotReady`] unless the job completed.
    pub fn package_download(&self, job_id: &str, zip_path: &Path) -> Result<(), ConvertError> {
        let job = self.registry.get(job_id)?;
        if job.status != JobStatus::Completed {
            return Err(ConvertError::NotReady(job_id.to_string()));
        }
        crate::download::package_output(&job.output_dir, zip_path)
    }

    #[must_use]
    pub fn list(&self, filter: Option<JobStatus>, limit: usize, offset: usize) -> Vec<Job> {
        self.registry.list(filter, limit, offset)
    }

    #[must_use]
    pub fn statistics(&self) -> RegistryStats {
        self.registry.stats()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Graceful shutdown: stop admissions and the sweeper, cancel running
    /// jobs, and wait up to the drain window for workers to settle.
    pub async fn shutdown(&self) {
        info!("shutdown requested, draining jobs");
        self.shutdown.cancel();

        for job in self.registry.list(None, usize::MAX, 0) {
            if job.status.is_active() {
                if let Err(err) = self.cancel(&job.id) {
                    warn!(job = %job.id, %err, "failed to cancel during shutdown");
                }
            }
        }

        let drain_started = std::time::Instant::now();
        while self.registry.active_count() > 0 && drain_started.elapsed() < SHUTDOWN_DRAIN {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if self.registry.active_count() > 0 {
            warn!("drain window elapsed with jobs still active");
        }

        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        info!("shutdown complete");
    }
}
