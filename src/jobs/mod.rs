//! Job data model: lifecycle states, stage records, options, and results.

pub mod registry;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConvertError, ErrorKind};

/// The fixed pipeline order.
pub const STAGE_SEQUENCE: [StageName; 5] = [
    StageName::Analyze,
    StageName::Compile,
    StageName::Convert,
    StageName::Postprocess,
    StageName::Validate,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Cleaned,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Cleaned
        )
    }

    /// Whether this job still counts against the admission cap.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// The §4.1 transition graph. No backward edges, `cancelled` supersedes
    /// stage outcomes, `cleaned` only follows another terminal state.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running | Self::Cancelled) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Cancelled) => true,
            (Self::Completed | Self::Failed | Self::Cancelled, Self::Cleaned) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Analyze,
    Compile,
    Convert,
    Postprocess,
    Validate,
}

impl StageName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Compile => "compile",
            Self::Convert => "convert",
            Self::Postprocess => "postprocess",
            Self::Validate => "validate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One stage's bookkeeping within a job.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub name: StageName,
    pub status: StageStatus,
    /// 0–100 within the stage.
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub diagnostics: BTreeMap<String, String>,
}

impl StageRecord {
    #[must_use]
    pub fn new(name: StageName) -> Self {
        Self {
            name,
            status: StageStatus::Pending,
            progress: 0,
            started_at: None,
            ended_at: None,
            error: None,
            diagnostics: BTreeMap::new(),
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = StageStatus::Running;
        self.started_at = Some(now);
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = StageStatus::Completed;
        self.progress = 100;
        self.ended_at = Some(now);
    }

    pub fn skip(&mut self, now: DateTime<Utc>, reason: &str) {
        self.status = StageStatus::Skipped;
        self.progress = 100;
        self.ended_at = Some(now);
        self.error = Some(reason.to_string());
    }

    pub fn fail(&mut self, now: DateTime<Utc>, error: &str) {
        self.status = StageStatus::Failed;
        self.ended_at = Some(now);
        self.error = Some(error.to_string());
    }

    /// Whether this stage contributes fully to overall progress.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.status, StageStatus::Completed | StageStatus::Skipped)
    }
}

/// Output format of a submission; only HTML is supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Html,
}

/// The closed options record a submission may carry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    pub skip_images: bool,
    /// Ceiling over the computed budget, in seconds.
    pub max_processing_time: Option<u64>,
    pub output_format: OutputFormat,
}

/// Result payload of a `completed` job.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub html_path: PathBuf,
    pub assets: Vec<PathBuf>,
    /// 0–100.
    pub score: u8,
    pub warnings: Vec<String>,
    pub diagnostics: BTreeMap<String, BTreeMap<String, String>>,
}

/// Failure payload of a `failed` (or cancelled) job.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub error: ConvertError,
    pub stage: Option<StageName>,
    pub suggestions: Vec<String>,
    /// Captured tool stderr, capped to 64 KiB.
    pub stderr: String,
}

impl JobFailure {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Consistent copy of a job handed to status callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub stages: Vec<StageRecord>,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A conversion job. Owned by the registry; mutations go through it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub submitted_filename: String,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub status: JobStatus,
    pub stages: Vec<StageRecord>,
    /// Computed wall-clock budget, zero until analysis sizes the input.
    pub budget_secs: u64,
    pub options: ConversionOptions,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<JobFailure>,
    pub report: Option<ConversionReport>,
    pub warnings: Vec<String>,
    /// Highest progress value ever reported, enforcing monotonicity.
    progress_floor: u8,
}

impl Job {
    #[must_use]
    pub fn new(
        id: String,
        submitted_filename: String,
        work_dir: PathBuf,
        output_dir: PathBuf,
        options: ConversionOptions,
    ) -> Self {
        Self {
            id,
            submitted_filename,
            work_dir,
            output_dir,
            status: JobStatus::Pending,
            stages: STAGE_SEQUENCE.map(StageRecord::new).to_vec(),
            budget_secs: 0,
            options,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure: None,
            report: None,
            warnings: Vec::new(),
            progress_floor: 0,
        }
    }

    /// Moves the job along the §4.1 graph.
    ///
    /// # Errors
    ///
    /// Returns `ConvertError::Internal` for an edge the graph does not
    /// allow; callers racing a cancellation treat that as benign.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), ConvertError> {
        if !self.status.can_transition_to(next) {
            return Err(ConvertError::Internal(format!(
                "illegal status transition {:?} -> {:?} for job {}",
                self.status, next, self.id
            )));
        }
        let now = Utc::now();
        self.status = next;
        match next {
            JobStatus::Running => self.started_at = Some(now),
            _ if next.is_terminal() && next != JobStatus::Cleaned => {
                self.completed_at = Some(now);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn stage_mut(&mut self, name: StageName) -> &mut StageRecord {
        let index = STAGE_SEQUENCE
            .iter()
            .position(|s| *s == name)
            .unwrap_or_default();
        &mut self.stages[index]
    }

    /// Overall progress, monotone non-decreasing across calls.
    ///
    /// Completed and skipped stages contribute equally; the running stage
    /// adds its own fraction; a time-based floor keeps long stages visibly
    /// advancing.
    pub fn observe_progress(&mut self, now: DateTime<Utc>) -> u8 {
        if self.status == JobStatus::Completed {
            self.progress_floor = 100;
            return 100;
        }

        let total = self.stages.len() as u32;
        let done = self.stages.iter().filter(|s| s.is_done()).count() as u32;
        let current = self
            .stages
            .iter()
            .find(|s| s.status == StageStatus::Running)
            .map_or(0, |s| u32::from(s.progress));
        let mut computed = (done * 100 + current) / total;

        let elapsed = (now - self.started_at.unwrap_or(self.created_at)).num_seconds();
        let floor = match elapsed {
            s if s >= 600 => 4,
            s if s >= 300 => 3,
            s if s >= 120 => 2,
            s if s >= 30 => 1,
            _ => 0,
        };
        computed = computed.max(floor).min(99);

        let progress = (computed as u8).max(self.progress_floor);
        self.progress_floor = progress;
        progress
    }

    #[must_use]
    pub fn status_message(&self) -> String {
        match self.status {
            JobStatus::Completed => "Conversion completed successfully".to_string(),
            JobStatus::Failed => {
                let stage = self
                    .failure
                    .as_ref()
                    .and_then(|f| f.stage)
                    .map_or("unknown stage", StageName::as_str);
                format!("Conversion failed at {stage}")
            }
            JobStatus::Cancelled => "Conversion cancelled".to_string(),
            JobStatus::Cleaned => "Job expired and its artifacts were removed".to_string(),
            JobStatus::Running => {
                let stage = self
                    .stages
                    .iter()
                    .find(|s| s.status == StageStatus::Running)
                    .map_or("next stage", |s| s.name.as_str());
                format!("Processing {stage}")
            }
            JobStatus::Pending => "Waiting to start".to_string(),
        }
    }

    #[must_use]
    pub fn snapshot(&mut self) -> JobSnapshot {
        let now = Utc::now();
        JobSnapshot {
            id: self.id.clone(),
            status: self.status,
            progress: self.observe_progress(now),
            stages: self.stages.clone(),
            message: self.status_message(),
            created_at: self.created_at,
            updated_at: now,
        }
    }

    /// Stage diagnostics keyed by stage name, for results and failures.
    #[must_use]
    pub fn collect_diagnostics(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.stages
            .iter()
            .filter(|s| !s.diagnostics.is_empty())
            .map(|s| (s.name.as_str().to_string(), s.diagnostics.clone()))
            .collect()
    }
}
