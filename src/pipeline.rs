//! Stage sequencing for one job.
//!
//! Stages run strictly in order: analyze → compile → convert → postprocess
//! → validate. Only a compile failure is recoverable (the stage is skipped);
//! everything else fails the job. Cancellation supersedes stage outcomes and
//! the computed budget is enforced as a collective deadline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use postprocess_html::{PostProcessOptions, PostProcessor};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::analyze::ProjectAnalyzer;
use crate::archive::{extract_archive, ExtractLimits};
use crate::budget::BudgetCalculator;
use crate::error::{cap_stderr, suggestions_for, ConvertError};
use crate::jobs::registry::JobRegistry;
use crate::jobs::{ConversionReport, JobFailure, JobStatus, StageName};
use crate::packages::PackageInstaller;
use crate::settings::Settings;
use crate::stages::compile::CompileStage;
use crate::stages::convert::ConvertStage;

/// Everything a job worker needs, shared across jobs.
pub struct PipelineServices {
    pub settings: Arc<Settings>,
    pub registry: Arc<JobRegistry>,
    pub analyzer: ProjectAnalyzer,
    pub compile: CompileStage,
    pub convert: ConvertStage,
    pub installer: PackageInstaller,
    pub budget: BudgetCalculator,
    pub postprocessor: PostProcessor,
}

impl PipelineServices {
    #[must_use]
    pub fn new(settings: Arc<Settings>, registry: Arc<JobRegistry>) -> Self {
        Self {
            analyzer: ProjectAnalyzer::default(),
            compile: CompileStage::new(&settings.compiler_path),
            convert: ConvertStage::new(&settings.converter_path),
            installer: PackageInstaller::new(&settings.package_installer_path),
            budget: BudgetCalculator::new(
                settings.default_timeout_seconds,
                settings.max_timeout_seconds,
            ),
            postprocessor: PostProcessor::new(),
            settings,
            registry,
        }
    }
}

struct StageFailure {
    stage: StageName,
    error: ConvertError,
    stderr: String,
}

impl StageFailure {
    fn new(stage: StageName, error: ConvertError) -> Self {
        Self {
            stage,
            error,
            stderr: String::new(),
        }
    }
}

/// Runs one job to a terminal state. Spawned as its own task per job.
pub async fn run_job(services: Arc<PipelineServices>, job_id: String, cancel: CancellationToken) {
    info!(job = %job_id, "worker starting");
    let outcome = execute(&services, &job_id, &cancel).await;
    finalize(&services.registry, &job_id, outcome);
    services.registry.record_outcome(&job_id);
}

async fn execute(
    services: &Arc<PipelineServices>,
    job_id: &str,
    cancel: &CancellationToken,
) -> Result<ConversionReport, StageFailure> {
    let registry = &services.registry;
    let cancelled = |stage: StageName| StageFailure::new(stage, ConvertError::Cancelled);

    if cancel.is_cancelled() {
        return Err(cancelled(StageName::Analyze));
    }
    let started_running = registry
        .with_job(job_id, |job| job.transition(JobStatus::Running))
        .map_err(|e| StageFailure::new(StageName::Analyze, e))?;
    if started_running.is_err() {
        // Cancelled between admission and dispatch.
        return Err(cancelled(StageName::Analyze));
    }

    let (work_dir, output_dir, submitted, options) = registry
        .with_job(job_id, |job| {
            (
                job.work_dir.clone(),
                job.output_dir.clone(),
                job.submitted_filename.clone(),
                job.options.clone(),
            )
        })
        .map_err(|e| StageFailure::new(StageName::Analyze, e))?;

    // ── analyze ─────────────────────────────────────────────────────────
    stage_start(registry, job_id, StageName::Analyze);
    let archive_path = work_dir.join(&submitted);
    let extracted = work_dir.join("extracted");

    extract_archive(&archive_path, &extracted, ExtractLimits::default())
        .await
        .map_err(|e| StageFailure::new(StageName::Analyze, e))?;
    stage_progress(registry, job_id, StageName::Analyze, 40);

    let project = {
        let services = Arc::clone(services);
        let root = extracted.clone();
        tokio::task::spawn_blocking(move || services.analyzer.analyze(&root))
            .await
            .map_err(|e| StageFailure::new(StageName::Analyze, ConvertError::internal(e)))?
            .map_err(|e| StageFailure::new(StageName::Analyze, e))?
    };
    stage_progress(registry, job_id, StageName::Analyze, 60);

    let plan = {
        let services = Arc::clone(services);
        let root = extracted.clone();
        tokio::task::spawn_blocking(move || services.budget.plan(&root))
            .await
            .map_err(|e| StageFailure::new(StageName::Analyze, ConvertError::internal(e)))?
    };
    let total_secs = options
        .max_processing_time
        .map_or(plan.total_secs, |ceiling| plan.total_secs.min(ceiling));
    let convert_secs = (total_secs as f64 * 0.6) as u64;
    let deadline = Instant::now() + Duration::from_secs(total_secs);
    let _ = registry.with_job(job_id, |job| job.budget_secs = total_secs);
    stage_progress(registry, job_id, StageName::Analyze, 80);

    let installed = services.installer.ensure(&project.packages, cancel).await;
    let mut analyze_diag = BTreeMap::new();
    analyze_diag.insert(
        "main_file".to_string(),
        project.main_file.display().to_string(),
    );
    if let Some(class) = &project.document_class {
        analyze_diag.insert("document_class".to_string(), class.clone());
    }
    if !project.custom_class_names().is_empty() {
        analyze_diag.insert(
            "custom_classes".to_string(),
            project.custom_class_names().join(", "),
        );
    }
    analyze_diag.insert("packages".to_string(), project.packages.join(", "));
    analyze_diag.insert("budget_secs".to_string(), total_secs.to_string());
    if !installed.failed.is_empty() {
        analyze_diag.insert(
            "packages_unavailable".to_string(),
            installed.failed.join(", "),
        );
    }
    if !installed.installed.is_empty() {
        analyze_diag.insert("packages_installed".to_string(), installed.installed.join(", "));
    }
    stage_complete(registry, job_id, StageName::Analyze, analyze_diag, Vec::new());

    // ── compile ─────────────────────────────────────────────────────────
    check_boundary(cancel, deadline, total_secs, StageName::Compile)?;
    stage_start(registry, job_id, StageName::Compile);
    let compile_timeout = remaining(deadline).min(Duration::from_secs(
        total_secs.saturating_sub(convert_secs).max(30),
    ));
    let compiled = services
        .compile
        .run(
            &project.main_file,
            &output_dir.join("compiler"),
            compile_timeout,
            cancel,
        )
        .await
        .map_err(|e| StageFailure::new(StageName::Compile, e))?;
    if compiled.cancelled {
        return Err(cancelled(StageName::Compile));
    }
    if compiled.success {
        stage_complete(
            registry,
            job_id,
            StageName::Compile,
            compiled.diagnostics,
            compiled.warnings,
        );
    } else {
        // Recoverable: the converter works from source, not the PDF.
        warn!(job = %job_id, "compilation failed, skipping stage");
        stage_skip(
            registry,
            job_id,
            StageName::Compile,
            "compilation failed, stage skipped",
            compiled.diagnostics,
        );
        let _ = registry.with_job(job_id, |job| {
            job.warnings.push("compilation skipped".to_string());
        });
    }

    // ── convert ─────────────────────────────────────────────────────────
    check_boundary(cancel, deadline, total_secs, StageName::Convert)?;
    stage_start(registry, job_id, StageName::Convert);
    let convert_timeout = remaining(deadline).min(Duration::from_secs(convert_secs.max(30)));
    let converter_html = output_dir.join("converter").join(format!(
        "{}.html",
        project
            .main_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string())
    ));
    let converted = match services
        .convert
        .run(&project, &converter_html, convert_timeout, cancel)
        .await
    {
        Ok(outcome) => outcome,
        Err(failure) => {
            stage_set_diagnostics(registry, job_id, StageName::Convert, failure.diagnostics);
            return Err(StageFailure {
                stage: StageName::Convert,
                error: failure.error,
                stderr: failure.stderr,
            });
        }
    };
    stage_complete(
        registry,
        job_id,
        StageName::Convert,
        converted.diagnostics,
        converted.warnings,
    );

    // ── postprocess ─────────────────────────────────────────────────────
    check_boundary(cancel, deadline, total_secs, StageName::Postprocess)?;
    stage_start(registry, job_id, StageName::Postprocess);
    let final_html = output_dir.join("final.html");
    let assets_dir = output_dir.join("assets");
    let post_options = PostProcessOptions {
        skip_assets: options.skip_images,
        tools: Some(services.settings.asset_tools()),
    };
    let post_report = services
        .postprocessor
        .process_file(&converted.html, &final_html, &assets_dir, &post_options, cancel)
        .await
        .map_err(|e| {
            StageFailure::new(
                StageName::Postprocess,
                ConvertError::PostProcessingFailure {
                    message: e.to_string(),
                },
            )
        })?;
    if cancel.is_cancelled() {
        return Err(cancelled(StageName::Postprocess));
    }
    let mut post_diag = BTreeMap::new();
    post_diag.insert(
        "headings_cleaned".to_string(),
        post_report.headings_cleaned.to_string(),
    );
    post_diag.insert(
        "citations_repaired".to_string(),
        post_report.citations_repaired.to_string(),
    );
    post_diag.insert(
        "equations_merged".to_string(),
        post_report.equations_merged.to_string(),
    );
    post_diag.insert(
        "scripts_removed".to_string(),
        post_report.scripts_removed.to_string(),
    );
    post_diag.insert(
        "assets_converted".to_string(),
        post_report.assets_converted.len().to_string(),
    );
    if !post_report.asset_failures.is_empty() {
        post_diag.insert(
            "asset_failures".to_string(),
            post_report.asset_failures.join("; "),
        );
    }
    stage_complete(
        registry,
        job_id,
        StageName::Postprocess,
        post_diag,
        post_report.warnings.clone(),
    );

    // ── validate ────────────────────────────────────────────────────────
    check_boundary(cancel, deadline, total_secs, StageName::Validate)?;
    stage_start(registry, job_id, StageName::Validate);
    let final_size = std::fs::metadata(&final_html).map(|m| m.len()).unwrap_or(0);
    if final_size == 0 {
        return Err(StageFailure::new(
            StageName::Validate,
            ConvertError::Internal("final HTML output is missing or empty".to_string()),
        ));
    }

    let assets = list_assets(&output_dir, &assets_dir);
    let compile_skipped = registry
        .with_job(job_id, |job| {
            job.stages
                .iter()
                .any(|s| s.name == StageName::Compile && s.status == crate::jobs::StageStatus::Skipped)
        })
        .unwrap_or(false);
    let score = quality_score(
        final_size,
        compile_skipped,
        post_report.warnings.len() + post_report.asset_failures.len(),
        post_report.parse_fallback,
    );
    let mut validate_diag = BTreeMap::new();
    validate_diag.insert("final_size".to_string(), final_size.to_string());
    validate_diag.insert("score".to_string(), score.to_string());
    stage_complete(registry, job_id, StageName::Validate, validate_diag, Vec::new());

    let (warnings, diagnostics) = registry
        .with_job(job_id, |job| {
            let mut warnings = job.warnings.clone();
            for stage in &job.stages {
                for warning in stage.diagnostics.get("warnings").iter().flat_map(|w| w.lines()) {
                    warnings.push(warning.to_string());
                }
            }
            (warnings, job.collect_diagnostics())
        })
        .map_err(|e| StageFailure::new(StageName::Validate, e))?;

    Ok(ConversionReport {
        html_path: final_html,
        assets,
        score,
        warnings,
        diagnostics,
    })
}

fn finalize(
    registry: &JobRegistry,
    job_id: &str,
    outcome: Result<ConversionReport, StageFailure>,
) {
    let result = registry.with_job(job_id, |job| match &outcome {
        Ok(report) => {
            job.report = Some(report.clone());
            if job.transition(JobStatus::Completed).is_ok() {
                info!(job = %job_id, score = report.score, "job completed");
            }
        }
        Err(failure) => {
            let target = if matches!(failure.error, ConvertError::Cancelled) {
                JobStatus::Cancelled
            } else {
                JobStatus::Failed
            };
            job.failure = Some(JobFailure {
                error: failure.error.clone(),
                stage: Some(failure.stage),
                suggestions: suggestions_for(&failure.stderr),
                stderr: cap_stderr(&failure.stderr),
            });
            if target == JobStatus::Failed {
                let now = Utc::now();
                let record = job.stage_mut(failure.stage);
                if matches!(
                    record.status,
                    crate::jobs::StageStatus::Running | crate::jobs::StageStatus::Pending
                ) {
                    record.fail(now, &failure.error.to_string());
                }
            }
            // The cancel path may have already flipped the status; that
            // transition losing the race is expected.
            if job.transition(target).is_ok() {
                warn!(job = %job_id, stage = failure.stage.as_str(), error = %failure.error, "job did not complete");
            }
        }
    });
    if let Err(err) = result {
        warn!(job = %job_id, %err, "job vanished before finalization");
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn check_boundary(
    cancel: &CancellationToken,
    deadline: Instant,
    budget_secs: u64,
    stage: StageName,
) -> Result<(), StageFailure> {
    if cancel.is_cancelled() {
        return Err(StageFailure::new(stage, ConvertError::Cancelled));
    }
    if remaining(deadline).is_zero() {
        return Err(StageFailure::new(
            stage,
            ConvertError::TimeoutExceeded { budget_secs },
        ));
    }
    Ok(())
}

/// Paths under the assets directory, relative to the output directory.
fn list_assets(output_dir: &Path, assets_dir: &Path) -> Vec<PathBuf> {
    let mut assets: Vec<PathBuf> = WalkDir::new(assets_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(output_dir)
                .map(Path::to_path_buf)
                .ok()
        })
        .collect();
    assets.sort();
    assets
}

fn quality_score(
    final_size: u64,
    compile_skipped: bool,
    warning_count: usize,
    parse_fallback: bool,
) -> u8 {
    let mut score: i32 = 100;
    if compile_skipped {
        score -= 10;
    }
    if parse_fallback {
        score -= 25;
    }
    score -= (warning_count.min(10) * 2) as i32;
    if final_size < 64 {
        score -= 25;
    }
    score.clamp(0, 100) as u8
}

fn stage_start(registry: &JobRegistry, job_id: &str, name: StageName) {
    let _ = registry.with_job(job_id, |job| job.stage_mut(name).start(Utc::now()));
}

fn stage_progress(registry: &JobRegistry, job_id: &str, name: StageName, progress: u8) {
    let _ = registry.with_job(job_id, |job| {
        let record = job.stage_mut(name);
        record.progress = record.progress.max(progress.min(100));
    });
}

fn stage_complete(
    registry: &JobRegistry,
    job_id: &str,
    name: StageName,
    diagnostics: BTreeMap<String, String>,
    warnings: Vec<String>,
) {
    let _ = registry.with_job(job_id, |job| {
        let record = job.stage_mut(name);
        record.diagnostics.extend(diagnostics);
        if !warnings.is_empty() {
            record
                .diagnostics
                .insert("warnings".to_string(), warnings.join("\n"));
        }
        record.complete(Utc::now());
    });
}

fn stage_skip(
    registry: &JobRegistry,
    job_id: &str,
    name: StageName,
    reason: &str,
    diagnostics: BTreeMap<String, String>,
) {
    let _ = registry.with_job(job_id, |job| {
        let record = job.stage_mut(name);
        record.diagnostics.extend(diagnostics);
        record.skip(Utc::now(), reason);
    });
}

fn stage_set_diagnostics(
    registry: &JobRegistry,
    job_id: &str,
    name: StageName,
    diagnostics: BTreeMap<String, String>,
) {
    let _ = registry.with_job(job_id, |job| {
        job.stage_mut(name).diagnostics.extend(diagnostics);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_score_rewards_clean_small_documents() {
        // The happy-path scenario: tiny clean input still scores ≥ 90.
        assert!(quality_score(4096, false, 0, false) >= 90);
    }

    #[test]
    fn quality_score_penalizes_degradation() {
        assert_eq!(quality_score(4096, true, 0, false), 90);
        assert!(quality_score(4096, true, 5, false) < 90);
        assert!(quality_score(4096, false, 0, true) <= 75);
        assert_eq!(quality_score(0, true, 10, true), 20);
    }

    #[test]
    fn boundary_check_reports_timeout_and_cancellation() {
        let token = CancellationToken::new();
        let past = Instant::now() - Duration::from_secs(1);
        let err = check_boundary(&token, past, 600, StageName::Convert).unwrap_err();
        assert!(matches!(err.error, ConvertError::TimeoutExceeded { .. }));

        token.cancel();
        let future = Instant::now() + Duration::from_secs(60);
        let err = check_boundary(&token, future, 600, StageName::Convert).unwrap_err();
        assert!(matches!(err.error, ConvertError::Cancelled));
    }
}
