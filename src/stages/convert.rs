//! TeX→HTML conversion through latexmlc.
//!
//! The converter gets a `--path` entry for every directory the project's
//! sources might resolve includes from: the project root, ancestors of each
//! supporting source directory (up to five levels), and every walked
//! subdirectory. A non-zero exit is fatal to the job; the captured
//! diagnostics include the classified cause.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use run_process::{ProcessRunner, RunRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::analyze::ProjectStructure;
use crate::error::{cap_stderr, ConvertError};

/// Modules preloaded on every conversion.
const PRELOAD_MODULES: &[&str] = &["amsmath", "amssymb", "graphicx", "overpic"];

/// How far above a supporting source directory search paths may reach.
const MAX_ANCESTOR_LEVELS: usize = 5;

/// Subdirectory walk bound when collecting search paths.
const SEARCH_WALK_DEPTH: usize = 8;

#[derive(Debug, Clone)]
pub struct ConvertOutcome {
    pub html: PathBuf,
    pub warnings: Vec<String>,
    pub diagnostics: BTreeMap<String, String>,
}

/// A failed conversion, carrying everything the failure record needs.
#[derive(Debug, Clone)]
pub struct ConvertStageFailure {
    pub error: ConvertError,
    pub stderr: String,
    pub diagnostics: BTreeMap<String, String>,
}

impl ConvertStageFailure {
    fn new(error: ConvertError, stderr: &str, diagnostics: BTreeMap<String, String>) -> Self {
        Self {
            error,
            stderr: cap_stderr(stderr),
            diagnostics,
        }
    }
}

pub struct ConvertStage {
    converter: String,
    runner: ProcessRunner,
}

impl ConvertStage {
    #[must_use]
    pub fn new(converter_path: &str) -> Self {
        Self {
            converter: converter_path.to_string(),
            runner: ProcessRunner::new([converter_path.to_string()]),
        }
    }

    /// Verifies the converter executable answers `--VERSION`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when the tool is absent or broken.
    pub async fn probe(&self) -> Result<String, ConvertError> {
        let outcome = self
            .runner
            .run(
                RunRequest::new([self.converter.clone(), "--VERSION".to_string()])
                    .timeout(Duration::from_secs(10)),
            )
            .await
            .map_err(|e| ConvertError::Internal(format!("converter unavailable: {e}")))?;
        if !outcome.success() {
            return Err(ConvertError::Internal(format!(
                "converter not working: {}",
                outcome.stderr.trim()
            )));
        }
        Ok(outcome.stdout.trim().to_string())
    }

    /// Converts the project's main source into `dest_html`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConvertStageFailure`] wrapping `ConverterFailure` on
    /// non-zero exit, timeout, or a missing output file, and `Cancelled`
    /// when the job token fired.
    pub async fn run(
        &self,
        project: &ProjectStructure,
        dest_html: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ConvertOutcome, ConvertStageFailure> {
        if let Some(parent) = dest_html.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                return Err(ConvertStageFailure::new(
                    ConvertError::internal(err),
                    "",
                    BTreeMap::new(),
                ));
            }
        }

        let mut argv = vec![
            self.converter.clone(),
            format!("--destination={}", dest_html.display()),
            "--nocomments".to_string(),
            "--parallel".to_string(),
            "--nodefaultresources".to_string(),
            "--timestamp=0".to_string(),
            format!("--timeout={}", timeout.as_secs()),
        ];
        for module in PRELOAD_MODULES {
            argv.push(format!("--preload={module}"));
        }
        for path in search_paths(project) {
            argv.push(format!("--path={}", path.display()));
        }
        argv.push(project.main_file.display().to_string());
        debug!(args = argv.len(), "assembled converter invocation");

        let outcome = match self
            .runner
            .run(
                RunRequest::new(argv)
                    .cwd(project.main_file.parent().unwrap_or(&project.root))
                    .timeout(timeout)
                    .cancel(cancel.clone()),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                return Err(ConvertStageFailure::new(
                    ConvertError::internal(err),
                    "",
                    BTreeMap::new(),
                ));
            }
        };

        let mut diagnostics = BTreeMap::new();
        diagnostics.insert(
            "exit_code".to_string(),
            outcome.exit_code.map_or("signal".to_string(), |c| c.to_string()),
        );
        diagnostics.insert("stderr".to_string(), cap_stderr(&outcome.stderr));
        diagnostics.insert(
            "cause".to_string(),
            classify_failure(&outcome.stderr).to_string(),
        );

        if outcome.cancelled {
            return Err(ConvertStageFailure::new(
                ConvertError::Cancelled,
                &outcome.stderr,
                diagnostics,
            ));
        }
        if outcome.timed_out {
            return Err(ConvertStageFailure::new(
                ConvertError::ConverterFailure {
                    message: format!("converter timed out after {}s", timeout.as_secs()),
                },
                &outcome.stderr,
                diagnostics,
            ));
        }
        if !outcome.success() {
            let cause = classify_failure(&outcome.stderr);
            return Err(ConvertStageFailure::new(
                ConvertError::ConverterFailure {
                    message: format!("{cause}: {}", last_error_line(&outcome.stderr)),
                },
                &outcome.stderr,
                diagnostics,
            ));
        }
        if !dest_html.is_file() {
            return Err(ConvertStageFailure::new(
                ConvertError::ConverterFailure {
                    message: "converter exited cleanly but produced no output file".to_string(),
                },
                &outcome.stderr,
                diagnostics,
            ));
        }

        info!(html = %dest_html.display(), "conversion succeeded");
        Ok(ConvertOutcome {
            html: dest_html.to_path_buf(),
            warnings: extract_warnings(&outcome.stderr),
            diagnostics,
        })
    }
}

/// Search path list: project root, supporting-source ancestors, walked
/// subdirectories. Order is deterministic and duplicates are dropped.
fn search_paths(project: &ProjectStructure) -> Vec<PathBuf> {
    let mut paths = vec![project.root.clone()];

    let supporting = project
        .tex_files
        .iter()
        .chain(&project.class_files)
        .chain(&project.style_files)
        .chain(&project.bib_files);
    for file in supporting {
        let mut dir = file.parent().map(Path::to_path_buf);
        for _ in 0..MAX_ANCESTOR_LEVELS {
            let Some(current) = dir else { break };
            // Never escape the extraction root.
            if !current.starts_with(&project.root) {
                break;
            }
            if !paths.contains(&current) {
                paths.push(current.clone());
            }
            dir = current.parent().map(Path::to_path_buf);
        }
    }

    for entry in WalkDir::new(&project.root)
        .max_depth(SEARCH_WALK_DEPTH)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
    {
        let dir = entry.into_path();
        if !paths.contains(&dir) {
            paths.push(dir);
        }
    }

    paths
}

/// Maps converter stderr onto a coarse cause for diagnostics and
/// suggestions.
fn classify_failure(stderr: &str) -> &'static str {
    if stderr.contains("Fatal error") {
        "fatal_error"
    } else if stderr.contains("Undefined control sequence") {
        "undefined_control_sequence"
    } else if stderr.contains("File not found") || stderr.contains("Can't find file") {
        "file_not_found"
    } else if stderr.contains("Emergency stop") {
        "emergency_stop"
    } else {
        "conversion_error"
    }
}

fn last_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no converter output")
        .to_string()
}

fn extract_warnings(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .filter(|line| line.to_ascii_lowercase().contains("warning"))
        .map(|line| line.trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn stub_converter(dir: &Path, script: &str) -> String {
        let path = dir.join("latexmlc-stub");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "#!/bin/sh\n{script}").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    fn project(root: &Path) -> ProjectStructure {
        let main = root.join("main.tex");
        std::fs::write(&main, "\\documentclass{article}").unwrap();
        ProjectStructure {
            root: root.to_path_buf(),
            main_file: main,
            ..ProjectStructure::default()
        }
    }

    #[tokio::test]
    async fn success_requires_the_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path());
        let dest = dir.path().join("converter/doc.html");

        // A converter that honors --destination=<path> ($1).
        let converter = stub_converter(
            dir.path(),
            "dest=${1#--destination=}\nprintf '<html><body>ok</body></html>' > \"$dest\"\nexit 0",
        );
        let stage = ConvertStage::new(&converter);
        let outcome = stage
            .run(&project, &dest, Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.html, dest);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_converter_failure() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path());
        let converter = stub_converter(
            dir.path(),
            "echo 'Undefined control sequence \\\\foo' >&2\nexit 1",
        );
        let stage = ConvertStage::new(&converter);
        let err = stage
            .run(
                &project,
                &dir.path().join("converter/doc.html"),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err.error {
            ConvertError::ConverterFailure { message } => {
                assert!(message.contains("undefined_control_sequence"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.stderr.contains("Undefined control sequence"));
        assert_eq!(err.diagnostics["cause"], "undefined_control_sequence");
    }

    #[tokio::test]
    async fn clean_exit_without_output_still_fails() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path());
        let converter = stub_converter(dir.path(), "exit 0");
        let stage = ConvertStage::new(&converter);
        let err = stage
            .run(
                &project,
                &dir.path().join("converter/doc.html"),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.error, ConvertError::ConverterFailure { .. }));
    }

    #[test]
    fn search_paths_start_at_the_root_and_stay_inside_it() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sections/deep")).unwrap();
        let mut p = ProjectStructure {
            root: dir.path().to_path_buf(),
            main_file: dir.path().join("main.tex"),
            ..ProjectStructure::default()
        };
        p.tex_files.push(dir.path().join("sections/deep/part.tex"));

        let paths = search_paths(&p);
        assert_eq!(paths[0], dir.path());
        assert!(paths.contains(&dir.path().join("sections/deep")));
        assert!(paths.contains(&dir.path().join("sections")));
        assert!(paths.iter().all(|p| p.starts_with(dir.path())));
    }

    #[test]
    fn failure_classification_matches_known_stderr() {
        assert_eq!(classify_failure("Fatal error: died"), "fatal_error");
        assert_eq!(
            classify_failure("Error: File not found: x.sty"),
            "file_not_found"
        );
        assert_eq!(classify_failure("something odd"), "conversion_error");
    }
}
