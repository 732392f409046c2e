//! LaTeX compilation through Tectonic.
//!
//! Compilation failure is recoverable by design: the pipeline marks the
//! stage skipped and the converter still gets a chance at the source. The
//! compiler's stderr is preserved in stage diagnostics either way.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use run_process::{ProcessRunner, RunRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{cap_stderr, ConvertError};

#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub success: bool,
    pub pdf: Option<PathBuf>,
    pub cancelled: bool,
    pub timed_out: bool,
    pub warnings: Vec<String>,
    pub diagnostics: BTreeMap<String, String>,
}

pub struct CompileStage {
    compiler: String,
    runner: ProcessRunner,
}

impl CompileStage {
    #[must_use]
    pub fn new(compiler_path: &str) -> Self {
        Self {
            compiler: compiler_path.to_string(),
            runner: ProcessRunner::new([compiler_path.to_string()]),
        }
    }

    /// Verifies the compiler executable answers `--version`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when the tool is absent or broken.
    pub async fn probe(&self) -> Result<String, ConvertError> {
        let outcome = self
            .runner
            .run(
                RunRequest::new([self.compiler.clone(), "--version".to_string()])
                    .timeout(Duration::from_secs(10)),
            )
            .await
            .map_err(|e| ConvertError::Internal(format!("compiler unavailable: {e}")))?;
        if !outcome.success() {
            return Err(ConvertError::Internal(format!(
                "compiler not working: {}",
                outcome.stderr.trim()
            )));
        }
        Ok(outcome.stdout.trim().to_string())
    }

    /// Compiles `main_file` with artifacts kept under `out_dir`.
    ///
    /// Never returns an error for a failed compilation; the outcome record
    /// carries the verdict. Shell escape stays disabled and the run is
    /// non-interactive.
    ///
    /// # Errors
    ///
    /// Only precondition violations (runner refused the command).
    pub async fn run(
        &self,
        main_file: &Path,
        out_dir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CompileOutcome, ConvertError> {
        std::fs::create_dir_all(out_dir).map_err(ConvertError::internal)?;

        let outcome = self
            .runner
            .run(
                RunRequest::new([
                    self.compiler.clone(),
                    "--chatter=minimal".to_string(),
                    "--keep-logs".to_string(),
                    "--keep-intermediates".to_string(),
                    "--outdir".to_string(),
                    out_dir.display().to_string(),
                    main_file.display().to_string(),
                ])
                .cwd(main_file.parent().unwrap_or(Path::new(".")))
                .timeout(timeout)
                .cancel(cancel.clone()),
            )
            .await
            .map_err(ConvertError::internal)?;

        let pdf = main_file
            .file_stem()
            .map(|stem| out_dir.join(format!("{}.pdf", stem.to_string_lossy())))
            .filter(|p| p.is_file());
        let success = outcome.success() && pdf.is_some();

        let mut diagnostics = BTreeMap::new();
        diagnostics.insert(
            "exit_code".to_string(),
            outcome.exit_code.map_or("signal".to_string(), |c| c.to_string()),
        );
        diagnostics.insert("stderr".to_string(), cap_stderr(&outcome.stderr));
        if let Some(pdf) = &pdf {
            diagnostics.insert("pdf".to_string(), pdf.display().to_string());
        }

        if success {
            info!(main = %main_file.display(), "compilation succeeded");
        } else {
            debug!(main = %main_file.display(), exit = ?outcome.exit_code, "compilation failed (recoverable)");
        }

        Ok(CompileOutcome {
            success,
            pdf,
            cancelled: outcome.cancelled,
            timed_out: outcome.timed_out,
            warnings: extract_warnings(&outcome.stderr),
            diagnostics,
        })
    }
}

/// Warning lines from compiler output.
fn extract_warnings(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .filter(|line| {
            let lower = line.to_ascii_lowercase();
            lower.contains("warning") && !lower.contains("error")
        })
        .map(|line| line.trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn stub_compiler(dir: &Path, script: &str) -> String {
        let path = dir.join("tectonic-stub");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "#!/bin/sh\n{script}").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn successful_compile_reports_the_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.tex");
        std::fs::write(&main, "\\documentclass{article}").unwrap();
        let out = dir.path().join("compiler");
        // The stub writes the expected pdf: $5 is --outdir's value.
        let compiler = stub_compiler(
            dir.path(),
            "mkdir -p \"$5\" && printf pdf > \"$5/main.pdf\"\nexit 0",
        );
        let stage = CompileStage::new(&compiler);
        let outcome = stage
            .run(&main, &out, Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.pdf.unwrap().ends_with("main.pdf"));
    }

    #[tokio::test]
    async fn failed_compile_is_an_outcome_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.tex");
        std::fs::write(&main, "\\usepackage{nope}").unwrap();
        let compiler = stub_compiler(
            dir.path(),
            "echo '! LaTeX Error: File nope.sty not found' >&2\nexit 1",
        );
        let stage = CompileStage::new(&compiler);
        let outcome = stage
            .run(
                &main,
                &dir.path().join("compiler"),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.diagnostics["stderr"].contains("nope.sty"));
    }

    #[tokio::test]
    async fn probe_rejects_missing_tool() {
        let stage = CompileStage::new("/nonexistent/tectonic");
        assert!(stage.probe().await.is_err());
    }

    #[test]
    fn warning_lines_are_extracted() {
        let warnings = extract_warnings(
            "warning: undefined reference\nerror: hard stop\nnote: fine\nWarning: overfull hbox",
        );
        assert_eq!(warnings.len(), 2);
    }
}
