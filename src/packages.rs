//! Typesetting-package availability and installation.
//!
//! The installer is strictly best-effort: a package that cannot be probed or
//! installed is recorded and skipped, never failing the stage. Compilation
//! catches genuinely missing packages later through its own exit code.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use run_process::{ProcessRunner, RunRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CACHE_TTL: Duration = Duration::from_secs(300);
const CACHE_CAP: usize = 1000;
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome summary recorded into stage diagnostics.
#[derive(Debug, Clone, Default)]
pub struct InstallSummary {
    pub already_available: Vec<String>,
    pub installed: Vec<String>,
    pub failed: Vec<String>,
    pub cache_hits: usize,
}

pub struct PackageInstaller {
    installer: String,
    runner: ProcessRunner,
    cache: Mutex<HashMap<String, (bool, Instant)>>,
}

impl PackageInstaller {
    #[must_use]
    pub fn new(installer_path: &str) -> Self {
        Self {
            installer: installer_path.to_string(),
            runner: ProcessRunner::new([installer_path.to_string()]),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures each declared package is present, installing the missing
    /// ones. Never fails; every problem lands in the summary instead.
    pub async fn ensure(&self, packages: &[String], cancel: &CancellationToken) -> InstallSummary {
        let mut summary = InstallSummary::default();
        for package in packages {
            if cancel.is_cancelled() {
                break;
            }
            match self.cached_availability(package) {
                Some(true) => {
                    summary.cache_hits += 1;
                    summary.already_available.push(package.clone());
                    continue;
                }
                Some(false) => {
                    summary.cache_hits += 1;
                }
                None => {
                    if self.probe(package, cancel).await {
                        self.remember(package, true);
                        summary.already_available.push(package.clone());
                        continue;
                    }
                }
            }

            if self.install(package, cancel).await {
                info!(package, "installed missing package");
                self.remember(package, true);
                summary.installed.push(package.clone());
            } else {
                debug!(package, "package unavailable and not installable");
                self.remember(package, false);
                summary.failed.push(package.clone());
            }
        }
        if !summary.failed.is_empty() {
            warn!(failed = summary.failed.len(), "some packages could not be provided");
        }
        summary
    }

    fn cached_availability(&self, package: &str) -> Option<bool> {
        let cache = self.cache.lock();
        let (available, at) = cache.get(package)?;
        (at.elapsed() < CACHE_TTL).then_some(*available)
    }

    fn remember(&self, package: &str, available: bool) {
        let mut cache = self.cache.lock();
        if cache.len() >= CACHE_CAP && !cache.contains_key(package) {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(package.to_string(), (available, Instant::now()));
    }

    async fn probe(&self, package: &str, cancel: &CancellationToken) -> bool {
        self.runner
            .run(
                RunRequest::new([
                    self.installer.clone(),
                    "info".to_string(),
                    "--only-installed".to_string(),
                    package.to_string(),
                ])
                .timeout(PROBE_TIMEOUT)
                .cancel(cancel.clone()),
            )
            .await
            .map(|outcome| outcome.success())
            .unwrap_or(false)
    }

    async fn install(&self, package: &str, cancel: &CancellationToken) -> bool {
        self.runner
            .run(
                RunRequest::new([
                    self.installer.clone(),
                    "install".to_string(),
                    package.to_string(),
                ])
                .timeout(INSTALL_TIMEOUT)
                .cancel(cancel.clone()),
            )
            .await
            .map(|outcome| outcome.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    /// A stub installer that reports `known` packages as installed and
    /// succeeds at installing anything else.
    fn stub_installer(dir: &std::path::Path, known: &str) -> String {
        let path = dir.join("tlmgr-stub");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "#!/bin/sh\nif [ \"$1\" = info ]; then\n  case \"$3\" in {known}) exit 0;; *) exit 1;; esac\nfi\nexit 0"
        )
        .unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn available_packages_are_not_installed_again() {
        let dir = tempfile::tempdir().unwrap();
        let installer = PackageInstaller::new(&stub_installer(dir.path(), "amsmath"));
        let summary = installer
            .ensure(
                &["amsmath".to_string(), "exotic".to_string()],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(summary.already_available, vec!["amsmath"]);
        assert_eq!(summary.installed, vec!["exotic"]);
        assert!(summary.failed.is_empty());
    }

    #[tokio::test]
    async fn second_run_hits_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let installer = PackageInstaller::new(&stub_installer(dir.path(), "amsmath"));
        let packages = vec!["amsmath".to_string()];
        let token = CancellationToken::new();
        let first = installer.ensure(&packages, &token).await;
        assert_eq!(first.cache_hits, 0);
        let second = installer.ensure(&packages, &token).await;
        assert_eq!(second.cache_hits, 1);
        assert_eq!(second.already_available, vec!["amsmath"]);
    }

    #[tokio::test]
    async fn missing_installer_never_fails_the_caller() {
        let installer = PackageInstaller::new("/nonexistent/tlmgr");
        let summary = installer
            .ensure(&["amsmath".to_string()], &CancellationToken::new())
            .await;
        assert_eq!(summary.failed, vec!["amsmath"]);
    }
}
