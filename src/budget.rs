//! Adaptive per-job timeout budgets.
//!
//! The budget grows with input size and file count, with escalating cost for
//! very large inputs, and is capped at a hard ceiling. Plans are cached per
//! input root for a short TTL so repeated lookups skip the filesystem walk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;
use walkdir::WalkDir;

const MIB: f64 = 1024.0 * 1024.0;
const CACHE_TTL: Duration = Duration::from_secs(300);
const CACHE_CAP: usize = 64;

/// Share of the total budget reserved for the TeX→HTML conversion stage.
const CONVERT_SHARE: f64 = 0.6;

/// A computed wall-clock plan for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetPlan {
    pub total_secs: u64,
    /// Portion allotted to the conversion stage.
    pub convert_secs: u64,
    pub input_bytes: u64,
    pub file_count: u64,
}

impl BudgetPlan {
    /// What the non-conversion stages share.
    #[must_use]
    pub fn remainder_secs(&self) -> u64 {
        self.total_secs - self.convert_secs
    }
}

/// Computes and caches budget plans.
pub struct BudgetCalculator {
    base_secs: u64,
    ceiling_secs: u64,
    cache: Mutex<HashMap<PathBuf, (BudgetPlan, Instant)>>,
}

impl BudgetCalculator {
    #[must_use]
    pub fn new(base_secs: u64, ceiling_secs: u64) -> Self {
        Self {
            base_secs,
            ceiling_secs: ceiling_secs.min(1800),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The plan for an input root, from cache when fresh.
    #[must_use]
    pub fn plan(&self, root: &Path) -> BudgetPlan {
        {
            let cache = self.cache.lock();
            if let Some((plan, at)) = cache.get(root) {
                if at.elapsed() < CACHE_TTL {
                    return *plan;
                }
            }
        }

        let (bytes, files) = measure(root);
        let plan = self.from_measurements(bytes, files);
        debug!(root = %root.display(), bytes, files, total = plan.total_secs, "computed budget");

        let mut cache = self.cache.lock();
        if cache.len() >= CACHE_CAP {
            // Evict the stalest entry rather than growing without bound.
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(root.to_path_buf(), (plan, Instant::now()));
        plan
    }

    /// The pure formula, exposed for callers that already know the sizes.
    #[must_use]
    pub fn from_measurements(&self, input_bytes: u64, file_count: u64) -> BudgetPlan {
        let bytes = input_bytes as f64;
        let fifty = 50.0 * MIB;
        let hundred = 100.0 * MIB;

        let size_component = bytes.min(fifty) / MIB
            + ((bytes - fifty).clamp(0.0, fifty)) / MIB * 2.0
            + ((bytes - hundred).max(0.0)) / MIB * 5.0;
        let count_component = (file_count / 10) as f64;

        let total = (self.base_secs as f64 + size_component + count_component)
            .min(self.ceiling_secs as f64) as u64;
        let convert = ((total as f64) * CONVERT_SHARE) as u64;

        BudgetPlan {
            total_secs: total,
            convert_secs: convert,
            input_bytes,
            file_count,
        }
    }
}

fn measure(root: &Path) -> (u64, u64) {
    let mut bytes = 0;
    let mut files = 0;
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_file() {
            files += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    (bytes, files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> BudgetCalculator {
        BudgetCalculator::new(600, 1800)
    }

    #[test]
    fn tiny_input_gets_the_base_budget() {
        let plan = calc().from_measurements(60, 1);
        assert_eq!(plan.total_secs, 600);
        assert_eq!(plan.convert_secs, 360);
        assert_eq!(plan.remainder_secs(), 240);
    }

    #[test]
    fn size_components_escalate_per_band() {
        // 10 MiB → base + 10.
        let plan = calc().from_measurements(10 * 1024 * 1024, 0);
        assert_eq!(plan.total_secs, 610);
        // 60 MiB → base + 50·1 + 10·2 = 670.
        let plan = calc().from_measurements(60 * 1024 * 1024, 0);
        assert_eq!(plan.total_secs, 670);
        // 110 MiB → base + 50 + 100 + 50 = 800.
        let plan = calc().from_measurements(110 * 1024 * 1024, 0);
        assert_eq!(plan.total_secs, 800);
    }

    #[test]
    fn file_count_adds_a_second_per_ten() {
        let plan = calc().from_measurements(0, 95);
        assert_eq!(plan.total_secs, 609);
    }

    #[test]
    fn ceiling_is_never_exceeded() {
        let plan = calc().from_measurements(10 * 1024 * 1024 * 1024, 100_000);
        assert_eq!(plan.total_secs, 1800);
        let lowered = BudgetCalculator::new(600, 900).from_measurements(u64::MAX / 2, 0);
        assert_eq!(lowered.total_secs, 900);
        // The contract ceiling holds even if misconfigured higher.
        let raised = BudgetCalculator::new(600, 86_400).from_measurements(u64::MAX / 2, 0);
        assert_eq!(raised.total_secs, 1800);
    }

    #[test]
    fn plans_are_cached_per_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.tex"), b"x".repeat(100)).unwrap();
        let calc = calc();
        let first = calc.plan(dir.path());
        // Growing the directory is invisible until the TTL lapses.
        std::fs::write(dir.path().join("big.bin"), vec![0u8; 1024]).unwrap();
        let second = calc.plan(dir.path());
        assert_eq!(first, second);
    }
}
