//! # Asset Conversion Crate
//!
//! Turns the figure formats a LaTeX project ships with into SVG siblings the
//! final HTML can reference:
//!
//! - **PDF figures**: first page vectorized with `dvisvgm`; when that fails,
//!   the page is rasterized with `pdftoppm` and wrapped in an `<svg>` shell.
//! - **TikZ fragments**: re-compiled inside a minimal `standalone` document,
//!   then vectorized.
//!
//! Each conversion is one external-tool invocation with its own timeout,
//! staged in a temporary directory and moved into place only on success.

mod pdf;
mod tikz;

pub use pdf::convert_pdf_to_svg;
pub use tikz::convert_tikz_to_svg;

use std::path::PathBuf;
use std::time::Duration;

use run_process::{ProcessRunner, RunnerError};
use thiserror::Error;

/// Per-conversion wall clock.
pub const CONVERSION_TIMEOUT: Duration = Duration::from_secs(60);

/// External tools used for vector work.
#[derive(Debug, Clone)]
pub struct AssetTools {
    /// LaTeX compiler, used to re-compile TikZ fragments.
    pub compiler: String,
    /// Vector-graphics converter (`dvisvgm`).
    pub vectorizer: String,
    /// Raster fallback (`pdftoppm`).
    pub rasterizer: String,
}

impl AssetTools {
    /// Builds the process runner whose allow-list covers exactly these tools.
    #[must_use]
    pub fn runner(&self) -> ProcessRunner {
        ProcessRunner::new([
            self.compiler.clone(),
            self.vectorizer.clone(),
            self.rasterizer.clone(),
        ])
    }
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset not found: {0}")]
    MissingInput(PathBuf),

    #[error("{tool} failed: {detail}")]
    ToolFailed { tool: String, detail: String },

    #[error("conversion timed out after {0:?}")]
    TimedOut(Duration),

    #[error("conversion cancelled")]
    Cancelled,

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AssetError {
    pub(crate) fn from_outcome(tool: &str, outcome: &run_process::RunOutcome) -> Self {
        if outcome.cancelled {
            Self::Cancelled
        } else if outcome.timed_out {
            Self::TimedOut(outcome.duration)
        } else {
            Self::ToolFailed {
                tool: tool.to_string(),
                detail: last_line(&outcome.stderr),
            }
        }
    }
}

fn last_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no error output")
        .to_string()
}
