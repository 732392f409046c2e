//! The engine's error sum type and the failure-suggestion table.

use serde::Serialize;
use thiserror::Error;

/// Cap on tool stderr carried inside a failure record.
pub const STDERR_CAP_BYTES: usize = 64 * 1024;

/// Every failure the engine can surface to a caller.
#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    #[error("maximum concurrent jobs ({limit}) exceeded")]
    CapacityExceeded { limit: usize },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {0} has not produced a result yet")]
    NotReady(String),

    #[error("archive rejected: {reason}")]
    UnsafeArchive { reason: String },

    #[error("no LaTeX source file found in the submission")]
    NoMainSource,

    #[error("compilation failed: {message}")]
    CompilerFailure { message: String },

    #[error("conversion failed: {message}")]
    ConverterFailure { message: String },

    #[error("post-processing failed: {message}")]
    PostProcessingFailure { message: String },

    #[error("job exceeded its processing budget of {budget_secs}s")]
    TimeoutExceeded { budget_secs: u64 },

    #[error("job was cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable machine-readable kind names, surfaced as `error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CapacityExceeded,
    NotFound,
    NotReady,
    UnsafeArchive,
    NoMainSource,
    CompilerFailure,
    ConverterFailure,
    PostProcessingFailure,
    TimeoutExceeded,
    Cancelled,
    Internal,
}

impl ConvertError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NotReady(_) => ErrorKind::NotReady,
            Self::UnsafeArchive { .. } => ErrorKind::UnsafeArchive,
            Self::NoMainSource => ErrorKind::NoMainSource,
            Self::CompilerFailure { .. } => ErrorKind::CompilerFailure,
            Self::ConverterFailure { .. } => ErrorKind::ConverterFailure,
            Self::PostProcessingFailure { .. } => ErrorKind::PostProcessingFailure,
            Self::TimeoutExceeded { .. } => ErrorKind::TimeoutExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    #[must_use]
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Suggestion lookup keyed by substrings of the captured tool stderr.
///
/// The table mirrors what the LaTeX toolchain actually prints for the four
/// failure families users can act on.
#[must_use]
pub fn suggestions_for(stderr: &str) -> Vec<String> {
    const TABLE: &[(&[&str], &str)] = &[
        (
            &["not found", "cannot find", ".sty'"],
            "A required package or file was missing; include all .sty/.cls files in the archive or rely on standard packages.",
        ),
        (
            &["Undefined control sequence"],
            "The document uses a macro no loaded package defines; check for missing \\usepackage declarations.",
        ),
        (
            &["File not found", "File `"],
            "A referenced input or graphics file is absent; verify every \\input and \\includegraphics target is in the archive.",
        ),
        (
            &["out of memory", "TeX capacity exceeded"],
            "The document exhausted the typesetting memory; split very large documents or reduce generated content.",
        ),
        (
            &["Emergency stop"],
            "The source has a fatal syntax error; compile locally to locate the offending line.",
        ),
    ];

    let mut suggestions = Vec::new();
    for (needles, advice) in TABLE {
        if needles.iter().any(|needle| stderr.contains(needle)) {
            suggestions.push((*advice).to_string());
        }
    }
    suggestions
}

/// Truncates stderr to [`STDERR_CAP_BYTES`], keeping the newest output.
#[must_use]
pub fn cap_stderr(stderr: &str) -> String {
    if stderr.len() <= STDERR_CAP_BYTES {
        return stderr.to_string();
    }
    let mut start = stderr.len() - STDERR_CAP_BYTES;
    while !stderr.is_char_boundary(start) {
        start += 1;
    }
    stderr[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_snake_case() {
        let kind = ConvertError::CapacityExceeded { limit: 5 }.kind();
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"capacity_exceeded\"");
    }

    #[test]
    fn suggestion_table_matches_stderr_families() {
        let s = suggestions_for("! Undefined control sequence.\nl.5 \\foo");
        assert_eq!(s.len(), 1);
        assert!(s[0].contains("usepackage"));

        assert!(suggestions_for("clean run").is_empty());

        let multi = suggestions_for("File `fig1.pdf' not found\nEmergency stop");
        assert!(multi.len() >= 2);
    }

    #[test]
    fn stderr_cap_keeps_the_tail() {
        let long = "a".repeat(STDERR_CAP_BYTES + 10) + "TAIL";
        let capped = cap_stderr(&long);
        assert_eq!(capped.len(), STDERR_CAP_BYTES);
        assert!(capped.ends_with("TAIL"));
    }
}
