//! # HTML Post-Processing Crate
//!
//! Takes the raw HTML a TeX→HTML converter produced and turns it into the
//! polished document a reader actually gets. The transformation set is fixed
//! and ordered:
//!
//! 1. lenient DOM parse (a well-formed skeleton stands in when the input is
//!    unreadable)
//! 2. script sanitization
//! 3. asset conversion: referenced PDFs and TikZ fragments become SVGs,
//!    converted through a bounded pool
//! 4. heading cleanup (leading `NNpt` font-size residue)
//! 5. citation repair
//! 6. display-equation merging, both tabular and script-container forms
//! 7. link and image-path normalization relative to the final HTML
//! 8. math renderer injection
//! 9. viewport meta + `lang` attribute cleanup
//!
//! Applying the pass to its own output changes nothing: every step is
//! guarded so the pipeline is idempotent.

mod assets;
mod citations;
mod dom;
mod equations;
mod headings;
mod sanitize;

pub use assets::{AssetOutcomes, AssetWork, ASSET_POOL_SIZE};
pub use citations::CitationPatterns;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use convert_assets::AssetTools;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Emitted when the converter output cannot be read at all.
const SKELETON: &str = "<!DOCTYPE html><html lang=\"en\"><head>\
<title>Converted document</title></head><body>\
<main class=\"ltx_page_main\"></main></body></html>";

#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("post-processing worker failed: {0}")]
    Worker(String),
}

/// Knobs the orchestrator exposes per job.
#[derive(Debug, Clone, Default)]
pub struct PostProcessOptions {
    /// Skip asset conversion entirely (`skip_images` submissions).
    pub skip_assets: bool,
    /// External tools for asset conversion; `None` also skips conversion.
    pub tools: Option<AssetTools>,
}

/// What the pass did, surfaced into stage diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PostProcessReport {
    pub steps_completed: Vec<String>,
    pub warnings: Vec<String>,
    pub parse_fallback: bool,
    pub headings_cleaned: usize,
    pub citations_repaired: usize,
    pub equations_merged: usize,
    pub scripts_removed: usize,
    pub assets_converted: Vec<PathBuf>,
    pub asset_failures: Vec<String>,
    pub original_size: usize,
    pub final_size: usize,
}

/// The post-processor. Regex patterns are compiled once at construction and
/// shared across jobs.
#[derive(Debug, Clone)]
pub struct PostProcessor {
    patterns: Arc<CitationPatterns>,
    heading_pattern: Arc<Regex>,
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct TransformCounts {
    scripts_removed: usize,
    headings_cleaned: usize,
    citations_repaired: usize,
    equations_merged: usize,
    containers_merged: usize,
    paths_adjusted: usize,
    links_hardened: usize,
}

impl PostProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            patterns: Arc::new(CitationPatterns::compile()),
            heading_pattern: Arc::new(headings::font_size_pattern()),
        }
    }

    /// Processes `html_file` into `output_file`, converting assets into
    /// `assets_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`PostProcessError`] on I/O failure around the input/output
    /// files. Transformation problems are recorded in the report instead:
    /// an unreadable document degrades to a skeleton, a failed asset keeps
    /// its original reference.
    pub async fn process_file(
        &self,
        html_file: &Path,
        output_file: &Path,
        assets_dir: &Path,
        options: &PostProcessOptions,
        cancel: &CancellationToken,
    ) -> Result<PostProcessReport, PostProcessError> {
        let mut report = PostProcessReport::default();

        let html = match tokio::fs::read_to_string(html_file).await {
            Ok(content) if !content.trim().is_empty() => content,
            Ok(_) => {
                warn!(file = %html_file.display(), "converter produced empty HTML, using skeleton");
                report.parse_fallback = true;
                report
                    .warnings
                    .push("converter output was empty, emitted a minimal document".to_string());
                SKELETON.to_string()
            }
            Err(err) => {
                warn!(file = %html_file.display(), %err, "converter HTML unreadable, using skeleton");
                report.parse_fallback = true;
                report
                    .warnings
                    .push(format!("converter output unreadable ({err}), emitted a minimal document"));
                SKELETON.to_string()
            }
        };
        report.original_size = html.len();
        report.steps_completed.push("parse".to_string());

        // Phase 1: read-only scan for convertible assets.
        let outcomes = match (&options.tools, options.skip_assets) {
            (Some(tools), false) => {
                let scan_input = html.clone();
                let work = tokio::task::spawn_blocking(move || assets::scan_assets(&scan_input))
                    .await
                    .map_err(|e| PostProcessError::Worker(e.to_string()))?;
                let runner = tools.runner();
                let html_dir = html_file.parent().unwrap_or_else(|| Path::new("."));
                assets::convert_all(work, tools, &runner, html_dir, assets_dir, cancel).await
            }
            _ => AssetOutcomes::default(),
        };
        report.assets_converted = outcomes.produced.clone();
        report.asset_failures = outcomes.failures.clone();
        report.steps_completed.push("assets".to_string());

        // Phase 2: the DOM transformations proper, off the async executor
        // because the tree is not Send.
        let patterns = Arc::clone(&self.patterns);
        let heading_pattern = Arc::clone(&self.heading_pattern);
        let html_dir = html_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let output_dir = output_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let (final_html, counts) = tokio::task::spawn_blocking(move || {
            transform(
                &patterns,
                &heading_pattern,
                &html,
                &outcomes,
                &html_dir,
                &output_dir,
            )
        })
        .await
        .map_err(|e| PostProcessError::Worker(e.to_string()))?;

        report.scripts_removed = counts.scripts_removed;
        report.headings_cleaned = counts.headings_cleaned;
        report.citations_repaired = counts.citations_repaired;
        report.equations_merged = counts.equations_merged + counts.containers_merged;
        report.steps_completed.extend(
            [
                "sanitize",
                "headings",
                "citations",
                "equations",
                "paths",
                "math-renderer",
                "cleanup",
            ]
            .map(String::from),
        );
        report.final_size = final_html.len();

        if let Some(parent) = output_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output_file, final_html.as_bytes()).await?;

        info!(
            citations = report.citations_repaired,
            equations = report.equations_merged,
            assets = report.assets_converted.len(),
            out = %output_file.display(),
            "post-processing finished"
        );
        Ok(report)
    }
}

fn transform(
    patterns: &CitationPatterns,
    heading_pattern: &Regex,
    html: &str,
    outcomes: &AssetOutcomes,
    html_dir: &Path,
    output_dir: &Path,
) -> (String, TransformCounts) {
    let doc = dom::parse(html);
    let mut counts = TransformCounts::default();

    counts.scripts_removed = sanitize::strip_unsafe_scripts(&doc);
    assets::apply_rewrites(&doc, outcomes);
    counts.headings_cleaned = headings::strip_font_size_residue(&doc, heading_pattern);
    counts.citations_repaired = citations::repair_citations(&doc, patterns);
    counts.equations_merged = equations::merge_equation_tables(&doc);
    counts.containers_merged = equations::merge_display_containers(&doc);
    counts.paths_adjusted = assets::normalize_paths(&doc, html_dir, output_dir);
    counts.links_hardened = assets::harden_external_links(&doc);
    sanitize::ensure_math_renderer(&doc);
    sanitize::ensure_viewport(&doc);
    sanitize::ensure_lang(&doc);

    tracing::debug!(
        paths = counts.paths_adjusted,
        links = counts.links_hardened,
        "reference normalization done"
    );
    (dom::serialize(&doc), counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> PostProcessor {
        PostProcessor::new()
    }

    async fn run_on(html: &str) -> (String, PostProcessReport) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("converter").join("doc.html");
        std::fs::create_dir_all(input.parent().unwrap()).unwrap();
        std::fs::write(&input, html).unwrap();
        let output = dir.path().join("final.html");
        let report = processor()
            .process_file(
                &input,
                &output,
                &dir.path().join("assets"),
                &PostProcessOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        (std::fs::read_to_string(&output).unwrap(), report)
    }

    #[tokio::test]
    async fn full_pass_produces_polished_document() {
        let (out, report) = run_on(
            "<html><head><script src=\"https://evil.example/t.js\"></script></head><body>\
             <h2>12pt Introduction</h2>\
             <cite><span>Mora, </span><span>(</span><a href=\"#b1\">1989</a><span>)</span></cite>\
             <table class=\"ltx_equation\"><tbody>\
             <tr><td><math>a</math></td></tr><tr><td><math>b</math></td></tr>\
             </tbody></table></body></html>",
        )
        .await;

        assert!(!out.contains("evil.example"));
        assert!(out.contains(">Introduction</h2>"));
        assert!(!out.contains("12pt"));
        assert!(out.contains("Mora, (1989)"));
        assert!(out.contains("tex-mml-chtml.js"));
        assert!(out.contains("viewport"));
        assert!(out.contains("lang="));
        assert_eq!(report.headings_cleaned, 1);
        assert_eq!(report.citations_repaired, 1);
        assert_eq!(report.equations_merged, 1);
        assert_eq!(report.scripts_removed, 1);
        assert!(!report.parse_fallback);
    }

    #[tokio::test]
    async fn pass_is_idempotent_on_its_own_output() {
        let source = "<html><head></head><body>\
             <cite><span>Mora, </span><span>(</span><a href=\"#b1\">1989</a><span>)</span></cite>\
             <p>text</p></body></html>";
        let (once, _) = run_on(source).await;
        let (twice, report) = run_on(&once).await;
        assert_eq!(once, twice);
        assert_eq!(report.citations_repaired, 0);
        assert_eq!(report.scripts_removed, 0);
    }

    #[tokio::test]
    async fn unreadable_input_degrades_to_skeleton() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("final.html");
        let report = processor()
            .process_file(
                &dir.path().join("missing.html"),
                &output,
                &dir.path().join("assets"),
                &PostProcessOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(report.parse_fallback);
        let out = std::fs::read_to_string(&output).unwrap();
        assert!(out.contains("ltx_page_main"));
    }

    #[tokio::test]
    async fn skip_assets_leaves_pdf_references_alone() {
        let (out, report) = run_on(
            "<html><body><img src=\"figures/plot.pdf\"/></body></html>",
        )
        .await;
        assert!(out.contains("figures/plot.pdf"));
        assert!(report.assets_converted.is_empty());
    }
}
