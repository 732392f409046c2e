use std::path::{Path, PathBuf};

use run_process::{ProcessRunner, RunRequest};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{pdf, AssetError, AssetTools, CONVERSION_TIMEOUT};

/// Wraps a TikZ fragment in a minimal standalone document, compiles it, and
/// vectorizes the resulting page.
///
/// `name` becomes the stem of the produced `.svg`.
///
/// # Errors
///
/// Returns [`AssetError`] when compilation or vectorization fails, times
/// out, or is cancelled.
pub async fn convert_tikz_to_svg(
    tools: &AssetTools,
    runner: &ProcessRunner,
    fragment: &str,
    name: &str,
    out_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, AssetError> {
    tokio::fs::create_dir_all(out_dir).await?;

    let staging = tempfile::tempdir()?;
    let tex_path = staging.path().join("diagram.tex");
    tokio::fs::write(&tex_path, standalone_document(fragment)).await?;

    let outcome = runner
        .run(
            RunRequest::new([
                tools.compiler.clone(),
                "--chatter=minimal".to_string(),
                "--outdir".to_string(),
                staging.path().display().to_string(),
                tex_path.display().to_string(),
            ])
            .cwd(staging.path())
            .timeout(CONVERSION_TIMEOUT)
            .cancel(cancel.clone()),
        )
        .await?;

    let compiled_pdf = staging.path().join("diagram.pdf");
    if !outcome.success() || !compiled_pdf.is_file() {
        return Err(AssetError::from_outcome(&tools.compiler, &outcome));
    }
    debug!(name, "compiled tikz fragment");

    let svg = pdf::convert_pdf_to_svg(tools, runner, &compiled_pdf, staging.path(), cancel).await?;
    let final_path = out_dir.join(format!("{name}.svg"));
    tokio::fs::rename(&svg, &final_path)
        .await
        .or_else(|_| {
            // Cross-device staging falls back to copy + remove.
            std::fs::copy(&svg, &final_path).map(|_| ())
        })?;
    Ok(final_path)
}

/// Minimal preamble sufficient for a lone `tikzpicture` environment.
fn standalone_document(fragment: &str) -> String {
    format!(
        "\\documentclass{{standalone}}\n\
         \\usepackage{{tikz}}\n\
         \\usetikzlibrary{{arrows,shapes,positioning}}\n\
         \\begin{{document}}\n\
         {fragment}\n\
         \\end{{document}}\n"
    )
}
