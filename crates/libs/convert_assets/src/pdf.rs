use std::path::{Path, PathBuf};

use base64::Engine;
use run_process::{ProcessRunner, RunRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AssetError, AssetTools, CONVERSION_TIMEOUT};

/// Converts the first page of a PDF to an SVG next to `out_dir`.
///
/// Tries direct vectorization first; falls back to a raster render wrapped in
/// an SVG `<image>` shell so callers always get an `.svg` on success.
///
/// # Errors
///
/// Returns [`AssetError`] when the input is missing, both tool chains fail,
/// or the conversion is cancelled.
pub async fn convert_pdf_to_svg(
    tools: &AssetTools,
    runner: &ProcessRunner,
    pdf: &Path,
    out_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, AssetError> {
    if !pdf.is_file() {
        return Err(AssetError::MissingInput(pdf.to_path_buf()));
    }
    tokio::fs::create_dir_all(out_dir).await?;

    let stem = pdf
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "figure".to_string());
    let svg_path = out_dir.join(format!("{stem}.svg"));

    match vectorize(tools, runner, pdf, &svg_path, cancel).await {
        Ok(()) => return Ok(svg_path),
        Err(AssetError::Cancelled) => return Err(AssetError::Cancelled),
        Err(err) => {
            warn!(pdf = %pdf.display(), %err, "vectorization failed, trying raster fallback");
        }
    }

    rasterize_into_svg(tools, runner, pdf, &svg_path, cancel).await?;
    Ok(svg_path)
}

async fn vectorize(
    tools: &AssetTools,
    runner: &ProcessRunner,
    pdf: &Path,
    svg_path: &Path,
    cancel: &CancellationToken,
) -> Result<(), AssetError> {
    let outcome = runner
        .run(
            RunRequest::new([
                tools.vectorizer.clone(),
                "--pdf".to_string(),
                "--page=1".to_string(),
                "--optimize".to_string(),
                "--no-fonts".to_string(),
                format!("--output={}", svg_path.display()),
                pdf.display().to_string(),
            ])
            .timeout(CONVERSION_TIMEOUT)
            .cancel(cancel.clone()),
        )
        .await?;

    if !outcome.success() || !svg_path.is_file() {
        return Err(AssetError::from_outcome(&tools.vectorizer, &outcome));
    }
    debug!(svg = %svg_path.display(), "vectorized pdf page");
    Ok(())
}

/// Renders page 1 to PNG and embeds it in a minimal SVG document.
async fn rasterize_into_svg(
    tools: &AssetTools,
    runner: &ProcessRunner,
    pdf: &Path,
    svg_path: &Path,
    cancel: &CancellationToken,
) -> Result<(), AssetError> {
    let staging = tempfile::tempdir()?;
    let prefix = staging.path().join("page");

    let outcome = runner
        .run(
            RunRequest::new([
                tools.rasterizer.clone(),
                "-png".to_string(),
                "-r".to_string(),
                "150".to_string(),
                "-f".to_string(),
                "1".to_string(),
                "-l".to_string(),
                "1".to_string(),
                pdf.display().to_string(),
                prefix.display().to_string(),
            ])
            .timeout(CONVERSION_TIMEOUT)
            .cancel(cancel.clone()),
        )
        .await?;
    if !outcome.success() {
        return Err(AssetError::from_outcome(&tools.rasterizer, &outcome));
    }

    // pdftoppm names single-page output either `page-1.png` or `page-01.png`
    // depending on version.
    let mut png = None;
    let mut entries = tokio::fs::read_dir(staging.path()).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().extension().is_some_and(|e| e == "png") {
            png = Some(entry.path());
            break;
        }
    }
    let Some(png) = png else {
        return Err(AssetError::ToolFailed {
            tool: tools.rasterizer.clone(),
            detail: "rasterizer produced no page image".to_string(),
        });
    };

    let bytes = tokio::fs::read(&png).await?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    let svg = format!(
        concat!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" ",
            "xmlns:xlink=\"http://www.w3.org/1999/xlink\">",
            "<image xlink:href=\"data:image/png;base64,{}\"/>",
            "</svg>\n"
        ),
        encoded
    );
    tokio::fs::write(svg_path, svg).await?;
    debug!(svg = %svg_path.display(), "wrapped rasterized pdf page");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> AssetTools {
        AssetTools {
            compiler: "/bin/false".to_string(),
            vectorizer: "/bin/false".to_string(),
            rasterizer: "/bin/false".to_string(),
        }
    }

    #[tokio::test]
    async fn missing_input_is_rejected_before_any_tool_runs() {
        let tools = tools();
        let runner = tools.runner();
        let out = tempfile::tempdir().unwrap();
        let err = convert_pdf_to_svg(
            &tools,
            &runner,
            Path::new("/nonexistent/figure.pdf"),
            out.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AssetError::MissingInput(_)));
    }

    #[tokio::test]
    async fn failing_tools_surface_a_tool_error() {
        let tools = tools();
        let runner = tools.runner();
        let staging = tempfile::tempdir().unwrap();
        let pdf = staging.path().join("figure.pdf");
        std::fs::write(&pdf, b"%PDF-1.4 stub").unwrap();

        let err = convert_pdf_to_svg(
            &tools,
            &runner,
            &pdf,
            staging.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AssetError::ToolFailed { .. }));
    }
}
