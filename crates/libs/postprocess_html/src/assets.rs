//! Asset discovery, conversion, and reference rewriting.
//!
//! The DOM is scanned once for PDF references and TikZ fragments; the actual
//! conversions run on plain paths and strings (so they can be awaited
//! concurrently), and a second DOM pass applies the successful rewrites.
//! A failed conversion keeps the original reference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use convert_assets::{convert_pdf_to_svg, convert_tikz_to_svg, AssetTools};
use futures::stream::{FuturesUnordered, StreamExt};
use kuchikiki::NodeRef;
use run_process::ProcessRunner;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dom;

/// Bound on concurrent asset conversions within one job.
pub const ASSET_POOL_SIZE: usize = 4;

const TIKZ_BEGIN: &str = "\\begin{tikzpicture}";
const TIKZ_END: &str = "\\end{tikzpicture}";

/// One discovered asset needing conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetWork {
    /// A referenced PDF figure, keyed by its raw `src`/`data` value.
    Pdf { rel_src: String },
    /// A raw TikZ fragment, keyed by its position among fragment spans.
    Tikz { index: usize, fragment: String },
}

/// Results of the conversion phase, applied back onto the DOM later.
#[derive(Debug, Default)]
pub struct AssetOutcomes {
    /// Original reference value → new relative SVG path.
    pub pdf_rewrites: HashMap<String, String>,
    /// Fragment index → new relative SVG path.
    pub tikz_rewrites: HashMap<usize, String>,
    /// Absolute paths of files produced under the assets directory.
    pub produced: Vec<PathBuf>,
    /// Human-readable failures; the originals stay referenced.
    pub failures: Vec<String>,
}

/// Scans parsed HTML for convertible assets. Pure read, no mutation.
#[must_use]
pub fn scan_assets(html: &str) -> Vec<AssetWork> {
    let doc = dom::parse(html);
    let mut work = Vec::new();

    for node in referenced_images(&doc) {
        let Some((_, value)) = image_ref(&node) else {
            continue;
        };
        if is_relative_pdf(&value) && !work.contains(&AssetWork::Pdf { rel_src: value.clone() }) {
            work.push(AssetWork::Pdf { rel_src: value });
        }
    }

    for (index, span) in tikz_spans(&doc).into_iter().enumerate() {
        let text = span.text_contents();
        if let Some(fragment) = extract_tikz_fragment(&text) {
            work.push(AssetWork::Tikz { index, fragment });
        }
    }

    work
}

/// Runs the conversions with a pool of [`ASSET_POOL_SIZE`] workers.
pub async fn convert_all(
    work: Vec<AssetWork>,
    tools: &AssetTools,
    runner: &ProcessRunner,
    html_dir: &Path,
    assets_dir: &Path,
    cancel: &CancellationToken,
) -> AssetOutcomes {
    let mut outcomes = AssetOutcomes::default();
    let mut queue = work.into_iter();
    let mut in_flight = FuturesUnordered::new();

    let spawn = |item: AssetWork| {
        let tools = tools.clone();
        let runner = runner.clone();
        let html_dir = html_dir.to_path_buf();
        let assets_dir = assets_dir.to_path_buf();
        let cancel = cancel.clone();
        async move { convert_one(item, &tools, &runner, &html_dir, &assets_dir, &cancel).await }
    };

    for item in queue.by_ref().take(ASSET_POOL_SIZE) {
        in_flight.push(spawn(item));
    }
    while let Some(result) = in_flight.next().await {
        if let Some(item) = queue.next() {
            in_flight.push(spawn(item));
        }
        match result {
            ConvertedAsset::Pdf { rel_src, new_src, path } => {
                debug!(from = %rel_src, to = %new_src, "converted pdf reference");
                outcomes.pdf_rewrites.insert(rel_src, new_src);
                outcomes.produced.push(path);
            }
            ConvertedAsset::Tikz { index, new_src, path } => {
                debug!(index, to = %new_src, "converted tikz fragment");
                outcomes.tikz_rewrites.insert(index, new_src);
                outcomes.produced.push(path);
            }
            ConvertedAsset::Failed(message) => {
                warn!(%message, "asset conversion failed, keeping original reference");
                outcomes.failures.push(message);
            }
        }
    }

    outcomes
}

enum ConvertedAsset {
    Pdf {
        rel_src: String,
        new_src: String,
        path: PathBuf,
    },
    Tikz {
        index: usize,
        new_src: String,
        path: PathBuf,
    },
    Failed(String),
}

async fn convert_one(
    item: AssetWork,
    tools: &AssetTools,
    runner: &ProcessRunner,
    html_dir: &Path,
    assets_dir: &Path,
    cancel: &CancellationToken,
) -> ConvertedAsset {
    match item {
        AssetWork::Pdf { rel_src } => {
            let source = html_dir.join(&rel_src);
            // Collisions between figures of the same name are resolved by
            // preserving the reference's subdirectory structure.
            let sub_dir = Path::new(&rel_src)
                .parent()
                .unwrap_or_else(|| Path::new(""));
            let out_dir = assets_dir.join(sub_dir);
            match convert_pdf_to_svg(tools, runner, &source, &out_dir, cancel).await {
                Ok(path) => {
                    let stem = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    let new_src = join_rel("assets", &sub_dir.join(stem));
                    ConvertedAsset::Pdf { rel_src, new_src, path }
                }
                Err(err) => ConvertedAsset::Failed(format!("{rel_src}: {err}")),
            }
        }
        AssetWork::Tikz { index, fragment } => {
            let name = format!("picture{}", index + 1);
            let out_dir = assets_dir.join("tikz");
            match convert_tikz_to_svg(tools, runner, &fragment, &name, &out_dir, cancel).await {
                Ok(path) => ConvertedAsset::Tikz {
                    index,
                    new_src: format!("assets/tikz/{name}.svg"),
                    path,
                },
                Err(err) => ConvertedAsset::Failed(format!("tikz fragment {index}: {err}")),
            }
        }
    }
}

/// Applies the successful conversions onto the DOM.
pub fn apply_rewrites(doc: &NodeRef, outcomes: &AssetOutcomes) -> usize {
    let mut rewritten = 0;

    for node in referenced_images(doc) {
        let Some((attr_name, value)) = image_ref(&node) else {
            continue;
        };
        if let Some(new_src) = outcomes.pdf_rewrites.get(&value) {
            dom::set_attr(&node, attr_name, new_src);
            rewritten += 1;
        }
    }

    for (index, span) in tikz_spans(doc).into_iter().enumerate() {
        if !span.text_contents().contains(TIKZ_BEGIN) {
            continue;
        }
        if let Some(new_src) = outcomes.tikz_rewrites.get(&index) {
            let _ = dom::take_children(&span);
            span.append(dom::make_element(
                "img",
                &[("src", new_src), ("alt", "TikZ diagram"), ("loading", "lazy")],
            ));
            rewritten += 1;
        }
    }

    rewritten
}

/// Rewrites relative references so they resolve from the final HTML location
/// rather than the converter's own output directory.
pub fn normalize_paths(doc: &NodeRef, html_dir: &Path, output_dir: &Path) -> usize {
    let Ok(prefix) = html_dir.strip_prefix(output_dir) else {
        return 0;
    };
    if prefix.as_os_str().is_empty() {
        return 0;
    }

    let mut adjusted = 0;
    for node in referenced_images(doc) {
        let Some((attr_name, value)) = image_ref(&node) else {
            continue;
        };
        if !is_relative_ref(&value) || value.starts_with("assets/") {
            continue;
        }
        if html_dir.join(&value).is_file() {
            dom::set_attr(&node, attr_name, &join_rel_str(prefix, &value));
            adjusted += 1;
        }
    }
    for link in dom::select_all(doc, "a") {
        let Some(href) = dom::attr(&link, "href") else {
            continue;
        };
        if !is_relative_ref(&href) || href.starts_with("assets/") {
            continue;
        }
        if html_dir.join(&href).is_file() {
            dom::set_attr(&link, "href", &join_rel_str(prefix, &href));
            adjusted += 1;
        }
    }
    adjusted
}

/// External links open in a new tab without leaking the opener.
pub fn harden_external_links(doc: &NodeRef) -> usize {
    let mut hardened = 0;
    for link in dom::select_all(doc, "a") {
        let Some(href) = dom::attr(&link, "href") else {
            continue;
        };
        if href.starts_with("http://") || href.starts_with("https://") {
            if dom::attr(&link, "target").is_none() {
                dom::set_attr(&link, "target", "_blank");
                dom::set_attr(&link, "rel", "noopener noreferrer");
                hardened += 1;
            }
        }
    }
    hardened
}

fn referenced_images(doc: &NodeRef) -> Vec<NodeRef> {
    let mut nodes = dom::select_all(doc, "img");
    nodes.extend(dom::select_all(doc, "object"));
    nodes
}

/// The reference attribute for an image-like element.
fn image_ref(node: &NodeRef) -> Option<(&'static str, String)> {
    match dom::element_name(node)?.as_str() {
        "img" => dom::attr(node, "src").map(|v| ("src", v)),
        "object" => dom::attr(node, "data").map(|v| ("data", v)),
        _ => None,
    }
}

fn tikz_spans(doc: &NodeRef) -> Vec<NodeRef> {
    dom::select_all(doc, "span.ltx_picture")
}

fn is_relative_ref(value: &str) -> bool {
    !(value.is_empty()
        || value.starts_with('/')
        || value.starts_with('#')
        || value.contains("://")
        || value.starts_with("data:"))
}

fn is_relative_pdf(value: &str) -> bool {
    is_relative_ref(value) && value.to_ascii_lowercase().ends_with(".pdf")
}

fn extract_tikz_fragment(text: &str) -> Option<String> {
    let start = text.find(TIKZ_BEGIN)?;
    let end = text[start..].find(TIKZ_END)? + start + TIKZ_END.len();
    Some(text[start..end].to_string())
}

fn join_rel(first: &str, rest: &Path) -> String {
    let mut path = PathBuf::from(first);
    path.push(rest);
    path.to_string_lossy().replace('\\', "/")
}

fn join_rel_str(prefix: &Path, value: &str) -> String {
    let mut path = prefix.to_path_buf();
    path.push(value);
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{attr, parse, select_first, serialize};

    #[test]
    fn scan_finds_pdf_refs_and_tikz_fragments() {
        let work = scan_assets(
            "<html><body>\
             <img src=\"figures/plot.pdf\"/>\
             <img src=\"figures/plot.pdf\"/>\
             <img src=\"https://cdn.example/x.pdf\"/>\
             <img src=\"photo.png\"/>\
             <span class=\"ltx_picture\">\\begin{tikzpicture}\\draw;\\end{tikzpicture}</span>\
             </body></html>",
        );
        assert_eq!(work.len(), 2);
        assert!(matches!(&work[0], AssetWork::Pdf { rel_src } if rel_src == "figures/plot.pdf"));
        assert!(matches!(&work[1], AssetWork::Tikz { index: 0, .. }));
    }

    #[test]
    fn rewrites_point_references_at_converted_svgs() {
        let doc = parse(
            "<html><body><img src=\"figures/plot.pdf\"/>\
             <span class=\"ltx_picture\">\\begin{tikzpicture}x\\end{tikzpicture}</span>\
             </body></html>",
        );
        let mut outcomes = AssetOutcomes::default();
        outcomes
            .pdf_rewrites
            .insert("figures/plot.pdf".into(), "assets/figures/plot.svg".into());
        outcomes
            .tikz_rewrites
            .insert(0, "assets/tikz/picture1.svg".into());

        assert_eq!(apply_rewrites(&doc, &outcomes), 2);
        let img = select_first(&doc, "img").unwrap();
        assert_eq!(attr(&img, "src").as_deref(), Some("assets/figures/plot.svg"));
        let tikz_img = select_first(&doc, "span.ltx_picture img").unwrap();
        assert_eq!(
            attr(&tikz_img, "src").as_deref(),
            Some("assets/tikz/picture1.svg")
        );
        let html = serialize(&doc);
        assert!(!html.contains("tikzpicture"));
    }

    #[test]
    fn failed_conversions_keep_the_original_reference() {
        let doc = parse("<html><body><img src=\"figures/plot.pdf\"/></body></html>");
        let outcomes = AssetOutcomes::default();
        assert_eq!(apply_rewrites(&doc, &outcomes), 0);
        let img = select_first(&doc, "img").unwrap();
        assert_eq!(attr(&img, "src").as_deref(), Some("figures/plot.pdf"));
    }

    #[test]
    fn normalize_prefixes_refs_that_exist_in_the_converter_dir() {
        let out = tempfile::tempdir().unwrap();
        let converter = out.path().join("converter");
        std::fs::create_dir_all(converter.join("figures")).unwrap();
        std::fs::write(converter.join("figures/a.png"), b"png").unwrap();

        let doc = parse(
            "<html><body><img src=\"figures/a.png\"/><img src=\"missing.png\"/></body></html>",
        );
        assert_eq!(normalize_paths(&doc, &converter, out.path()), 1);
        let img = select_first(&doc, "img").unwrap();
        assert_eq!(attr(&img, "src").as_deref(), Some("converter/figures/a.png"));
    }

    #[test]
    fn external_links_get_target_and_rel() {
        let doc = parse(
            "<html><body><a href=\"https://example.org\">x</a><a href=\"#sec1\">y</a></body></html>",
        );
        assert_eq!(harden_external_links(&doc), 1);
        let link = select_first(&doc, "a[href='https://example.org']").unwrap();
        assert_eq!(attr(&link, "target").as_deref(), Some("_blank"));
        assert_eq!(attr(&link, "rel").as_deref(), Some("noopener noreferrer"));
    }

    #[test]
    fn tikz_fragment_extraction_is_bounded() {
        assert_eq!(
            extract_tikz_fragment("pre \\begin{tikzpicture}A\\end{tikzpicture} post"),
            Some("\\begin{tikzpicture}A\\end{tikzpicture}".to_string())
        );
        assert_eq!(extract_tikz_fragment("no tikz here"), None);
    }
}
