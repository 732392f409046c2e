//! Project analysis over an extracted archive.
//!
//! Finds the main source file, buckets supporting files by category, and
//! parses the main file (comments stripped) for the declared class,
//! packages, and referenced inputs/graphics.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::ConvertError;

/// Well-known main-file names, tried in order before any heuristic.
const MAIN_CANDIDATES: &[&str] = &[
    "main.tex",
    "document.tex",
    "finalmanuscript.tex",
    "paper.tex",
    "article.tex",
    "manuscript.tex",
];

const GRAPHICS_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg", "eps", "ps", "svg"];

/// Everything the later stages need to know about a project.
#[derive(Debug, Clone, Default)]
pub struct ProjectStructure {
    pub root: PathBuf,
    pub main_file: PathBuf,
    pub tex_files: Vec<PathBuf>,
    pub class_files: Vec<PathBuf>,
    pub style_files: Vec<PathBuf>,
    pub bib_files: Vec<PathBuf>,
    pub bib_style_files: Vec<PathBuf>,
    pub graphics_files: Vec<PathBuf>,
    pub document_class: Option<String>,
    pub packages: Vec<String>,
    pub include_refs: Vec<String>,
    pub bibliography_refs: Vec<String>,
    pub graphics_refs: Vec<String>,
}

impl ProjectStructure {
    /// Total file count across all buckets, used for budget sizing.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.tex_files.len()
            + self.class_files.len()
            + self.style_files.len()
            + self.bib_files.len()
            + self.bib_style_files.len()
            + self.graphics_files.len()
    }

    /// Names of class files shipped in the project, without extension.
    #[must_use]
    pub fn custom_class_names(&self) -> Vec<String> {
        self.class_files
            .iter()
            .filter_map(|p| p.file_stem())
            .map(|s| s.to_string_lossy().to_string())
            .collect()
    }
}

/// The analyzer. Regexes compile once at construction.
pub struct ProjectAnalyzer {
    max_depth: Option<usize>,
    document_class: Regex,
    usepackage: Regex,
    input_ref: Regex,
    include_ref: Regex,
    bibliography_ref: Regex,
    graphics_ref: Regex,
}

impl Default for ProjectAnalyzer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProjectAnalyzer {
    #[must_use]
    pub fn new(max_depth: Option<usize>) -> Self {
        Self {
            max_depth,
            document_class: Regex::new(r"\\documentclass(?:\[[^\]]*\])?\{([^}]+)\}")
                .expect("static regex"),
            usepackage: Regex::new(r"\\usepackage(?:\[[^\]]*\])?\{([^}]+)\}")
                .expect("static regex"),
            input_ref: Regex::new(r"\\input\{([^}]+)\}").expect("static regex"),
            include_ref: Regex::new(r"\\include\{([^}]+)\}").expect("static regex"),
            bibliography_ref: Regex::new(r"\\bibliography\{([^}]+)\}").expect("static regex"),
            graphics_ref: Regex::new(r"\\includegraphics(?:\[[^\]]*\])?\{([^}]+)\}")
                .expect("static regex"),
        }
    }

    /// Analyzes an extraction root.
    ///
    /// # Errors
    ///
    /// - [`ConvertError::NoMainSource`] when no `.tex` file exists.
    /// - [`ConvertError::Internal`] when the chosen main file cannot be
    ///   read.
    pub fn analyze(&self, root: &Path) -> Result<ProjectStructure, ConvertError> {
        let files = self.walk(root);
        let mut structure = ProjectStructure {
            root: root.to_path_buf(),
            ..ProjectStructure::default()
        };

        for (_, path) in &files {
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            match ext.as_str() {
                "tex" | "latex" | "ltx" => structure.tex_files.push(path.clone()),
                "cls" => structure.class_files.push(path.clone()),
                "sty" => structure.style_files.push(path.clone()),
                "bib" | "bbl" => structure.bib_files.push(path.clone()),
                "bst" => structure.bib_style_files.push(path.clone()),
                _ if GRAPHICS_EXTENSIONS.contains(&ext.as_str()) => {
                    structure.graphics_files.push(path.clone());
                }
                _ => {}
            }
        }

        structure.main_file = select_main_file(&files).ok_or(ConvertError::NoMainSource)?;
        info!(main = %structure.main_file.display(), tex_files = structure.tex_files.len(), "analyzed project");

        let content = std::fs::read_to_string(&structure.main_file)
            .map_err(|e| ConvertError::Internal(format!("cannot read main source: {e}")))?;
        self.parse_declarations(&content, &mut structure);
        Ok(structure)
    }

    /// Breadth-ordered listing of files as `(depth, path)`. Symlinked
    /// directory cycles terminate because links are not followed.
    fn walk(&self, root: &Path) -> Vec<(usize, PathBuf)> {
        let mut walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
        if let Some(depth) = self.max_depth {
            walker = walker.max_depth(depth);
        }
        let mut files: Vec<(usize, PathBuf)> = walker
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| (e.depth(), e.into_path()))
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        files
    }

    fn parse_declarations(&self, content: &str, structure: &mut ProjectStructure) {
        let stripped = strip_comments(content);

        structure.document_class = self
            .document_class
            .captures(&stripped)
            .map(|c| c[1].trim().to_string());

        for captures in self.usepackage.captures_iter(&stripped) {
            // One declaration may load several packages: \usepackage{a,b}.
            for package in captures[1].split(',') {
                let package = package.trim().to_string();
                if !package.is_empty() && !structure.packages.contains(&package) {
                    structure.packages.push(package);
                }
            }
        }
        structure.packages.sort();

        collect_refs(&self.input_ref, &stripped, &mut structure.include_refs);
        collect_refs(&self.include_ref, &stripped, &mut structure.include_refs);
        collect_refs(&self.bibliography_ref, &stripped, &mut structure.bibliography_refs);
        collect_refs(&self.graphics_ref, &stripped, &mut structure.graphics_refs);

        debug!(
            class = structure.document_class.as_deref().unwrap_or("none"),
            packages = structure.packages.len(),
            graphics = structure.graphics_refs.len(),
            "parsed main-source declarations"
        );
    }
}

/// §4.4 selection: known names first (shallowest, then lexicographic), then
/// the largest `.tex` at the shallowest depth, ties lexicographic.
fn select_main_file(files: &[(usize, PathBuf)]) -> Option<PathBuf> {
    let tex_files: Vec<&(usize, PathBuf)> = files
        .iter()
        .filter(|(_, p)| {
            p.extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("tex"))
        })
        .collect();
    if tex_files.is_empty() {
        return None;
    }

    for candidate in MAIN_CANDIDATES {
        // `files` is sorted by (depth, path), so the first hit is the
        // shallowest and lexicographically smallest.
        if let Some((_, path)) = tex_files.iter().find(|(_, p)| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(candidate))
        }) {
            return Some(path.clone());
        }
    }

    let shallowest = tex_files.iter().map(|(d, _)| *d).min()?;
    tex_files
        .iter()
        .filter(|(d, _)| *d == shallowest)
        .max_by(|(_, a), (_, b)| {
            let size_a = std::fs::metadata(a).map(|m| m.len()).unwrap_or(0);
            let size_b = std::fs::metadata(b).map(|m| m.len()).unwrap_or(0);
            size_a.cmp(&size_b).then_with(|| b.cmp(a))
        })
        .map(|(_, p)| p.clone())
}

fn collect_refs(pattern: &Regex, content: &str, bucket: &mut Vec<String>) {
    for captures in pattern.captures_iter(content) {
        let value = captures[1].trim().to_string();
        if !value.is_empty() && !bucket.contains(&value) {
            bucket.push(value);
        }
    }
}

/// Removes `%` comments, honoring escaped `\%`.
fn strip_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        match unescaped_percent_index(line) {
            Some(index) => out.push_str(&line[..index]),
            None => out.push_str(line),
        }
        out.push('\n');
    }
    out
}

fn unescaped_percent_index(line: &str) -> Option<usize> {
    let mut escaped = false;
    for (index, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        if ch == '%' {
            return Some(index);
        }
    }
    None
}
