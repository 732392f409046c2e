//! Archive extraction with hostile-input guards.
//!
//! Accepts ZIP, TAR, and TAR.GZ. Every member is validated before a single
//! byte is unpacked: absolute paths, parent-dir escapes, oversized
//! components, excessive depth, member-count limits, and the expansion bomb
//! guard all reject the archive outright. Symbolic links are dropped.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::error::ConvertError;

/// Extensions worth extracting from a LaTeX project archive.
const KEEP_EXTENSIONS: &[&str] = &[
    "tex", "latex", "ltx", "cls", "sty", "bib", "bst", "bbl", "aux", "toc", "lof", "lot", "pdf",
    "png", "jpg", "jpeg", "eps", "ps", "svg", "txt", "md",
];

/// Threshold for switching to bulk extraction.
const BULK_MIN_MEMBERS: usize = 50;
const BULK_MIN_KEEP_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    /// Combined extracted size may not exceed `ratio × archive size`.
    pub max_expansion_ratio: u64,
    /// Nor this absolute cap.
    pub max_total_bytes: u64,
    pub max_members: usize,
    /// Per path component, in bytes.
    pub max_component_bytes: usize,
    /// Maximum member path depth.
    pub max_depth: usize,
    pub timeout: Duration,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_expansion_ratio: 10,
            max_total_bytes: 2 * 1024 * 1024 * 1024,
            max_members: 50_000,
            max_component_bytes: 255,
            max_depth: 32,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractSummary {
    pub members_total: usize,
    pub files_extracted: usize,
    pub symlinks_dropped: usize,
    pub bytes_written: u64,
    /// Whether the bulk path was taken (§4.3 heuristic).
    pub bulk: bool,
}

#[derive(Debug)]
struct MemberMeta {
    path: PathBuf,
    size: u64,
    is_dir: bool,
    is_symlink: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

fn detect_kind(archive: &Path) -> Result<ArchiveKind, ConvertError> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".zip") {
        Ok(ArchiveKind::Zip)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(ArchiveKind::TarGz)
    } else if name.ends_with(".tar") {
        Ok(ArchiveKind::Tar)
    } else {
        Err(ConvertError::UnsafeArchive {
            reason: format!("unsupported archive type: {name}"),
        })
    }
}

/// Unpacks `archive` into `dest` under the configured limits.
///
/// # Errors
///
/// - [`ConvertError::UnsafeArchive`] when any §4.3 policy check fails,
///   the container is unreadable, or extraction exceeds the wall clock.
/// - [`ConvertError::Internal`] for filesystem errors on our side.
pub async fn extract_archive(
    archive: &Path,
    dest: &Path,
    limits: ExtractLimits,
) -> Result<ExtractSummary, ConvertError> {
    let kind = detect_kind(archive)?;
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    let work = tokio::task::spawn_blocking(move || extract_sync(kind, &archive, &dest, &limits));
    match tokio::time::timeout(limits.timeout, work).await {
        Ok(joined) => joined.map_err(|e| ConvertError::Internal(e.to_string()))?,
        Err(_) => Err(ConvertError::UnsafeArchive {
            reason: format!("extraction exceeded {}s", limits.timeout.as_secs()),
        }),
    }
}

fn extract_sync(
    kind: ArchiveKind,
    archive: &Path,
    dest: &Path,
    limits: &ExtractLimits,
) -> Result<ExtractSummary, ConvertError> {
    let archive_size = std::fs::metadata(archive)
        .map_err(|e| ConvertError::Internal(format!("cannot stat archive: {e}")))?
        .len();

    let members = match kind {
        ArchiveKind::Zip => zip_members(archive)?,
        ArchiveKind::Tar | ArchiveKind::TarGz => tar_members(kind, archive)?,
    };
    validate_members(&members, archive_size, limits)?;

    let keep: HashSet<usize> = members
        .iter()
        .enumerate()
        .filter(|(_, m)| !m.is_dir && !m.is_symlink && is_kept(&m.path))
        .map(|(i, _)| i)
        .collect();
    let real_files = members.iter().filter(|m| !m.is_dir && !m.is_symlink).count();
    let bulk = real_files >= BULK_MIN_MEMBERS
        && keep.len() as f64 >= real_files as f64 * BULK_MIN_KEEP_RATIO;
    debug!(
        members = members.len(),
        kept = keep.len(),
        bulk,
        "validated archive members"
    );

    std::fs::create_dir_all(dest).map_err(|e| ConvertError::Internal(e.to_string()))?;

    let mut summary = ExtractSummary {
        members_total: members.len(),
        symlinks_dropped: members.iter().filter(|m| m.is_symlink).count(),
        bulk,
        ..ExtractSummary::default()
    };
    let should_extract =
        |index: usize| -> bool { bulk || keep.contains(&index) };

    match kind {
        ArchiveKind::Zip => zip_extract(archive, dest, &members, should_extract, &mut summary)?,
        ArchiveKind::Tar | ArchiveKind::TarGz => {
            tar_extract(kind, archive, dest, &members, should_extract, &mut summary)?;
        }
    }

    info!(
        files = summary.files_extracted,
        bytes = summary.bytes_written,
        "extracted archive"
    );
    Ok(summary)
}

fn validate_members(
    members: &[MemberMeta],
    archive_size: u64,
    limits: &ExtractLimits,
) -> Result<(), ConvertError> {
    if members.is_empty() {
        return Err(ConvertError::UnsafeArchive {
            reason: "archive contains no members".to_string(),
        });
    }
    if members.len() > limits.max_members {
        return Err(ConvertError::UnsafeArchive {
            reason: format!("{} members exceeds the {} limit", members.len(), limits.max_members),
        });
    }

    let bomb_limit = limits
        .max_total_bytes
        .min(archive_size.saturating_mul(limits.max_expansion_ratio));
    let mut total = 0u64;

    for member in members {
        let path = &member.path;
        if path.is_absolute() {
            return Err(ConvertError::UnsafeArchive {
                reason: format!("absolute member path: {}", path.display()),
            });
        }
        let mut depth = 0usize;
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(ConvertError::UnsafeArchive {
                            reason: format!("member escapes extraction root: {}", path.display()),
                        });
                    }
                    depth -= 1;
                }
                Component::Normal(part) => {
                    if part.as_encoded_bytes().len() > limits.max_component_bytes {
                        return Err(ConvertError::UnsafeArchive {
                            reason: format!(
                                "path component longer than {} bytes in {}",
                                limits.max_component_bytes,
                                path.display()
                            ),
                        });
                    }
                    depth += 1;
                }
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ConvertError::UnsafeArchive {
                        reason: format!("absolute member path: {}", path.display()),
                    });
                }
            }
            if depth > limits.max_depth {
                return Err(ConvertError::UnsafeArchive {
                    reason: format!("member deeper than {} levels: {}", limits.max_depth, path.display()),
                });
            }
        }

        total = total.saturating_add(member.size);
        if total > bomb_limit {
            return Err(ConvertError::UnsafeArchive {
                reason: format!(
                    "extracted size would exceed {bomb_limit} bytes (expansion bomb guard)"
                ),
            });
        }
    }
    Ok(())
}

fn is_kept(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| KEEP_EXTENSIONS.contains(&ext.as_str()))
}

/// Resolves a validated member path under `dest`.
fn target_path(dest: &Path, member: &Path) -> PathBuf {
    let mut target = dest.to_path_buf();
    for component in member.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::ParentDir => {
                target.pop();
            }
            _ => {}
        }
    }
    target
}

fn zip_members(archive: &Path) -> Result<Vec<MemberMeta>, ConvertError> {
    let file = File::open(archive).map_err(|e| ConvertError::Internal(e.to_string()))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| ConvertError::UnsafeArchive {
        reason: format!("unreadable zip archive: {e}"),
    })?;
    let mut members = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index(index).map_err(|e| ConvertError::UnsafeArchive {
            reason: format!("corrupt zip member: {e}"),
        })?;
        let is_symlink = entry
            .unix_mode()
            .is_some_and(|mode| mode & 0o170_000 == 0o120_000);
        members.push(MemberMeta {
            path: PathBuf::from(entry.name()),
            size: entry.size(),
            is_dir: entry.is_dir(),
            is_symlink,
        });
    }
    Ok(members)
}

fn zip_extract(
    archive: &Path,
    dest: &Path,
    members: &[MemberMeta],
    should_extract: impl Fn(usize) -> bool,
    summary: &mut ExtractSummary,
) -> Result<(), ConvertError> {
    let file = File::open(archive).map_err(|e| ConvertError::Internal(e.to_string()))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| ConvertError::UnsafeArchive {
        reason: format!("unreadable zip archive: {e}"),
    })?;
    for (index, meta) in members.iter().enumerate() {
        if meta.is_dir || meta.is_symlink || !should_extract(index) {
            continue;
        }
        let mut entry = zip
            .by_index(index)
            .map_err(|e| ConvertError::UnsafeArchive {
                reason: format!("corrupt zip member: {e}"),
            })?;
        summary.bytes_written += write_member(dest, &meta.path, &mut entry)?;
        summary.files_extracted += 1;
    }
    Ok(())
}

fn tar_members(kind: ArchiveKind, archive: &Path) -> Result<Vec<MemberMeta>, ConvertError> {
    let mut members = Vec::new();
    visit_tar(kind, archive, |path, header_size, entry_type, _entry| {
        members.push(MemberMeta {
            path,
            size: header_size,
            is_dir: entry_type.is_dir(),
            is_symlink: matches!(entry_type, tar::EntryType::Symlink | tar::EntryType::Link),
        });
        Ok(0)
    })?;
    Ok(members)
}

fn tar_extract(
    kind: ArchiveKind,
    archive: &Path,
    dest: &Path,
    members: &[MemberMeta],
    should_extract: impl Fn(usize) -> bool,
    summary: &mut ExtractSummary,
) -> Result<(), ConvertError> {
    let mut index = 0usize;
    let mut extracted = 0usize;
    let bytes = visit_tar(kind, archive, |path, _size, entry_type, entry| {
        let this = index;
        index += 1;
        let meta = &members[this];
        debug_assert_eq!(meta.path, path);
        if meta.is_dir || meta.is_symlink || !should_extract(this) {
            return Ok(0);
        }
        if !(entry_type.is_file() || entry_type == tar::EntryType::Continuous) {
            return Ok(0);
        }
        let written = write_member(dest, &path, entry)?;
        extracted += 1;
        Ok(written)
    })?;
    summary.bytes_written += bytes;
    summary.files_extracted += extracted;
    Ok(())
}

/// Streams over a tar(.gz), invoking `visit` per entry; sums returned byte
/// counts.
fn visit_tar(
    kind: ArchiveKind,
    archive: &Path,
    mut visit: impl FnMut(PathBuf, u64, tar::EntryType, &mut dyn Read) -> Result<u64, ConvertError>,
) -> Result<u64, ConvertError> {
    let file = File::open(archive).map_err(|e| ConvertError::Internal(e.to_string()))?;
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::TarGz => Box::new(GzDecoder::new(file)),
        _ => Box::new(file),
    };
    let mut tar = tar::Archive::new(reader);
    let entries = tar.entries().map_err(|e| ConvertError::UnsafeArchive {
        reason: format!("unreadable tar archive: {e}"),
    })?;
    let mut total = 0u64;
    for entry in entries {
        let mut entry = entry.map_err(|e| ConvertError::UnsafeArchive {
            reason: format!("corrupt tar member: {e}"),
        })?;
        let path = entry
            .path()
            .map_err(|e| ConvertError::UnsafeArchive {
                reason: format!("undecodable member path: {e}"),
            })?
            .into_owned();
        let size = entry.header().size().unwrap_or(0);
        let entry_type = entry.header().entry_type();
        total += visit(path, size, entry_type, &mut entry)?;
    }
    Ok(total)
}

fn write_member(dest: &Path, member: &Path, reader: &mut dyn Read) -> Result<u64, ConvertError> {
    let target = target_path(dest, member);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConvertError::Internal(e.to_string()))?;
    }
    let mut out = File::create(&target).map_err(|e| ConvertError::Internal(e.to_string()))?;
    std::io::copy(reader, &mut out).map_err(|e| ConvertError::Internal(e.to_string()))
}
