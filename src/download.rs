//! On-demand packaging of a completed job's output.
//!
//! The archive contains the final HTML at its root plus the `assets/`
//! subtree; converter and compiler scratch directories are not shipped.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::ConvertError;

/// Packages `output_dir` into a ZIP at `zip_path`.
///
/// # Errors
///
/// - [`ConvertError::NotReady`] when there is no final HTML to ship.
/// - [`ConvertError::Internal`] on I/O failures.
pub fn package_output(output_dir: &Path, zip_path: &Path) -> Result<(), ConvertError> {
    let final_html = output_dir.join("final.html");
    if !final_html.is_file() {
        return Err(ConvertError::NotReady(format!(
            "no final output under {}",
            output_dir.display()
        )));
    }

    let file = File::create(zip_path).map_err(ConvertError::internal)?;
    let mut writer = ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    append_file(&mut writer, &final_html, "final.html", options)?;

    let assets_dir = output_dir.join("assets");
    for entry in WalkDir::new(&assets_dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let relative = entry
            .path()
            .strip_prefix(output_dir)
            .map_err(ConvertError::internal)?
            .to_string_lossy()
            .replace('\\', "/");
        append_file(&mut writer, entry.path(), &relative, options)?;
    }

    writer.finish().map_err(ConvertError::internal)?;
    Ok(())
}

fn append_file(
    writer: &mut ZipWriter<File>,
    source: &Path,
    name: &str,
    options: SimpleFileOptions,
) -> Result<(), ConvertError> {
    writer
        .start_file(name, options)
        .map_err(ConvertError::internal)?;
    let mut reader = File::open(source).map_err(ConvertError::internal)?;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer).map_err(ConvertError::internal)?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .map_err(ConvertError::internal)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packages_final_html_and_assets_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("final.html"), "<html></html>").unwrap();
        std::fs::create_dir_all(dir.path().join("assets/figures")).unwrap();
        std::fs::write(dir.path().join("assets/figures/a.svg"), "<svg/>").unwrap();
        std::fs::create_dir_all(dir.path().join("converter")).unwrap();
        std::fs::write(dir.path().join("converter/raw.html"), "raw").unwrap();

        let zip_path = dir.path().join("download.zip");
        package_output(dir.path(), &zip_path).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&zip_path).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"final.html".to_string()));
        assert!(names.contains(&"assets/figures/a.svg".to_string()));
        assert!(!names.iter().any(|n| n.contains("converter")));
    }

    #[test]
    fn refuses_to_package_an_unfinished_job() {
        let dir = tempfile::tempdir().unwrap();
        let err = package_output(dir.path(), &dir.path().join("d.zip")).unwrap_err();
        assert!(matches!(err, ConvertError::NotReady(_)));
    }
}
