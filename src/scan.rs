//! Discovery of image files in the randofetch data directory.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::Error;

/// Return `true` if `path` has one of `exts` (lowercase, without dot).
#[must_use]
pub fn is_supported_image<S: AsRef<str>>(path: &Path, exts: &[S]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            exts.iter().any(|e| e.as_ref() == ext)
        })
}

/// List the images directly inside `dir`, sorted, as absolute paths.
///
/// A missing directory yields no images. Hidden files are skipped.
///
/// # Errors
/// Returns [`Error::Io`] if `dir` exists but cannot be read.
pub fn scan_images<S: AsRef<str>>(dir: &Path, exts: &[S]) -> Result<Vec<PathBuf>, Error> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let root = dir.canonicalize()?;

    let mut out = Vec::new();
    for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|err| Error::Io(err.into()))?;
        if entry.file_name().to_str().is_some_and(|n| n.starts_with('.')) {
            continue;
        }
        // Follow symlinks so linked images count.
        let path = entry.path();
        if path.is_file() && is_supported_image(path, exts) {
            out.push(path.to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}
