//! Management of the image library stored in the data directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Error;
use crate::scan::{is_supported_image, scan_images};

/// Extensions accepted by `add_images` without `force`.
pub const IMPORTABLE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Copy,
    Link,
}

/// Copy or symlink `sources` into `library`. Returns the new library paths.
///
/// Files with an unrecognised extension are refused unless `force` is set;
/// existing entries with the same file name are replaced.
pub fn add_images(
    library: &Path,
    sources: &[PathBuf],
    mode: ImportMode,
    force: bool,
) -> Result<Vec<PathBuf>, Error> {
    if !force
        && let Some(bad) = sources
            .iter()
            .find(|src| !is_supported_image(src, IMPORTABLE_EXTENSIONS))
    {
        return Err(Error::Library(format!(
            "{} is not a jpg, png or bmp image (use --force to add it anyway)",
            bad.display()
        )));
    }

    fs::create_dir_all(library)?;
    let mut added = Vec::with_capacity(sources.len());
    for src in sources {
        let source = src.canonicalize().map_err(|err| {
            Error::Library(format!("cannot read {}: {err}", src.display()))
        })?;
        if !source.is_file() {
            return Err(Error::Library(format!("{} is not a file", src.display())));
        }
        let Some(file_name) = source.file_name() else {
            return Err(Error::Library(format!("{} has no file name", src.display())));
        };
        let dest = library.join(file_name);
        if dest.symlink_metadata().is_ok() {
            debug!(dest = %dest.display(), "replacing existing library entry");
            fs::remove_file(&dest)?;
        }
        match mode {
            ImportMode::Copy => {
                fs::copy(&source, &dest)?;
            }
            ImportMode::Link => link(&source, &dest)?,
        }
        info!(source = %source.display(), dest = %dest.display(), ?mode, "added image");
        added.push(dest);
    }
    Ok(added)
}

/// Every image currently in the library.
pub fn list_images<S: AsRef<str>>(library: &Path, exts: &[S]) -> Result<Vec<PathBuf>, Error> {
    scan_images(library, exts)
}

/// Delete the library entry called `name` and return its path.
pub fn remove_image(library: &Path, name: &str) -> Result<PathBuf, Error> {
    let is_plain_name = Path::new(name)
        .file_name()
        .is_some_and(|file| file == name);
    if !is_plain_name {
        return Err(Error::Library(format!(
            "`{name}` is not a file name inside the library"
        )));
    }
    let path = library.join(name);
    if path.symlink_metadata().is_err() {
        return Err(Error::Library(format!("no image named `{name}` in the library")));
    }
    fs::remove_file(&path)?;
    info!(path = %path.display(), "removed image");
    Ok(path)
}

#[cfg(unix)]
fn link(source: &Path, dest: &Path) -> Result<(), Error> {
    std::os::unix::fs::symlink(source, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn link(_source: &Path, _dest: &Path) -> Result<(), Error> {
    Err(Error::Library(
        "linking images is only supported on unix".to_string(),
    ))
}
