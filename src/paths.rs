//! Per-user locations of the configuration file, image library and cache.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::Error;

pub const APP_NAME: &str = "randofetch";
pub const CONFIG_FILE_NAME: &str = "fetchers.yaml";
pub const CACHE_FILE_NAME: &str = "fetchers.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Holds `fetchers.yaml`.
    pub config_dir: PathBuf,
    /// Holds the image library and the fetcher cache.
    pub data_dir: PathBuf,
}

impl Paths {
    pub fn new(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Resolve the platform directories, honouring explicit overrides.
    ///
    /// # Errors
    /// Fails when the platform has no notion of a per-user config or data
    /// directory and no override was given.
    pub fn resolve(config_dir: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self, Error> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => platform_dir(dirs::config_dir(), "config")?,
        };
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => platform_dir(dirs::data_dir(), "data")?,
        };
        Ok(Self::new(config_dir, data_dir))
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.data_dir.join(CACHE_FILE_NAME)
    }

    pub fn ensure_dirs(&self) -> Result<(), Error> {
        for dir in [&self.config_dir, &self.data_dir] {
            create_dir(dir)?;
        }
        Ok(())
    }
}

fn platform_dir(base: Option<PathBuf>, kind: &str) -> Result<PathBuf, Error> {
    base.map(|dir| dir.join(APP_NAME)).ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no per-user {kind} directory on this platform; pass --{kind}-dir"),
        ))
    })
}

fn create_dir(dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(dir).map_err(|err| {
        Error::Io(io::Error::new(
            err.kind(),
            format!("failed to create {}: {err}", dir.display()),
        ))
    })
}
