use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

/// Holds the process id on disk for the host's process discovery; removed
/// again when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> io::Result<Self> {
        fs::write(path, format!("{}\n", std::process::id()))?;
        debug!("wrote pid file {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("could not remove pid file {}: {err}", self.path.display());
        }
    }
}
