//! Process-id marker file

use crate::error::{RelayError, Result};
use std::io;
use std::path::{Path, PathBuf};

/// A file holding this process's id, removed again on drop
pub struct PidFile {
    path: PathBuf,
    removed: bool,
}

impl PidFile {
    /// Write the current pid as decimal followed by a newline
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::write(path, format!("{}\n", std::process::id())).map_err(|source| {
            RelayError::PidFile {
                path: path.to_path_buf(),
                source,
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            removed: false,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Idempotent; a file already gone is not an error.
    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;

        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(file = %self.path.display(), error = %e, "failed to remove pid file"),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.remove();
    }
}
