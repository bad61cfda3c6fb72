//! Single-file outputs written next to their final path and renamed into
//! place once complete.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::BuildError;

/// An output file staged as `<final>.tmp`.
///
/// Dropped without [`publish`](Self::publish), whatever was written to the
/// tmp path is removed, so a failed tool never leaves a partial file behind.
#[derive(Debug)]
pub struct StagedFile {
    tmp_path: PathBuf,
    final_path: PathBuf,
    published: bool,
}

impl StagedFile {
    pub fn new(final_path: PathBuf) -> Self {
        let mut tmp = final_path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            tmp_path: PathBuf::from(tmp),
            final_path,
            published: false,
        }
    }

    /// Where the producing tool should write
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Rename the finished tmp file to its final name.
    pub fn publish(mut self) -> Result<PathBuf, BuildError> {
        fs::rename(&self.tmp_path, &self.final_path).map_err(|e| BuildError::FinalizeFailed {
            tmp: self.tmp_path.clone(),
            out: self.final_path.clone(),
            reason: e.to_string(),
        })?;
        self.published = true;
        Ok(self.final_path.clone())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.published || !self.tmp_path.exists() {
            return;
        }
        match fs::remove_file(&self.tmp_path) {
            Ok(()) => log::debug!("Removed partial output {}", self.tmp_path.display()),
            Err(e) => log::warn!(
                "Failed to remove partial output {}: {}",
                self.tmp_path.display(),
                e
            ),
        }
    }
}
