//! `.part` siblings for writes that must appear atomically.

use std::io;
use std::path::{Path, PathBuf};

/// A temporary sibling of a destination file.
///
/// Removed on drop unless [`commit`](PartFile::commit) renamed it into
/// place, so a write abandoned by an error or a dropped future (timeout,
/// cancellation) leaves nothing behind.
#[derive(Debug)]
pub(crate) struct PartFile {
    path: PathBuf,
    armed: bool,
}

impl PartFile {
    pub(crate) fn for_destination(destination: &Path) -> Self {
        let mut path = destination.as_os_str().to_owned();
        path.push(".part");
        Self {
            path: PathBuf::from(path),
            armed: true,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Renames the part file onto `destination`.
    pub(crate) async fn commit(mut self, destination: &Path) -> io::Result<()> {
        tokio::fs::rename(&self.path, destination).await?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
