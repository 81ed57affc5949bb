use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

/// Exclusive lock on a log directory, held for as long as the log is open.
#[derive(Debug)]
pub(crate) struct DirLock {
    path: PathBuf,
    f: File,
}

impl DirLock {
    pub(crate) const FILE_NAME: &'static str = "LOCK";

    pub(crate) fn acquire(dir: &Path) -> Result<Self, io::Error> {
        let path = dir.join(Self::FILE_NAME);

        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        f.try_lock_exclusive().map_err(|e| {
            io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "log directory '{}' is locked by another writer: {e}",
                    dir.display()
                ),
            )
        })?;

        debug!(path = %path.display(), "log directory lock acquired");
        Ok(Self { path, f })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.f.unlock();
        debug!(path = %self.path.display(), "log directory lock released");
    }
}
