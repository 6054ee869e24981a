// Local scratch space: the temporary directory and the per-candidate file
// names derived from a remote name.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Create the scratch directory if it is missing.
pub fn ensure_workspace(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        log::debug!("Creating workspace {}", dir.display());
    }
    fs::create_dir_all(dir)
}

/// Delete a local file. A file that is already gone counts as deleted.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Names used for one candidate's local artifacts and its replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    /// Local name of the downloaded content, as it appears in the archive.
    pub raw: String,
    /// Remote name of the compressed replacement.
    pub compressed: String,
    /// Scratch file holding the download. Differs from `raw` only when
    /// `raw` would be the archive's own local path (e.g. `calls.tar.gz`).
    scratch: String,
}

impl ArtifactNames {
    pub fn for_remote(name: &str) -> Self {
        let friendly = name.split('.').next().unwrap_or_default();
        let raw = local_name(name);
        let compressed = format!("{}.tar.gz", friendly);
        let scratch = if raw == local_name(&compressed) {
            format!("{}.raw", raw)
        } else {
            raw.clone()
        };
        ArtifactNames {
            raw,
            compressed,
            scratch,
        }
    }

    /// Where the download is written.
    pub fn raw_path(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.scratch)
    }

    /// Archive member name for the download.
    pub fn entry_path(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.raw)
    }

    pub fn compressed_path(&self, workdir: &Path) -> PathBuf {
        workdir.join(local_name(&self.compressed))
    }
}

// Remote names may contain separators; keep local files inside the workdir.
fn local_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}
