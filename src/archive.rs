// Single-file gzip tar archives.

use crate::workspace::remove_if_exists;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

/// Pack `src` into a gzip-compressed tar at `dest` and return the archive
/// size in bytes. The entry is named after `src` as given.
pub fn compress_file(src: &Path, dest: &Path) -> io::Result<u64> {
    compress_file_as(src, src, dest)
}

/// Like `compress_file`, but the entry is named after `entry` instead of
/// the file it is read from. A partial `dest` is removed on failure.
pub fn compress_file_as(src: &Path, entry: &Path, dest: &Path) -> io::Result<u64> {
    match write_archive(src, entry, dest) {
        Ok(()) => Ok(fs::metadata(dest)?.len()),
        Err(e) => {
            if let Err(cleanup) = remove_if_exists(dest) {
                log::warn!("Could not remove partial {}: {}", dest.display(), cleanup);
            }
            Err(e)
        }
    }
}

fn write_archive(src: &Path, entry: &Path, dest: &Path) -> io::Result<()> {
    let out = File::create(dest)?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_path_with_name(src, entry_name(entry))?;
    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()
}

/// Archive member name for a path: tar entries must be relative, so root
/// and prefix components are dropped.
pub fn entry_name(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}
