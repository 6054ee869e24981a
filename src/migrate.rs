// Migration loop: find candidate files, then for each one download it,
// delete the remote original, compress it locally and upload the archive
// as its replacement. Candidates are handled one at a time in size order.

use crate::api::{ApiError, NewFile, RemoteFile, Storage};
use crate::archive::compress_file_as;
use crate::filter::NameFilter;
use crate::ui::{format_ratio, format_size, spinner};
use crate::workspace::{ensure_workspace, remove_if_exists, ArtifactNames};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const GZIP_MIME_TYPE: &str = "application/gzip";

/// Settings for one run of the loop.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Scratch directory for raw downloads and archives.
    pub workdir: PathBuf,
    pub filter: NameFilter,
    /// Upper bound on records fetched per list request.
    pub page_size: u32,
    /// Log storage errors on a candidate and move on instead of ending the
    /// run. Local filesystem errors always end the run.
    pub continue_on_error: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            workdir: PathBuf::from("tmp"),
            filter: NameFilter::default(),
            page_size: 1000,
            continue_on_error: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Storage(#[from] ApiError),

    #[error("failed to {action} {}: {source}", .path.display())]
    Local {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MigrationError {
    fn local(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| MigrationError::Local {
            action,
            path,
            source,
        }
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, MigrationError::Storage(_))
    }
}

/// Outcome of one migrated file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migrated {
    pub original: RemoteFile,
    pub replacement_id: String,
    pub replacement_name: String,
    pub compressed_size: u64,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub migrated: Vec<Migrated>,
    /// Candidates abandoned after a storage error (continue-on-error only).
    pub failed: Vec<RemoteFile>,
}

/// List files matching `filter`, smallest first. Equal sizes keep their
/// listing order.
pub fn discover_candidates<S: Storage>(
    storage: &S,
    filter: &NameFilter,
    page_size: u32,
) -> Result<Vec<RemoteFile>, ApiError> {
    let mut files = storage.list(&filter.to_query(), page_size)?;
    files.retain(|f| {
        let keep = filter.matches(&f.name);
        if !keep {
            log::debug!("Ignoring {} returned by the listing", f.name);
        }
        keep
    });
    files.sort_by_key(|f| f.size_in_use);
    Ok(files)
}

/// Replace one remote file with a compressed copy of itself.
///
/// The remote original is deleted before the archive is uploaded, so a
/// failure between those two steps leaves no remote copy at all.
pub fn migrate_one<S: Storage>(
    storage: &S,
    workdir: &Path,
    file: &RemoteFile,
) -> Result<Migrated, MigrationError> {
    let names = ArtifactNames::for_remote(&file.name);
    let raw_path = names.raw_path(workdir);
    let compressed_path = names.compressed_path(workdir);
    let size_friendly = format_size(file.size_in_use);

    log::info!("Downloading {} ({})...", file.name, size_friendly);
    let progress = spinner(&format!("Downloading {}", file.name));
    let content = storage.get_content(&file.id);
    progress.finish_and_clear();
    fs::write(&raw_path, content?).map_err(MigrationError::local("write", &raw_path))?;
    log::info!("Saved (local) {}", file.name);

    log::info!("Deleting (remote) {}", file.name);
    storage.delete(&file.id)?;

    log::info!("Compressing into {}", names.compressed);
    let entry = names.entry_path(workdir);
    let compressed_size = compress_file_as(&raw_path, &entry, &compressed_path)
        .map_err(MigrationError::local("compress", &raw_path))?;
    let compressed_friendly = format_size(compressed_size);
    log::info!(
        "Compressed {} => {} ({})",
        size_friendly,
        compressed_friendly,
        format_ratio(compressed_size, file.size_in_use)
    );

    log::info!("Deleting local {}", file.name);
    remove_if_exists(&raw_path).map_err(MigrationError::local("remove", &raw_path))?;

    let metadata = NewFile {
        name: names.compressed.clone(),
        mime_type: GZIP_MIME_TYPE.to_string(),
        parents: file.parents.clone(),
    };
    let archive =
        File::open(&compressed_path).map_err(MigrationError::local("open", &compressed_path))?;
    log::info!("Uploading {} ({})...", names.compressed, compressed_friendly);
    let progress = spinner(&format!("Uploading {}", names.compressed));
    let created = storage.create(&metadata, archive, compressed_size);
    progress.finish_and_clear();
    let replacement_id = created?;

    log::info!("Deleting (local) {}", names.compressed);
    remove_if_exists(&compressed_path)
        .map_err(MigrationError::local("remove", &compressed_path))?;

    Ok(Migrated {
        original: file.clone(),
        replacement_id,
        replacement_name: names.compressed,
        compressed_size,
    })
}

/// Run the whole batch: prepare the workspace, discover candidates and
/// migrate them in order. The first error ends the run unless
/// `continue_on_error` is set and the error came from the storage service.
pub fn run<S: Storage>(storage: &S, config: &MigrationConfig) -> Result<RunReport, MigrationError> {
    ensure_workspace(&config.workdir).map_err(MigrationError::local("create", &config.workdir))?;

    let candidates = discover_candidates(storage, &config.filter, config.page_size)?;
    let mut report = RunReport::default();
    if candidates.is_empty() {
        log::info!("No files found.");
        return Ok(report);
    }
    log::info!("Found {} file(s) to compress", candidates.len());

    for file in candidates {
        match migrate_one(storage, &config.workdir, &file) {
            Ok(done) => report.migrated.push(done),
            Err(MigrationError::Storage(e)) if config.continue_on_error => {
                log::error!("Skipping {}: {}", file.name, e);
                report.failed.push(file);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct ListOnly {
        files: Vec<RemoteFile>,
        queries: RefCell<Vec<(String, u32)>>,
    }

    impl Storage for ListOnly {
        fn list(&self, query: &str, page_size: u32) -> Result<Vec<RemoteFile>, ApiError> {
            self.queries.borrow_mut().push((query.to_string(), page_size));
            Ok(self.files.clone())
        }
        fn get_content(&self, _id: &str) -> Result<Vec<u8>, ApiError> {
            unreachable!("listing only")
        }
        fn delete(&self, _id: &str) -> Result<(), ApiError> {
            unreachable!("listing only")
        }
        fn create(&self, _m: &NewFile, _c: File, _l: u64) -> Result<String, ApiError> {
            unreachable!("listing only")
        }
    }

    fn file(id: &str, name: &str, size: u64) -> RemoteFile {
        RemoteFile {
            id: id.into(),
            name: name.into(),
            size_in_use: size,
            parents: vec!["root".into()],
        }
    }

    #[test]
    fn test_discover_sorts_by_size_and_keeps_ties_in_order() {
        let storage = ListOnly {
            files: vec![
                file("a", "sms-a.xml", 300),
                file("b", "calls-b.xml", 100),
                file("c", "sms-c.xml", 300),
                file("d", "calls-d.xml", 100),
            ],
            queries: RefCell::new(Vec::new()),
        };
        let found = discover_candidates(&storage, &NameFilter::default(), 1000).unwrap();
        let ids: Vec<_> = found.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, ["b", "d", "a", "c"]);
    }

    #[test]
    fn test_discover_sends_query_and_page_size() {
        let storage = ListOnly {
            files: vec![],
            queries: RefCell::new(Vec::new()),
        };
        discover_candidates(&storage, &NameFilter::default(), 25).unwrap();
        let queries = storage.queries.borrow();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].0, NameFilter::default().to_query());
        assert_eq!(queries[0].1, 25);
    }

    #[test]
    fn test_discover_drops_names_the_service_should_not_return() {
        let storage = ListOnly {
            files: vec![
                file("a", "sms-a.xml", 1),
                file("b", "sms-a.tar.gz", 2),
                file("c", "notes.xml", 3),
            ],
            queries: RefCell::new(Vec::new()),
        };
        let found = discover_candidates(&storage, &NameFilter::default(), 1000).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[test]
    fn test_local_error_message_names_path() {
        let err = MigrationError::local("write", Path::new("tmp/sms.xml"))(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(!err.is_storage());
        assert_eq!(err.to_string(), "failed to write tmp/sms.xml: denied");
    }
}
