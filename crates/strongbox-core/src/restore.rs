use crate::cancel::CancelToken;
use crate::catalog::models::{CatalogFileEntry, DbFolder};
use crate::catalog::reader::CatalogReader;
use crate::error::{Error, Result};
use crate::layout;
use crate::progress::RestoreReporter;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A folder of a published catalog, filled in on demand.
///
/// `id` is `None` for the synthetic node standing for the whole catalog;
/// its children are the catalog's root folders.
#[derive(Debug, Clone)]
pub struct BackupFolder {
    pub id: Option<i64>,
    pub name: String,
    folders: Option<Vec<BackupFolder>>,
    files: Option<Vec<CatalogFileEntry>>,
}

impl BackupFolder {
    pub fn catalog_root(reader: &CatalogReader) -> Self {
        Self {
            id: None,
            name: reader.name(),
            folders: None,
            files: None,
        }
    }

    pub fn from_row(folder: DbFolder) -> Self {
        Self {
            id: Some(folder.id),
            name: folder.name,
            folders: None,
            files: None,
        }
    }

    /// Loads a single folder by id, `None` if the catalog has no such folder.
    pub fn find(reader: &CatalogReader, id: i64) -> Result<Option<Self>> {
        Ok(reader.folder(id)?.map(Self::from_row))
    }

    pub fn is_loaded(&self) -> bool {
        self.folders.is_some() && self.files.is_some()
    }

    pub fn load_folders(&mut self, reader: &CatalogReader) -> Result<&[BackupFolder]> {
        if self.folders.is_none() {
            let rows = reader.folders(self.id)?;
            self.folders = Some(rows.into_iter().map(Self::from_row).collect());
        }
        Ok(self.folders.as_deref().unwrap_or_default())
    }

    pub fn load_files(&mut self, reader: &CatalogReader) -> Result<&[CatalogFileEntry]> {
        if self.files.is_none() {
            let files = match self.id {
                Some(id) => reader.files(id)?,
                None => Vec::new(),
            };
            self.files = Some(files);
        }
        Ok(self.files.as_deref().unwrap_or_default())
    }

    /// Child folders loaded so far.
    pub fn folders(&self) -> &[BackupFolder] {
        self.folders.as_deref().unwrap_or_default()
    }

    /// Files loaded so far.
    pub fn files(&self) -> &[CatalogFileEntry] {
        self.files.as_deref().unwrap_or_default()
    }

    /// Loads the whole subtree breadth-first and returns its file count.
    pub fn preload(&mut self, reader: &CatalogReader, cancel: &CancelToken) -> Result<usize> {
        let mut total = 0;
        let mut queue: VecDeque<&mut BackupFolder> = VecDeque::new();
        queue.push_back(self);
        while let Some(folder) = queue.pop_front() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            folder.load_folders(reader)?;
            total += folder.load_files(reader)?.len();
            if let Some(children) = folder.folders.as_mut() {
                queue.extend(children.iter_mut());
            }
        }
        Ok(total)
    }

    fn file_count(&self) -> usize {
        self.files().len() + self.folders().iter().map(|f| f.file_count()).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreError {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub total_files: usize,
    pub processed_files: usize,
    pub restored_files: usize,
    pub errors: Vec<RestoreError>,
    pub cancelled: bool,
    pub duration: Duration,
}

/// Rebuilds a catalog subtree on disk from the blob store.
pub struct RestoreTask<'a> {
    reader: &'a CatalogReader,
    blob_dir: PathBuf,
}

struct Progress<'r> {
    report: RestoreReport,
    reporter: &'r dyn RestoreReporter,
}

impl Progress<'_> {
    fn file_done(&mut self) {
        self.report.processed_files += 1;
        self.reporter
            .on_restore_progress(self.report.processed_files, self.report.total_files);
    }

    fn error(&mut self, path: PathBuf, message: String) {
        warn!("Restore of {} failed: {}", path.display(), message);
        let error = RestoreError { path, message };
        self.reporter.on_restore_error(&error);
        self.report.errors.push(error);
    }
}

impl<'a> RestoreTask<'a> {
    /// `destination` is the backup destination the catalog was published to.
    pub fn new(destination: &Path, reader: &'a CatalogReader) -> Self {
        Self {
            reader,
            blob_dir: layout::blob_dir(destination),
        }
    }

    /// Restores `folder` and everything below it into `target/<folder name>`.
    /// Existing files are overwritten.
    pub fn run(
        &self,
        folder: &mut BackupFolder,
        target: &Path,
        cancel: &CancelToken,
        reporter: &dyn RestoreReporter,
    ) -> Result<RestoreReport> {
        let started = Instant::now();
        let mut progress = Progress {
            report: RestoreReport::default(),
            reporter,
        };

        match folder.preload(self.reader, cancel) {
            Ok(total) => progress.report.total_files = total,
            Err(Error::Cancelled) => progress.report.cancelled = true,
            Err(e) => return Err(e),
        }

        if !progress.report.cancelled {
            reporter.on_restore_start(progress.report.total_files);
            let dir = target.join(&folder.name);
            if self.restore_folder(folder, &dir, cancel, &mut progress).is_err() {
                progress.report.cancelled = true;
            }
        }

        let mut report = progress.report;
        report.duration = started.elapsed();
        reporter.on_restore_complete(&report);
        info!(
            "Restored {}/{} files into {} ({} errors{})",
            report.restored_files,
            report.total_files,
            target.display(),
            report.errors.len(),
            if report.cancelled { ", cancelled" } else { "" }
        );
        Ok(report)
    }

    /// `Err(())` only on cancellation.
    fn restore_folder(
        &self,
        folder: &BackupFolder,
        dir: &Path,
        cancel: &CancelToken,
        progress: &mut Progress<'_>,
    ) -> std::result::Result<(), ()> {
        if cancel.is_cancelled() {
            return Err(());
        }
        if let Err(e) = fs::create_dir_all(dir) {
            progress.error(dir.to_path_buf(), e.to_string());
            for _ in 0..folder.file_count() {
                progress.file_done();
            }
            return Ok(());
        }

        for file in folder.files() {
            if cancel.is_cancelled() {
                return Err(());
            }
            let target = dir.join(&file.name);
            match fs::copy(self.blob_dir.join(&file.stored_name), &target) {
                Ok(_) => progress.report.restored_files += 1,
                Err(e) => progress.error(target, e.to_string()),
            }
            progress.file_done();
        }

        for child in folder.folders() {
            self.restore_folder(child, &dir.join(&child.name), cancel, progress)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::writer::CatalogWriter;
    use crate::progress::SilentReporter;
    use tempfile::tempdir;

    /// Catalog `root/{a.txt, sub/{b.txt, c.txt}}` where a and c share a blob.
    fn setup(dest: &Path) -> PathBuf {
        let blobs = layout::blob_dir(dest);
        fs::create_dir_all(&blobs).unwrap();
        fs::write(blobs.join("one.txt"), "one").unwrap();
        fs::write(blobs.join("two.txt"), "two").unwrap();

        let path = dest.join("2024-01-01_00-00-00.db");
        let writer = CatalogWriter::create(&path).unwrap();
        let root = writer.add_folder("root", None);
        let sub = writer.add_folder("sub", Some(root.id));
        writer.add_file("a.txt", "h1", "one.txt", root.id);
        writer.add_file("b.txt", "h2", "two.txt", sub.id);
        writer.add_file("c.txt", "h1", "one.txt", sub.id);
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_preload_counts_subtree() {
        let dest = tempdir().unwrap();
        let reader = CatalogReader::open(&setup(dest.path()));
        let mut whole = BackupFolder::catalog_root(&reader);

        let total = whole.preload(&reader, &CancelToken::new()).unwrap();
        assert_eq!(total, 3);
        assert_eq!(whole.name, "2024-01-01_00-00-00");
        assert_eq!(whole.folders()[0].folders()[0].files().len(), 2);
    }

    #[test]
    fn test_restore_whole_catalog() {
        let dest = tempdir().unwrap();
        let target = tempdir().unwrap();
        let reader = CatalogReader::open(&setup(dest.path()));
        let mut whole = BackupFolder::catalog_root(&reader);

        let report = RestoreTask::new(dest.path(), &reader)
            .run(&mut whole, target.path(), &CancelToken::new(), &SilentReporter)
            .unwrap();

        assert_eq!(report.restored_files, 3);
        assert!(report.errors.is_empty());
        let base = target.path().join("2024-01-01_00-00-00").join("root");
        assert_eq!(fs::read_to_string(base.join("a.txt")).unwrap(), "one");
        assert_eq!(fs::read_to_string(base.join("sub/b.txt")).unwrap(), "two");
        assert_eq!(fs::read_to_string(base.join("sub/c.txt")).unwrap(), "one");
    }

    #[test]
    fn test_missing_blob_is_reported_and_restore_continues() {
        let dest = tempdir().unwrap();
        let target = tempdir().unwrap();
        let reader = CatalogReader::open(&setup(dest.path()));
        fs::remove_file(layout::blob_dir(dest.path()).join("two.txt")).unwrap();
        let mut sub = BackupFolder::find(&reader, 2).unwrap().unwrap();

        let report = RestoreTask::new(dest.path(), &reader)
            .run(&mut sub, target.path(), &CancelToken::new(), &SilentReporter)
            .unwrap();

        assert_eq!(report.total_files, 2);
        assert_eq!(report.processed_files, 2);
        assert_eq!(report.restored_files, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].path.ends_with("sub/b.txt"));
    }

    #[test]
    fn test_cancelled_restore_writes_nothing() {
        let dest = tempdir().unwrap();
        let target = tempdir().unwrap();
        let reader = CatalogReader::open(&setup(dest.path()));
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut whole = BackupFolder::catalog_root(&reader);

        let report = RestoreTask::new(dest.path(), &reader)
            .run(&mut whole, target.path(), &cancel, &SilentReporter)
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
    }
}
