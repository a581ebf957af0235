use crate::cancel::CancelToken;
use crate::catalog::models::DbFolderFile;
use crate::catalog::reader::CatalogReader;
use crate::error::{Error, Result};
use crate::hasher;
use crate::layout;
use crate::progress::ValidationReporter;
use crate::walker::WrittenRows;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Compares a freshly published catalog against the rows the run handed to
/// its writer. Returns one message per mismatch; empty means identical.
pub fn verify_catalog(
    catalog: &Path,
    expected: &WrittenRows,
    cancel: &CancelToken,
) -> Result<Vec<String>> {
    let reader = CatalogReader::open(catalog);
    let mut mismatches = Vec::new();

    let mut folders = expected.folders.clone();
    folders.sort_by_key(|f| f.id);
    let stored = reader.all_folders(cancel)?;
    if stored.len() != folders.len() {
        mismatches.push(format!(
            "folders: {} in catalog, {} written",
            stored.len(),
            folders.len()
        ));
    } else if let Some((s, e)) = stored.iter().zip(&folders).find(|(s, e)| s != e) {
        mismatches.push(format!("folder {} differs: {:?} != {:?}", e.id, s, e));
    }

    let mut files = expected.files.clone();
    files.sort_by_key(|f| f.id);
    let stored = reader.all_files(cancel)?;
    if stored.len() != files.len() {
        mismatches.push(format!(
            "files: {} in catalog, {} written",
            stored.len(),
            files.len()
        ));
    } else if let Some((s, e)) = stored.iter().zip(&files).find(|(s, e)| s != e) {
        mismatches.push(format!("file {} differs: {:?} != {:?}", e.id, s, e));
    }

    let stored = group_by_folder(reader.all_folder_files(cancel)?);
    let written = group_by_folder(expected.folder_files.clone());
    if stored.len() != written.len() {
        mismatches.push(format!(
            "folders with files: {} in catalog, {} written",
            stored.len(),
            written.len()
        ));
    }
    for (folder_id, rows) in &written {
        if stored.get(folder_id) != Some(rows) {
            mismatches.push(format!("files of folder {} differ", folder_id));
        }
    }

    reader.close();
    Ok(mismatches)
}

fn group_by_folder(rows: Vec<DbFolderFile>) -> BTreeMap<i64, Vec<(i64, String)>> {
    let mut grouped: BTreeMap<i64, Vec<(i64, String)>> = BTreeMap::new();
    for row in rows {
        grouped
            .entry(row.folder_id)
            .or_default()
            .push((row.file_id, row.file_name));
    }
    for group in grouped.values_mut() {
        group.sort();
    }
    grouped
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    WaitForStart,
    Starting,
    ReadingCatalogs,
    LoadingHashes,
    SearchingErrorFiles,
    DeletingUnusedFiles,
    Finished,
    Failed,
    Canceled,
}

/// One hash a blob is recorded under, and the catalogs recording it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashClaim {
    pub hash: String,
    pub catalogs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobProblem {
    Missing,
    /// The blob exists but could not be hashed.
    Unreadable(String),
    /// Catalogs record the blob under more than one hash.
    Ambiguous,
    HashMismatch,
}

impl fmt::Display for BlobProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobProblem::Missing => write!(f, "missing"),
            BlobProblem::Unreadable(reason) => write!(f, "unreadable: {}", reason),
            BlobProblem::Ambiguous => write!(f, "recorded under several hashes"),
            BlobProblem::HashMismatch => write!(f, "hash mismatch"),
        }
    }
}

/// A referenced blob that is missing, unreadable, ambiguous or corrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFile {
    pub stored_name: String,
    pub problem: BlobProblem,
    /// `None` when the blob could not be hashed.
    pub live_hash: Option<String>,
    pub claims: Vec<HashClaim>,
}

impl ErrorFile {
    pub fn is_missing(&self) -> bool {
        self.problem == BlobProblem::Missing
    }
}

#[derive(Debug)]
pub struct ValidationReport {
    pub state: ValidationState,
    pub catalogs: usize,
    pub checked_files: usize,
    pub error_files: Vec<ErrorFile>,
    pub unused_files: usize,
    pub deleted_files: usize,
    pub duration: Duration,
    pub error: Option<Error>,
}

impl ValidationReport {
    fn new() -> Self {
        Self {
            state: ValidationState::WaitForStart,
            catalogs: 0,
            checked_files: 0,
            error_files: Vec::new(),
            unused_files: 0,
            deleted_files: 0,
            duration: Duration::ZERO,
            error: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.state == ValidationState::Finished && self.error_files.is_empty()
    }
}

/// Full integrity check of a destination: every blob any catalog references
/// is re-hashed, then blobs no catalog references are removed.
pub struct ValidationTask {
    destination: PathBuf,
    delete_unused: bool,
}

/// stored name → hash → catalogs
type Claims = BTreeMap<String, BTreeMap<String, Vec<String>>>;

impl ValidationTask {
    pub fn new(destination: &Path) -> Self {
        Self {
            destination: destination.to_path_buf(),
            delete_unused: true,
        }
    }

    /// Report unused blobs without deleting them.
    pub fn keep_unused(mut self) -> Self {
        self.delete_unused = false;
        self
    }

    pub fn run(&self, cancel: &CancelToken, reporter: &dyn ValidationReporter) -> ValidationReport {
        let started = Instant::now();
        let mut report = ValidationReport::new();
        let state = self.execute(&mut report, cancel, reporter);

        report.state = match state {
            Ok(()) => ValidationState::Finished,
            Err(Error::Cancelled) => ValidationState::Canceled,
            Err(e) => {
                error!("Validation of {} failed: {}", self.destination.display(), e);
                report.error = Some(e);
                ValidationState::Failed
            }
        };
        report.duration = started.elapsed();
        reporter.on_state_change(report.state);
        reporter.on_validation_complete(&report);
        info!(
            "Validation {:?}: {} checked, {} errors, {} unused, {} deleted",
            report.state,
            report.checked_files,
            report.error_files.len(),
            report.unused_files,
            report.deleted_files
        );
        report
    }

    fn execute(
        &self,
        report: &mut ValidationReport,
        cancel: &CancelToken,
        reporter: &dyn ValidationReporter,
    ) -> Result<()> {
        reporter.on_state_change(ValidationState::Starting);
        if !self.destination.is_dir() {
            return Err(Error::Other(format!(
                "destination {} not found",
                self.destination.display()
            )));
        }
        let blob_dir = layout::blob_dir(&self.destination);

        reporter.on_state_change(ValidationState::ReadingCatalogs);
        let claims = self.read_claims(report, cancel)?;

        reporter.on_state_change(ValidationState::LoadingHashes);
        let on_disk = list_blobs(&blob_dir)?;
        let live = live_hashes(&blob_dir, &claims, &on_disk, cancel, reporter)?;
        report.checked_files = claims.len();

        reporter.on_state_change(ValidationState::SearchingErrorFiles);
        for (stored_name, hashes) in &claims {
            let (problem, live_hash) = match live.get(stored_name) {
                None => (BlobProblem::Missing, None),
                Some(Err(reason)) => (BlobProblem::Unreadable(reason.clone()), None),
                Some(Ok(hash)) if hashes.len() > 1 => (BlobProblem::Ambiguous, Some(hash.clone())),
                Some(Ok(hash)) if !hashes.contains_key(hash) => {
                    (BlobProblem::HashMismatch, Some(hash.clone()))
                }
                Some(Ok(_)) => continue,
            };
            let file = ErrorFile {
                stored_name: stored_name.clone(),
                problem,
                live_hash,
                claims: hashes
                    .iter()
                    .map(|(hash, catalogs)| HashClaim {
                        hash: hash.clone(),
                        catalogs: catalogs.clone(),
                    })
                    .collect(),
            };
            warn!("Blob {} failed validation: {}", file.stored_name, file.problem);
            reporter.on_error_file(&file);
            report.error_files.push(file);
        }

        reporter.on_state_change(ValidationState::DeletingUnusedFiles);
        for name in on_disk.iter().filter(|name| !claims.contains_key(*name)) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            report.unused_files += 1;
            if !self.delete_unused {
                continue;
            }
            match fs::remove_file(blob_dir.join(name)) {
                Ok(()) => report.deleted_files += 1,
                Err(e) => warn!("Cannot delete unused blob {}: {}", name, e),
            }
        }
        Ok(())
    }

    fn read_claims(&self, report: &mut ValidationReport, cancel: &CancelToken) -> Result<Claims> {
        let mut claims = Claims::new();
        for catalog in layout::list_catalogs(&self.destination)? {
            let reader = CatalogReader::open(&catalog.path);
            let mut pairs = HashMap::new();
            reader.export_hashes(&mut pairs, cancel)?;
            reader.close();
            for (hash, stored_name) in pairs {
                claims
                    .entry(stored_name)
                    .or_default()
                    .entry(hash)
                    .or_default()
                    .push(catalog.name.clone());
            }
            report.catalogs += 1;
        }
        Ok(claims)
    }
}

/// Every non-directory entry of the blob folder, links included.
fn list_blobs(blob_dir: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    if !blob_dir.is_dir() {
        return Ok(names);
    }
    for entry in fs::read_dir(blob_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// Hashes every referenced blob that exists, in parallel.
///
/// A blob that cannot be read maps to its error message; only cancellation
/// stops the pass.
fn live_hashes(
    blob_dir: &Path,
    claims: &Claims,
    on_disk: &BTreeSet<String>,
    cancel: &CancelToken,
    reporter: &dyn ValidationReporter,
) -> Result<HashMap<String, std::result::Result<String, String>>> {
    let present: Vec<&String> = claims.keys().filter(|n| on_disk.contains(*n)).collect();
    let total = present.len();
    let hashed = AtomicUsize::new(0);

    present
        .par_iter()
        .map(|name| {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let hash = hasher::hash_file(&blob_dir.join(name.as_str())).map_err(|e| {
                warn!("Cannot hash blob {}: {}", name, e);
                e.to_string()
            });
            let done = hashed.fetch_add(1, Ordering::Relaxed) + 1;
            reporter.on_hash_progress(done, total);
            Ok(((*name).clone(), hash))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::{DbFile, DbFolder};
    use crate::catalog::writer::CatalogWriter;
    use crate::progress::SilentReporter;
    use tempfile::tempdir;

    fn write_catalog(path: &Path) -> WrittenRows {
        let writer = CatalogWriter::create(path).unwrap();
        let mut rows = WrittenRows::default();
        let root = writer.add_folder("root", None);
        rows.folders.push(root.clone());
        for (name, hash) in [("a", "h1"), ("b", "h2"), ("c", "h1")] {
            let (file, link) = writer.add_file(name, hash, &format!("{}.blob", hash), root.id);
            rows.files.extend(file);
            rows.folder_files.push(link);
        }
        writer.finish().unwrap();
        rows
    }

    #[test]
    fn test_verify_catalog_matches_written_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.db");
        let rows = write_catalog(&path);
        let mismatches = verify_catalog(&path, &rows, &CancelToken::new()).unwrap();
        assert!(mismatches.is_empty(), "unexpected mismatches: {:?}", mismatches);
    }

    #[test]
    fn test_verify_catalog_reports_differences() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.db");
        let mut rows = write_catalog(&path);
        rows.folders.push(DbFolder {
            id: 99,
            parent_id: None,
            name: "ghost".to_string(),
        });
        rows.files[0] = DbFile {
            id: rows.files[0].id,
            hash: "other".to_string(),
            file_name: "h1.blob".to_string(),
        };

        let mismatches = verify_catalog(&path, &rows, &CancelToken::new()).unwrap();
        assert_eq!(mismatches.len(), 2, "{:?}", mismatches);
    }

    #[test]
    fn test_missing_destination_fails() {
        let dir = tempdir().unwrap();
        let report = ValidationTask::new(&dir.path().join("absent"))
            .run(&CancelToken::new(), &SilentReporter);
        assert_eq!(report.state, ValidationState::Failed);
        assert!(report.error.is_some());
    }
}
