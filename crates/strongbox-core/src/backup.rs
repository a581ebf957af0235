use crate::cancel::CancelToken;
use crate::catalog::writer::{CatalogWriter, DEFAULT_FLUSH_INTERVAL};
use crate::config::{AppConfig, BackupItem};
use crate::error::{Error, Result};
use crate::layout;
use crate::progress::BackupReporter;
use crate::store::ContentStore;
use crate::validate;
use crate::walker::{BackupContext, FileError, ItemWalker, RunJournal};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    NotStarted,
    LoadingBackupedFiles,
    Walking,
    Flushing,
    Finishing,
    Successful,
    ValidationError,
    Canceled,
    Exception,
    DestinationFolderNotFound,
    NoItemsToBackup,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupResult {
    Successful,
    ValidationError,
    Canceled,
    Exception,
    DestinationFolderNotFound,
    NoItemsToBackup,
}

impl BackupResult {
    pub fn state(self) -> BackupState {
        match self {
            BackupResult::Successful => BackupState::Successful,
            BackupResult::ValidationError => BackupState::ValidationError,
            BackupResult::Canceled => BackupState::Canceled,
            BackupResult::Exception => BackupState::Exception,
            BackupResult::DestinationFolderNotFound => BackupState::DestinationFolderNotFound,
            BackupResult::NoItemsToBackup => BackupState::NoItemsToBackup,
        }
    }
}

#[derive(Debug)]
pub struct BackupOutcome {
    pub result: BackupResult,
    pub duration: Duration,
    /// Published catalog file name, only for a successful run.
    pub catalog_name: Option<String>,
    pub added_blobs: usize,
    pub processed_files: usize,
    pub file_errors: Vec<FileError>,
    pub validation_errors: Vec<String>,
    /// Set when `result` is `Exception`.
    pub error: Option<Error>,
}

impl BackupOutcome {
    fn empty(result: BackupResult, duration: Duration) -> Self {
        Self {
            result,
            duration,
            catalog_name: None,
            added_blobs: 0,
            processed_files: 0,
            file_errors: Vec::new(),
            validation_errors: Vec::new(),
            error: None,
        }
    }
}

/// Catalog files a run has created so far.
#[derive(Default)]
struct RunFiles {
    temp_catalog: Option<PathBuf>,
    published: Option<PathBuf>,
}

enum Published {
    Valid(String),
    Invalid(Vec<String>),
}

/// One backup run of a list of items into a destination.
pub struct BackupTask {
    destination: PathBuf,
    items: Vec<BackupItem>,
    temp_dir: PathBuf,
    cache_dir: PathBuf,
    flush_interval: Duration,
}

impl BackupTask {
    pub fn new(destination: &Path, items: Vec<BackupItem>) -> Self {
        let temp_dir = std::env::temp_dir().join("strongbox");
        Self {
            destination: destination.to_path_buf(),
            items,
            cache_dir: temp_dir.join("cache"),
            temp_dir,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(config.destination()?, config.items.clone())
            .with_temp_dir(&config.temp_dir)
            .with_cache_dir(&config.cache_dir)
            .with_flush_interval(config.flush_interval()))
    }

    pub fn with_temp_dir(mut self, dir: &Path) -> Self {
        self.temp_dir = dir.to_path_buf();
        self
    }

    pub fn with_cache_dir(mut self, dir: &Path) -> Self {
        self.cache_dir = dir.to_path_buf();
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn cache_path(&self) -> PathBuf {
        layout::cache_file_path(&self.cache_dir, &self.destination)
    }

    pub fn run(&self, cancel: &CancelToken, reporter: &dyn BackupReporter) -> BackupOutcome {
        let started = Instant::now();
        reporter.on_state_change(BackupState::NotStarted);

        let early = if !self.destination.is_dir() {
            Some(BackupResult::DestinationFolderNotFound)
        } else if self.items.is_empty() {
            Some(BackupResult::NoItemsToBackup)
        } else {
            None
        };
        if let Some(result) = early {
            warn!("Backup to {} not started: {:?}", self.destination.display(), result);
            let outcome = BackupOutcome::empty(result, started.elapsed());
            reporter.on_state_change(result.state());
            reporter.on_backup_complete(&outcome);
            return outcome;
        }

        info!(
            "Backup of {} items to {} started",
            self.items.len(),
            self.destination.display()
        );
        let journal = RunJournal::new();
        let mut files = RunFiles::default();
        let executed = self.execute(&journal, &mut files, cancel, reporter);

        let mut outcome = BackupOutcome::empty(BackupResult::Successful, Duration::ZERO);
        outcome.result = match executed {
            Ok(Published::Valid(name)) => {
                outcome.catalog_name = Some(name);
                BackupResult::Successful
            }
            Ok(Published::Invalid(mismatches)) => {
                error!("Published catalog failed validation: {:?}", mismatches);
                self.clean_up(&journal, &mut files);
                outcome.validation_errors = mismatches;
                BackupResult::ValidationError
            }
            Err(Error::Cancelled) => {
                info!("Backup cancelled, rolling back");
                self.clean_up(&journal, &mut files);
                BackupResult::Canceled
            }
            Err(e) => {
                error!("Backup failed: {}", e);
                cancel.cancel();
                self.clean_up(&journal, &mut files);
                outcome.error = Some(e);
                BackupResult::Exception
            }
        };
        outcome.added_blobs = match outcome.result {
            BackupResult::Successful => journal.added_blobs().len(),
            _ => 0,
        };
        outcome.processed_files = journal.processed();
        outcome.file_errors = journal.errors();
        outcome.duration = started.elapsed();

        reporter.on_state_change(outcome.result.state());
        reporter.on_backup_complete(&outcome);
        info!(
            "Backup {:?} in {:.2}s: {} files, {} new blobs, {} file errors",
            outcome.result,
            outcome.duration.as_secs_f64(),
            outcome.processed_files,
            outcome.added_blobs,
            outcome.file_errors.len()
        );
        outcome
    }

    fn execute(
        &self,
        journal: &RunJournal,
        files: &mut RunFiles,
        cancel: &CancelToken,
        reporter: &dyn BackupReporter,
    ) -> Result<Published> {
        let blob_dir = layout::blob_dir(&self.destination);
        fs::create_dir_all(&blob_dir)?;
        fs::create_dir_all(&self.temp_dir)?;

        let name = layout::free_catalog_name(&self.destination, Local::now().naive_local());
        let temp_catalog = self.temp_dir.join(&name);
        if temp_catalog.exists() {
            fs::remove_file(&temp_catalog)?;
        }
        let writer = CatalogWriter::create_with_interval(&temp_catalog, self.flush_interval)?;
        files.temp_catalog = Some(temp_catalog.clone());

        let mut walkers = self
            .items
            .iter()
            .cloned()
            .map(ItemWalker::new)
            .collect::<Result<Vec<_>>>()?;

        reporter.on_state_change(BackupState::LoadingBackupedFiles);
        let cache_path = self.cache_path();
        let store = thread::scope(|scope| -> Result<ContentStore> {
            let loader = thread::Builder::new()
                .name("content-index".to_string())
                .spawn_scoped(scope, || {
                    ContentStore::load(&self.destination, &cache_path, cancel)
                })?;

            reporter.on_state_change(BackupState::Walking);
            let walked = walkers
                .iter_mut()
                .try_for_each(|walker| walker.walk(&writer, journal, cancel));

            let loaded = loader
                .join()
                .map_err(|_| Error::Other("content index loader panicked".to_string()))?;
            walked?;
            loaded
        })?;

        let ctx = BackupContext {
            store: &store,
            writer: &writer,
            blob_dir: &blob_dir,
            journal,
            cancel,
            reporter,
        };
        for walker in walkers.iter_mut() {
            walker.backup(&ctx)?;
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        reporter.on_state_change(BackupState::Flushing);
        writer.finish()?;
        drop(writer);

        reporter.on_state_change(BackupState::Finishing);
        let published = self.destination.join(&name);
        files.published = Some(published.clone());
        fs::copy(&temp_catalog, &published)?;
        fs::remove_file(&temp_catalog)?;
        files.temp_catalog = None;
        reporter.on_catalog_published(&name, &published);

        let mismatches = validate::verify_catalog(&published, &journal.rows(), cancel)?;
        if !mismatches.is_empty() {
            return Ok(Published::Invalid(mismatches));
        }

        store.add_catalog_name(&name);
        if let Err(e) = store.save_cache(&cache_path) {
            warn!("Cannot save content cache {}: {}", cache_path.display(), e);
        }
        info!("Published catalog {}", name);
        Ok(Published::Valid(name))
    }

    /// Removes everything the run created: new blobs and both catalog copies.
    fn clean_up(&self, journal: &RunJournal, files: &mut RunFiles) {
        for blob in journal.added_blobs() {
            if let Err(e) = fs::remove_file(&blob.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot remove blob {}: {}", blob.path.display(), e);
                }
            }
        }
        for path in [files.temp_catalog.take(), files.published.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot remove catalog {}: {}", path.display(), e);
                }
            }
        }
    }
}
