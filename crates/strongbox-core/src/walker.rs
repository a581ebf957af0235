use crate::cancel::CancelToken;
use crate::catalog::models::{DbFile, DbFolder, DbFolderFile};
use crate::catalog::writer::CatalogWriter;
use crate::config::{BackupItem, SubfolderMode};
use crate::error::{Error, Result};
use crate::hasher;
use crate::layout;
use crate::pattern::PathPattern;
use crate::platform;
use crate::progress::BackupReporter;
use crate::store::ContentStore;
use rayon::prelude::*;
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

const COPY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkState {
    Idle,
    Walking,
    Hashing,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileErrorKind {
    /// The source could not be read for hashing.
    Hash,
    /// Writing the blob failed.
    Copy,
    /// The source kept changing while it was copied.
    Changed,
}

/// A source file left out of the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileError {
    pub path: PathBuf,
    pub kind: FileErrorKind,
    pub message: String,
}

impl FileError {
    fn new(path: &Path, kind: FileErrorKind, message: impl fmt::Display) -> Self {
        Self {
            path: path.to_path_buf(),
            kind,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}: {}", self.kind, self.path.display(), self.message)
    }
}

/// Rows handed to the writer during a run, compared against the published
/// catalog afterwards.
#[derive(Debug, Default, Clone)]
pub struct WrittenRows {
    pub folders: Vec<DbFolder>,
    pub files: Vec<DbFile>,
    pub folder_files: Vec<DbFolderFile>,
}

/// A blob written by this run.
#[derive(Debug, Clone)]
pub struct AddedBlob {
    pub hash: String,
    pub path: PathBuf,
}

/// Everything a run has done so far, shared by all walkers.
///
/// Survives a failed or cancelled run so its side effects can be undone.
#[derive(Default)]
pub struct RunJournal {
    added: Mutex<Vec<AddedBlob>>,
    rows: Mutex<WrittenRows>,
    errors: Mutex<Vec<FileError>>,
    processed: AtomicUsize,
}

impl RunJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added_blobs(&self) -> Vec<AddedBlob> {
        lock(&self.added).clone()
    }

    pub fn rows(&self) -> WrittenRows {
        lock(&self.rows).clone()
    }

    pub fn errors(&self) -> Vec<FileError> {
        lock(&self.errors).clone()
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    fn record_folder(&self, folder: &DbFolder) {
        lock(&self.rows).folders.push(folder.clone());
    }

    fn record_file(&self, file: Option<DbFile>, folder_file: DbFolderFile) {
        let mut rows = lock(&self.rows);
        if let Some(file) = file {
            rows.files.push(file);
        }
        rows.folder_files.push(folder_file);
    }

    fn record_blob(&self, hash: &str, path: &Path) {
        lock(&self.added).push(AddedBlob {
            hash: hash.to_string(),
            path: path.to_path_buf(),
        });
    }

    fn record_error(&self, error: FileError) {
        lock(&self.errors).push(error);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct PendingFile {
    path: PathBuf,
    folder_id: i64,
    name: String,
}

/// Shared collaborators for the per-file phase.
pub struct BackupContext<'a> {
    pub store: &'a ContentStore,
    pub writer: &'a CatalogWriter,
    pub blob_dir: &'a Path,
    pub journal: &'a RunJournal,
    pub cancel: &'a CancelToken,
    pub reporter: &'a dyn BackupReporter,
}

/// Walks one backup item: registers its folders, then hashes and stores
/// its files.
pub struct ItemWalker {
    item: BackupItem,
    patterns: Vec<PathPattern>,
    state: WalkState,
    pending: Vec<PendingFile>,
}

impl ItemWalker {
    pub fn new(item: BackupItem) -> Result<Self> {
        let patterns = item.compile_patterns()?;
        Ok(Self {
            item,
            patterns,
            state: WalkState::Idle,
            pending: Vec::new(),
        })
    }

    pub fn item(&self) -> &BackupItem {
        &self.item
    }

    pub fn state(&self) -> WalkState {
        self.state
    }

    pub fn file_count(&self) -> usize {
        self.pending.len()
    }

    fn is_excluded(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(text))
    }

    /// Breadth-first walk registering every kept folder with `writer`.
    ///
    /// A folder gets its id before any of its children are looked at.
    pub fn walk(
        &mut self,
        writer: &CatalogWriter,
        journal: &RunJournal,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.state = WalkState::Walking;
        self.pending.clear();

        let root = writer.add_folder(&self.item.name, None);
        journal.record_folder(&root);
        if self.item.subfolders == SubfolderMode::None {
            return Ok(());
        }

        let mut queue = VecDeque::new();
        queue.push_back((self.item.folder.clone(), root.id));

        while let Some((dir, folder_id)) = queue.pop_front() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut entries: Vec<_> = match fs::read_dir(&dir) {
                Ok(entries) => entries.filter_map(|e| e.ok()).collect(),
                Err(e) => {
                    warn!("Cannot list {}: {}", dir.display(), e);
                    continue;
                }
            };
            entries.sort_by_key(|e| e.file_name());

            for entry in entries {
                let path = entry.path();
                let metadata = match entry.metadata() {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Cannot stat {}: {}", path.display(), e);
                        continue;
                    }
                };
                if platform::is_hidden(&path, &metadata) {
                    trace!("Skipping hidden {}", path.display());
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();

                if metadata.is_dir() {
                    if self.item.subfolders != SubfolderMode::All
                        || self.is_excluded(&platform::directory_match_path(&path))
                    {
                        continue;
                    }
                    let folder = writer.add_folder(&name, Some(folder_id));
                    journal.record_folder(&folder);
                    queue.push_back((path, folder.id));
                } else if metadata.is_file() {
                    if self.is_excluded(&path.to_string_lossy()) {
                        continue;
                    }
                    self.pending.push(PendingFile {
                        path,
                        folder_id,
                        name,
                    });
                }
            }
        }

        debug!(
            "Walked item '{}': {} files queued",
            self.item.name,
            self.pending.len()
        );
        Ok(())
    }

    /// Hashes, stores and catalogs every walked file in parallel.
    ///
    /// Per-file failures land in the journal; only cancellation or a failed
    /// writer stop the item.
    pub fn backup(&mut self, ctx: &BackupContext<'_>) -> Result<()> {
        self.state = WalkState::Hashing;
        let total = self.pending.len();
        let processed = Mutex::new(0usize);
        let name = self.item.name.as_str();
        ctx.reporter.on_item_start(name, total);

        self.pending.par_iter().try_for_each(|file| {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if ctx.writer.is_disposed() {
                return Err(Error::CatalogWrite(
                    ctx.writer
                        .failure()
                        .unwrap_or_else(|| "writer disposed".to_string()),
                ));
            }

            if let Err(error) = store_file(file, ctx) {
                warn!("{}", error);
                ctx.reporter.on_file_error(&error);
                ctx.journal.record_error(error);
            }
            ctx.journal.processed.fetch_add(1, Ordering::Relaxed);

            let mut done = lock(&processed);
            *done += 1;
            ctx.reporter.on_item_progress(name, *done, total);
            Ok(())
        })?;

        self.state = WalkState::Finished;
        info!("Item '{}' done: {} files", name, total);
        Ok(())
    }
}

fn store_file(file: &PendingFile, ctx: &BackupContext<'_>) -> std::result::Result<(), FileError> {
    let hash = hasher::hash_file(&file.path)
        .map_err(|e| FileError::new(&file.path, FileErrorKind::Hash, e))?;
    let extension = layout::extension_with_dot(&file.path);
    let (is_new, stored_name) = ctx.store.add(&hash, &extension);

    if is_new {
        let target = ctx.blob_dir.join(&stored_name);
        ctx.journal.record_blob(&hash, &target);
        if let Err(error) = copy_verified(&file.path, &target, &hash) {
            let _ = fs::remove_file(&target);
            ctx.store.remove(&hash);
            return Err(error);
        }
        ctx.store.confirm(&hash);
        trace!("Stored {} as {}", file.path.display(), stored_name);
    }

    let (new_file, folder_file) = ctx
        .writer
        .add_file(&file.name, &hash, &stored_name, file.folder_id);
    ctx.journal.record_file(new_file, folder_file);
    Ok(())
}

/// Copies `source` to `target` until the copy hashes to `hash`.
fn copy_verified(source: &Path, target: &Path, hash: &str) -> std::result::Result<(), FileError> {
    for attempt in 1..=COPY_ATTEMPTS {
        fs::copy(source, target).map_err(|e| FileError::new(source, FileErrorKind::Copy, e))?;
        let copied = hasher::hash_file(target)
            .map_err(|e| FileError::new(source, FileErrorKind::Copy, e))?;
        if copied == hash {
            return Ok(());
        }
        debug!(
            "Copy of {} does not match its hash (attempt {})",
            source.display(),
            attempt
        );
    }
    Err(FileError::new(
        source,
        FileErrorKind::Changed,
        format!("content changed during copy ({} attempts)", COPY_ATTEMPTS),
    ))
}
