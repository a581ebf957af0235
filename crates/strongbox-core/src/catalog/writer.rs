use super::models::{DbFile, DbFolder, DbFolderFile};
use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rusqlite::types::Value;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
struct BatchLimits {
    /// Always flush once a batch reaches this many rows.
    max_rows: usize,
    /// Flush at this many rows when the queue is momentarily empty.
    idle_rows: usize,
}

const FOLDER_LIMITS: BatchLimits = BatchLimits {
    max_rows: 1000,
    idle_rows: 500,
};
const FILE_LIMITS: BatchLimits = FOLDER_LIMITS;
const FOLDER_FILE_LIMITS: BatchLimits = BatchLimits {
    max_rows: 2000,
    idle_rows: 1000,
};

/// Row types the writer knows how to batch into a multi-row `INSERT`.
trait CatalogRow: Send + 'static {
    const INSERT: &'static str;
    const LABEL: &'static str;

    fn values(&self) -> [Value; 3];
}

impl CatalogRow for DbFolder {
    const INSERT: &'static str = "INSERT INTO folders (id, name, parent_id) VALUES ";
    const LABEL: &'static str = "folders";

    fn values(&self) -> [Value; 3] {
        [
            Value::Integer(self.id),
            Value::Text(self.name.clone()),
            self.parent_id.map(Value::Integer).unwrap_or(Value::Null),
        ]
    }
}

impl CatalogRow for DbFile {
    const INSERT: &'static str = "INSERT INTO files (id, hash, file_name) VALUES ";
    const LABEL: &'static str = "files";

    fn values(&self) -> [Value; 3] {
        [
            Value::Integer(self.id),
            Value::Text(self.hash.clone()),
            Value::Text(self.file_name.clone()),
        ]
    }
}

impl CatalogRow for DbFolderFile {
    const INSERT: &'static str = "INSERT INTO folders_files (file_name, folder_id, file_id) VALUES ";
    const LABEL: &'static str = "folders_files";

    fn values(&self) -> [Value; 3] {
        [
            Value::Text(self.file_name.clone()),
            Value::Integer(self.folder_id),
            Value::Integer(self.file_id),
        ]
    }
}

/// Highest id flushed so far for one table. Rows of a table are enqueued in
/// id order, so every id at or below the mark is on disk.
#[derive(Default)]
struct Watermark {
    state: Mutex<(i64, bool)>,
    cond: Condvar,
}

impl Watermark {
    fn lock(&self) -> MutexGuard<'_, (i64, bool)> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn advance(&self, id: i64) {
        let mut state = self.lock();
        if id > state.0 {
            state.0 = id;
        }
        self.cond.notify_all();
    }

    fn end(&self) {
        self.lock().1 = true;
        self.cond.notify_all();
    }

    /// Blocks until `id` is flushed. Returns false if the table ended first.
    fn wait_for(&self, id: i64) -> bool {
        let mut state = self.lock();
        while state.0 < id && !state.1 {
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.0 >= id
    }
}

struct Queue<T> {
    sender: RwLock<Option<Sender<T>>>,
}

impl<T> Queue<T> {
    fn new(sender: Sender<T>) -> Self {
        Self {
            sender: RwLock::new(Some(sender)),
        }
    }

    fn push(&self, row: T) {
        let guard = self.sender.read().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = guard.as_ref() {
            // The receiver only goes away after a failure; the row is dropped then.
            let _ = sender.send(row);
        }
    }

    /// Drops the sender so the flush loop drains and stops.
    fn end(&self) {
        self.sender.write().unwrap_or_else(|e| e.into_inner()).take();
    }
}

struct Shared {
    /// Single-writer lock: every statement runs while holding it.
    connection: Mutex<Option<Connection>>,
    disposed: AtomicBool,
    failure: Mutex<Option<String>>,
    folders: Queue<DbFolder>,
    files: Queue<DbFile>,
    folder_files: Queue<DbFolderFile>,
    flushed_folders: Watermark,
    flushed_files: Watermark,
    rows_written: AtomicU64,
}

impl Shared {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn end_queues(&self) {
        self.folders.end();
        self.files.end();
        self.folder_files.end();
    }

    fn fail(&self, message: String) {
        error!("Catalog write failed: {}", message);
        {
            let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
            failure.get_or_insert(message);
        }
        self.dispose();
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.end_queues();
        self.flushed_folders.end();
        self.flushed_files.end();
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(connection);
    }

    fn execute<T: CatalogRow>(&self, rows: &[T]) -> bool {
        let mut sql = String::from(T::INSERT);
        let mut values = Vec::with_capacity(rows.len() * 3);
        for (i, row) in rows.iter().enumerate() {
            sql.push_str(if i == 0 { "(?, ?, ?)" } else { ", (?, ?, ?)" });
            values.extend(row.values());
        }

        let guard = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        let Some(connection) = guard.as_ref() else {
            return false;
        };
        let result = connection.execute(&sql, rusqlite::params_from_iter(values.iter()));
        drop(guard);

        match result {
            Ok(count) => {
                self.rows_written.fetch_add(count as u64, Ordering::Relaxed);
                trace!("Flushed {} rows into {}", count, T::LABEL);
                true
            }
            Err(e) => {
                self.fail(format!("insert into {}: {}", T::LABEL, e));
                false
            }
        }
    }
}

/// Builds one catalog file without making producers wait on disk I/O.
///
/// Ids are handed out synchronously by [`add_folder`](Self::add_folder) and
/// [`add_file`](Self::add_file); the rows themselves go through three queues
/// that background threads drain into batched inserts. Folder-file rows are
/// only written once the folder and file rows they point at are on disk.
pub struct CatalogWriter {
    path: PathBuf,
    shared: Arc<Shared>,
    next_folder_id: Mutex<i64>,
    file_ids: Mutex<FileIds>,
    flushers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct FileIds {
    last_id: i64,
    by_hash: HashMap<String, i64>,
}

impl CatalogWriter {
    /// Creates a fresh catalog at `path` and starts the flush threads.
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with_interval(path, DEFAULT_FLUSH_INTERVAL)
    }

    pub fn create_with_interval(path: &Path, flush_interval: Duration) -> Result<Self> {
        if path.exists() {
            return Err(Error::CatalogWrite(format!(
                "catalog {} already exists",
                path.display()
            )));
        }

        let connection = Connection::open(path)?;
        connection.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        connection.execute_batch(include_str!("schema.sql"))?;
        debug!("Catalog schema created at {}", path.display());

        let (folders_tx, folders_rx) = unbounded();
        let (files_tx, files_rx) = unbounded();
        let (folder_files_tx, folder_files_rx) = unbounded();

        let shared = Arc::new(Shared {
            connection: Mutex::new(Some(connection)),
            disposed: AtomicBool::new(false),
            failure: Mutex::new(None),
            folders: Queue::new(folders_tx),
            files: Queue::new(files_tx),
            folder_files: Queue::new(folder_files_tx),
            flushed_folders: Watermark::default(),
            flushed_files: Watermark::default(),
            rows_written: AtomicU64::new(0),
        });

        let flushers = vec![
            spawn_flusher("catalog-folders", Arc::clone(&shared), move |shared| {
                flush_loop(shared, &folders_rx, FOLDER_LIMITS, flush_interval, |_| true, |last: &DbFolder| {
                    shared.flushed_folders.advance(last.id)
                });
                shared.flushed_folders.end();
            })?,
            spawn_flusher("catalog-files", Arc::clone(&shared), move |shared| {
                flush_loop(shared, &files_rx, FILE_LIMITS, flush_interval, |_| true, |last: &DbFile| {
                    shared.flushed_files.advance(last.id)
                });
                shared.flushed_files.end();
            })?,
            spawn_flusher("catalog-folder-files", Arc::clone(&shared), move |shared| {
                flush_loop(
                    shared,
                    &folder_files_rx,
                    FOLDER_FILE_LIMITS,
                    flush_interval,
                    |batch: &[DbFolderFile]| {
                        let max_folder = batch.iter().map(|r| r.folder_id).max().unwrap_or(0);
                        let max_file = batch.iter().map(|r| r.file_id).max().unwrap_or(0);
                        shared.flushed_folders.wait_for(max_folder)
                            && shared.flushed_files.wait_for(max_file)
                    },
                    |_| {},
                );
            })?,
        ];

        Ok(Self {
            path: path.to_path_buf(),
            shared,
            next_folder_id: Mutex::new(0),
            file_ids: Mutex::new(FileIds::default()),
            flushers: Mutex::new(flushers),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// The first write failure, if any.
    pub fn failure(&self) -> Option<String> {
        self.shared
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn rows_written(&self) -> u64 {
        self.shared.rows_written.load(Ordering::Relaxed)
    }

    /// Registers a folder and returns its id. The row is written later.
    pub fn add_folder(&self, name: &str, parent_id: Option<i64>) -> DbFolder {
        let mut next = self.next_folder_id.lock().unwrap_or_else(|e| e.into_inner());
        *next += 1;
        let folder = DbFolder {
            id: *next,
            parent_id,
            name: name.to_string(),
        };
        // Enqueue under the id lock so queue order equals id order.
        self.shared.folders.push(folder.clone());
        folder
    }

    /// Records one occurrence of `hash` in `folder_id` under `name`.
    ///
    /// Returns the new file row the first time this catalog sees the hash,
    /// and always the folder-file row linking the occurrence.
    pub fn add_file(
        &self,
        name: &str,
        hash: &str,
        stored_name: &str,
        folder_id: i64,
    ) -> (Option<DbFile>, DbFolderFile) {
        let (file, file_id) = {
            let mut ids = self.file_ids.lock().unwrap_or_else(|e| e.into_inner());
            match ids.by_hash.get(hash) {
                Some(&id) => (None, id),
                None => {
                    ids.last_id += 1;
                    let id = ids.last_id;
                    ids.by_hash.insert(hash.to_string(), id);
                    let file = DbFile {
                        id,
                        hash: hash.to_string(),
                        file_name: stored_name.to_string(),
                    };
                    self.shared.files.push(file.clone());
                    (Some(file), id)
                }
            }
        };

        let folder_file = DbFolderFile {
            folder_id,
            file_id,
            file_name: name.to_string(),
        };
        self.shared.folder_files.push(folder_file.clone());
        (file, folder_file)
    }

    /// Ends all queues, waits for every row to be written, builds the
    /// indexes and closes the connection.
    pub fn finish(&self) -> Result<()> {
        let started = Instant::now();
        self.shared.end_queues();
        self.join_flushers();

        let connection = if self.is_disposed() {
            None
        } else {
            self.shared
                .connection
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
        };
        match connection {
            Some(connection) => {
                let indexed = connection.execute_batch(include_str!("indexes.sql"));
                let closed = connection.close().map_err(|(_, e)| e);
                if let Err(e) = indexed.and(closed) {
                    self.shared.fail(format!("finalize: {}", e));
                }
            }
            None => {
                let mut failure = self.shared.failure.lock().unwrap_or_else(|e| e.into_inner());
                failure.get_or_insert_with(|| "writer disposed before finish".to_string());
            }
        }
        self.shared.disposed.store(true, Ordering::Release);

        if let Some(message) = self.failure() {
            return Err(Error::CatalogWrite(message));
        }
        info!(
            "Catalog {} finished: {} rows in {:.2}s",
            self.path.display(),
            self.rows_written(),
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Stops writing and closes the connection. Safe to call repeatedly.
    pub fn dispose(&self) {
        self.shared.dispose();
        self.join_flushers();
    }

    fn join_flushers(&self) {
        let handles: Vec<_> = self
            .flushers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                self.shared.fail("flush thread panicked".to_string());
            }
        }
    }
}

impl Drop for CatalogWriter {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn spawn_flusher<F>(name: &str, shared: Arc<Shared>, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce(&Shared) + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(&shared))?;
    Ok(handle)
}

/// Drains `rx` into batches until the queue ends or the writer is disposed.
///
/// `gate` runs before each insert and may block; returning false drops the
/// batch. `flushed` receives the last row of each written batch.
fn flush_loop<T, G, F>(
    shared: &Shared,
    rx: &Receiver<T>,
    limits: BatchLimits,
    interval: Duration,
    mut gate: G,
    mut flushed: F,
) where
    T: CatalogRow,
    G: FnMut(&[T]) -> bool,
    F: FnMut(&T),
{
    let mut batch: Vec<T> = Vec::new();
    let mut oldest: Option<Instant> = None;

    loop {
        if shared.is_disposed() {
            return;
        }

        let received = match oldest {
            Some(at) => rx.recv_timeout(interval.saturating_sub(at.elapsed())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        let ended = match received {
            Ok(row) => {
                if batch.is_empty() {
                    oldest = Some(Instant::now());
                }
                batch.push(row);

                let full = batch.len() >= limits.max_rows
                    || (batch.len() >= limits.idle_rows && rx.is_empty());
                let stale = oldest.map(|at| at.elapsed() >= interval).unwrap_or(false);
                if !full && !stale {
                    continue;
                }
                false
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => true,
        };

        if !batch.is_empty() {
            if !gate(&batch) || shared.is_disposed() {
                debug!("Dropping {} {} rows after writer stopped", batch.len(), T::LABEL);
                return;
            }
            if !shared.execute(&batch) {
                return;
            }
            if let Some(last) = batch.last() {
                flushed(last);
            }
            batch.clear();
            oldest = None;
        }

        if ended {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_ids_are_sequential_and_files_deduplicated() {
        let dir = tempdir().unwrap();
        let writer = CatalogWriter::create(&dir.path().join("c.db")).unwrap();

        let root = writer.add_folder("root", None);
        let child = writer.add_folder("child", Some(root.id));
        assert_eq!((root.id, child.id), (1, 2));

        let (first, ff1) = writer.add_file("a.txt", "h1", "n1.txt", root.id);
        let (again, ff2) = writer.add_file("copy.txt", "h1", "n1.txt", child.id);
        assert_eq!(first.unwrap().id, 1);
        assert!(again.is_none());
        assert_eq!(ff1.file_id, ff2.file_id);

        writer.finish().unwrap();
    }

    #[test]
    fn test_finish_writes_all_rows_and_indexes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.db");
        let writer = CatalogWriter::create_with_interval(&path, Duration::from_millis(5)).unwrap();

        let root = writer.add_folder("root", None);
        for i in 0..2500 {
            let folder = writer.add_folder(&format!("f{}", i), Some(root.id));
            writer.add_file(&format!("x{}.bin", i), &format!("h{}", i % 700), &format!("s{}", i % 700), folder.id);
        }
        writer.finish().unwrap();
        assert!(writer.is_disposed());

        let conn = Connection::open(&path).unwrap();
        assert_eq!(count(&conn, "folders"), 2501);
        assert_eq!(count(&conn, "files"), 700);
        assert_eq!(count(&conn, "folders_files"), 2500);
        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE '%_idx'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 2);
    }

    #[test]
    fn test_concurrent_producers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.db");
        let writer = Arc::new(CatalogWriter::create(&path).unwrap());
        let root_id = writer.add_folder("root", None).id;

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    let folder = writer.add_folder(&format!("t{}", t), Some(root_id));
                    for i in 0..300 {
                        writer.add_file(&format!("{}.txt", i), &format!("h{}", i), &format!("s{}", i), folder.id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        writer.finish().unwrap();

        let conn = Connection::open(&path).unwrap();
        assert_eq!(count(&conn, "folders"), 5);
        assert_eq!(count(&conn, "files"), 300);
        assert_eq!(count(&conn, "folders_files"), 1200);
    }

    #[test]
    fn test_write_failure_disposes_writer() {
        let dir = tempdir().unwrap();
        let writer = CatalogWriter::create(&dir.path().join("c.db")).unwrap();

        // Parent 99 never exists, so the foreign key rejects the batch.
        writer.add_folder("orphan", Some(99));
        let result = writer.finish();

        assert!(matches!(result, Err(Error::CatalogWrite(_))));
        assert!(writer.is_disposed());
        // Enqueues after failure are silently ignored.
        writer.add_folder("late", None);
        writer.dispose();
    }

    #[test]
    fn test_existing_catalog_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.db");
        std::fs::write(&path, b"").unwrap();
        assert!(CatalogWriter::create(&path).is_err());
    }
}
