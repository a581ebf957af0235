use super::models::{CatalogFileEntry, DbFile, DbFolder, DbFolderFile};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

struct Slot {
    connection: Option<Connection>,
    last_used: Instant,
}

/// Read-only access to one published catalog.
///
/// The SQLite handle is opened on first query and closed again after
/// `idle_timeout` without use, so browsing many catalogs does not pin one
/// open file per catalog. One timer thread per reader watches for idleness;
/// it is started by the first query and stops when the reader is dropped.
pub struct CatalogReader {
    path: PathBuf,
    idle_timeout: Duration,
    slot: Arc<Mutex<Slot>>,
    timer: Mutex<Option<Sender<()>>>,
    timers_started: AtomicUsize,
}

impl CatalogReader {
    pub fn open(path: &Path) -> Self {
        Self::with_idle_timeout(path, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(path: &Path, idle_timeout: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            idle_timeout,
            slot: Arc::new(Mutex::new(Slot {
                connection: None,
                last_used: Instant::now(),
            })),
            timer: Mutex::new(None),
            timers_started: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Catalog file name without extension, e.g. `2024-03-01_18-30-00`.
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.lock_slot().connection.is_some()
    }

    /// Child folders of `parent_id`, or the root folders when `None`.
    pub fn folders(&self, parent_id: Option<i64>) -> Result<Vec<DbFolder>> {
        self.with_connection(|conn| {
            let mut stmt = match parent_id {
                Some(_) => conn.prepare_cached(
                    "SELECT id, name, parent_id FROM folders \
                     WHERE parent_id = ?1 ORDER BY name",
                )?,
                None => conn.prepare_cached(
                    "SELECT id, name, parent_id FROM folders \
                     WHERE parent_id IS NULL OR parent_id = 0 ORDER BY name",
                )?,
            };
            let rows = match parent_id {
                Some(id) => stmt.query_map(params![id], folder_from_row)?,
                None => stmt.query_map([], folder_from_row)?,
            };
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// A single folder by id.
    pub fn folder(&self, id: i64) -> Result<Option<DbFolder>> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT id, name, parent_id FROM folders WHERE id = ?1")?;
            Ok(stmt.query_row(params![id], folder_from_row).optional()?)
        })
    }

    /// Files directly inside a folder, joined with their content rows.
    pub fn files(&self, folder_id: i64) -> Result<Vec<CatalogFileEntry>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT ff.file_name, f.hash, f.file_name \
                 FROM folders_files ff \
                 JOIN files f ON ff.file_id = f.id \
                 WHERE ff.folder_id = ?1 \
                 ORDER BY ff.file_name",
            )?;
            let files = stmt
                .query_map(params![folder_id], |row| {
                    Ok(CatalogFileEntry {
                        name: row.get(0)?,
                        hash: row.get(1)?,
                        stored_name: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(files)
        })
    }

    /// Merges every referenced `hash → stored name` pair into `into`.
    pub fn export_hashes(
        &self,
        into: &mut HashMap<String, String>,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT f.hash, f.file_name \
                 FROM files f \
                 JOIN folders_files ff ON f.id = ff.file_id",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                into.insert(row.get(0)?, row.get(1)?);
            }
            Ok(())
        })
    }

    pub fn all_folders(&self, cancel: &CancelToken) -> Result<Vec<DbFolder>> {
        self.collect_all(
            "SELECT id, name, parent_id FROM folders ORDER BY id",
            folder_from_row,
            cancel,
        )
    }

    pub fn all_files(&self, cancel: &CancelToken) -> Result<Vec<DbFile>> {
        self.collect_all(
            "SELECT id, hash, file_name FROM files ORDER BY id",
            |row| {
                Ok(DbFile {
                    id: row.get(0)?,
                    hash: row.get(1)?,
                    file_name: row.get(2)?,
                })
            },
            cancel,
        )
    }

    pub fn all_folder_files(&self, cancel: &CancelToken) -> Result<Vec<DbFolderFile>> {
        self.collect_all(
            "SELECT folder_id, file_id, file_name FROM folders_files \
             ORDER BY folder_id, file_id",
            |row| {
                Ok(DbFolderFile {
                    folder_id: row.get(0)?,
                    file_id: row.get(1)?,
                    file_name: row.get(2)?,
                })
            },
            cancel,
        )
    }

    /// Closes the connection now instead of waiting for the idle timer.
    pub fn close(&self) {
        self.lock_slot().connection = None;
    }

    fn collect_all<T, F>(&self, sql: &str, map: F, cancel: &CancelToken) -> Result<Vec<T>>
    where
        F: Fn(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query([])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                items.push(map(row)?);
            }
            Ok(items)
        })
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_connection<T, F>(&self, query: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut slot = self.lock_slot();
        if slot.connection.is_none() {
            let conn = Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            debug!("Opened catalog {}", self.path.display());
            slot.connection = Some(conn);
        }

        let result = match slot.connection.as_ref() {
            Some(conn) => query(conn),
            None => Err(Error::Other("catalog connection unavailable".to_string())),
        };
        slot.last_used = Instant::now();
        drop(slot);

        self.touch();
        result
    }

    /// Restarts the idle countdown, starting the timer thread on first use.
    fn touch(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.is_none() {
            let (touches, received) = bounded(1);
            let slot = Arc::clone(&self.slot);
            let idle = self.idle_timeout;
            let path = self.path.clone();
            let spawned = thread::Builder::new()
                .name("catalog-idle-close".to_string())
                .spawn(move || close_when_idle(slot, received, idle, path));
            match spawned {
                Ok(_) => {
                    self.timers_started.fetch_add(1, Ordering::Relaxed);
                    *timer = Some(touches);
                }
                Err(e) => {
                    warn!("No idle timer for {}: {}", self.path.display(), e);
                    drop(timer);
                    self.close();
                    return;
                }
            }
        }
        if let Some(touches) = timer.as_ref() {
            // A full channel already holds a pending touch.
            let _ = touches.try_send(());
        }
    }
}

/// Timer loop of one reader. Exits when the reader drops its sender.
fn close_when_idle(slot: Arc<Mutex<Slot>>, touches: Receiver<()>, idle: Duration, path: PathBuf) {
    loop {
        match touches.recv_timeout(idle) {
            Ok(()) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                {
                    let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
                    if slot.connection.is_some() && slot.last_used.elapsed() >= idle {
                        slot.connection = None;
                        trace!("Closed idle catalog {}", path.display());
                    }
                }
                // Nothing to time until the next query.
                if touches.recv().is_err() {
                    break;
                }
            }
        }
    }
}

fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<DbFolder> {
    Ok(DbFolder {
        id: row.get(0)?,
        name: row.get(1)?,
        parent_id: row.get(2)?,
    })
}
