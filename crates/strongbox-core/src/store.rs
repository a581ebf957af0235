use crate::cancel::CancelToken;
use crate::catalog::reader::CatalogReader;
use crate::error::{Error, Result};
use crate::layout;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct Index {
    by_hash: HashMap<String, String>,
    names: HashSet<String>,
    catalogs: BTreeSet<String>,
    /// Hashes whose blob is still being written by the caller that minted them.
    pending: HashSet<String>,
}

impl Index {
    fn insert(&mut self, hash: String, stored_name: String) {
        self.names.insert(stored_name.clone());
        self.by_hash.insert(hash, stored_name);
    }
}

/// In-memory index of the blobs at one destination: content hash to stored
/// file name, plus the set of catalogs the index was built from.
#[derive(Default)]
pub struct ContentStore {
    index: Mutex<Index>,
    settled: Condvar,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the index for `destination`.
    ///
    /// Uses the local cache at `cache_path` when it was written for exactly
    /// the catalogs currently published; otherwise reads every catalog.
    pub fn load(destination: &Path, cache_path: &Path, cancel: &CancelToken) -> Result<Self> {
        let started = Instant::now();
        let published: BTreeSet<String> = layout::list_catalogs(destination)?
            .into_iter()
            .map(|c| c.name)
            .collect();

        if cache_path.exists() {
            match Self::load_cache(cache_path) {
                Ok(cached) if cached.catalog_names() == published => {
                    info!(
                        "Content index loaded from cache: {} blobs ({:.2}s)",
                        cached.len(),
                        started.elapsed().as_secs_f64()
                    );
                    return Ok(cached);
                }
                Ok(_) => debug!("Content cache is stale, rebuilding from catalogs"),
                Err(e) => warn!("Ignoring unreadable content cache {}: {}", cache_path.display(), e),
            }
        }

        let store = Self::new();
        {
            let mut index = store.lock();
            for name in &published {
                let reader = CatalogReader::open(&destination.join(name));
                let mut pairs = HashMap::new();
                reader.export_hashes(&mut pairs, cancel)?;
                reader.close();
                for (hash, stored_name) in pairs {
                    index.insert(hash, stored_name);
                }
                index.catalogs.insert(name.clone());
            }
        }
        info!(
            "Content index rebuilt from {} catalogs: {} blobs ({:.2}s)",
            published.len(),
            store.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(store)
    }

    /// Returns the stored name for `hash`, minting one if the hash is new.
    ///
    /// The flag is `true` only for the call that registered the hash; that
    /// caller owns the blob and must end with [`confirm`](Self::confirm) or
    /// [`remove`](Self::remove). Until then other callers for the same hash
    /// block here. If the owner removed the hash, the next waiter becomes the
    /// new owner.
    pub fn add(&self, hash: &str, extension: &str) -> (bool, String) {
        let mut index = self.lock();
        while index.pending.contains(hash) {
            index = self.settled.wait(index).unwrap_or_else(|e| e.into_inner());
        }
        if let Some(existing) = index.by_hash.get(hash) {
            return (false, existing.clone());
        }
        let stored_name = loop {
            let candidate = format!("{}{}", Uuid::new_v4().simple(), extension);
            if !index.names.contains(&candidate) {
                break candidate;
            }
        };
        index.insert(hash.to_string(), stored_name.clone());
        index.pending.insert(hash.to_string());
        (true, stored_name)
    }

    /// Marks the blob for `hash` as written and wakes callers waiting on it.
    pub fn confirm(&self, hash: &str) {
        let mut index = self.lock();
        if index.pending.remove(hash) {
            self.settled.notify_all();
        }
    }

    pub fn is_pending(&self, hash: &str) -> bool {
        self.lock().pending.contains(hash)
    }

    pub fn get(&self, hash: &str) -> Option<String> {
        self.lock().by_hash.get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_catalog_name(&self, name: &str) {
        self.lock().catalogs.insert(name.to_string());
    }

    pub fn catalog_names(&self) -> BTreeSet<String> {
        self.lock().catalogs.clone()
    }

    /// Forgets a hash, used when its blob was rolled back.
    pub fn remove(&self, hash: &str) {
        let mut index = self.lock();
        if let Some(name) = index.by_hash.remove(hash) {
            index.names.remove(&name);
        }
        if index.pending.remove(hash) {
            self.settled.notify_all();
        }
    }

    /// Writes the index next to `path` and renames it into place.
    ///
    /// Hash lines come first and catalog names last, so a cache cut short
    /// never lists the full catalog set. Pending hashes are left out.
    pub fn save_cache(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;
        let index = self.lock();
        let mut temp = NamedTempFile::new_in(parent)?;
        {
            let mut out = BufWriter::new(temp.as_file_mut());
            for (hash, stored_name) in &index.by_hash {
                if index.pending.contains(hash) {
                    continue;
                }
                writeln!(out, "{}|{}", hash, stored_name)?;
            }
            for name in &index.catalogs {
                writeln!(out, "{}", name)?;
            }
            out.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        debug!("Saved content cache {} ({} blobs)", path.display(), index.by_hash.len());
        Ok(())
    }

    /// Reads a cache written by [`save_cache`](Self::save_cache).
    ///
    /// Any line that is neither `hash|stored name` with a well-formed stored
    /// name nor a catalog file name rejects the whole file.
    pub fn load_cache(path: &Path) -> Result<Self> {
        let store = Self::new();
        {
            let mut index = store.lock();
            let reader = BufReader::new(fs::File::open(path)?);
            for (number, line) in reader.lines().enumerate() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line.split_once('|') {
                    Some((hash, stored_name))
                        if !hash.is_empty() && layout::is_stored_name(stored_name) =>
                    {
                        index.insert(hash.to_string(), stored_name.to_string())
                    }
                    None if layout::parse_catalog_name(line).is_some() => {
                        index.catalogs.insert(line.to_string());
                    }
                    _ => {
                        return Err(Error::Other(format!(
                            "malformed content cache line {}: {}",
                            number + 1,
                            line
                        )))
                    }
                }
            }
        }
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }
}
