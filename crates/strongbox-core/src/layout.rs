//! On-disk naming at a backup destination.
//!
//! ```text
//! <destination>/
//!   2024-03-01_18-30-00.db   one catalog per run
//!   files/                   content-addressed blobs
//! ```

use chrono::{Duration, NaiveDateTime};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const BLOB_DIR_NAME: &str = "files";
pub const CATALOG_EXTENSION: &str = "db";
const CATALOG_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const STORED_ID_LEN: usize = 32;

pub fn blob_dir(destination: &Path) -> PathBuf {
    destination.join(BLOB_DIR_NAME)
}

pub fn catalog_file_name(started: NaiveDateTime) -> String {
    format!("{}.{}", started.format(CATALOG_TIME_FORMAT), CATALOG_EXTENSION)
}

/// Parses the timestamp out of a catalog file name, `None` for anything that
/// is not a catalog.
pub fn parse_catalog_name(file_name: &str) -> Option<NaiveDateTime> {
    let stem = file_name.strip_suffix(&format!(".{}", CATALOG_EXTENSION))?;
    NaiveDateTime::parse_from_str(stem, CATALOG_TIME_FORMAT).ok()
}

/// First free catalog name at or after `started`, advancing one second at a
/// time when a run in the same second already published.
pub fn free_catalog_name(destination: &Path, started: NaiveDateTime) -> String {
    let mut at = started;
    loop {
        let name = catalog_file_name(at);
        if !destination.join(&name).exists() {
            return name;
        }
        at += Duration::seconds(1);
    }
}

/// A published catalog at a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub path: PathBuf,
    pub created: NaiveDateTime,
}

/// Published catalogs sorted oldest first.
pub fn list_catalogs(destination: &Path) -> io::Result<Vec<CatalogEntry>> {
    let mut catalogs = Vec::new();
    for entry in fs::read_dir(destination)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(created) = parse_catalog_name(&name) {
            catalogs.push(CatalogEntry {
                name,
                path: entry.path(),
                created,
            });
        }
    }
    catalogs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(catalogs)
}

/// Local cache file for a destination's blob index.
pub fn cache_file_path(cache_dir: &Path, destination: &Path) -> PathBuf {
    let key = blake3::hash(destination.to_string_lossy().as_bytes()).to_hex();
    cache_dir.join(format!("blobs-{}.txt", &key.as_str()[..16]))
}

/// Whether `name` has the shape of a blob name: 32 lowercase hex digits
/// followed by nothing or a dotted extension.
pub fn is_stored_name(name: &str) -> bool {
    if name.len() < STORED_ID_LEN || !name.is_char_boundary(STORED_ID_LEN) {
        return false;
    }
    let (id, extension) = name.split_at(STORED_ID_LEN);
    id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        && (extension.is_empty()
            || (extension.starts_with('.') && !extension.contains(['/', '\\'])))
}

/// File extension including the dot, or empty.
pub fn extension_with_dot(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_catalog_name_round_trip_and_sorting() {
        let name = catalog_file_name(at(9, 5, 7));
        assert_eq!(name, "2024-03-01_09-05-07.db");
        assert_eq!(parse_catalog_name(&name), Some(at(9, 5, 7)));
        assert!(catalog_file_name(at(9, 5, 7)) < catalog_file_name(at(10, 0, 0)));
        assert_eq!(parse_catalog_name("notes.db"), None);
        assert_eq!(parse_catalog_name("2024-03-01_09-05-07.txt"), None);
    }

    #[test]
    fn test_free_catalog_name_skips_taken_second() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(catalog_file_name(at(1, 2, 3))), b"").unwrap();
        assert_eq!(
            free_catalog_name(dir.path(), at(1, 2, 3)),
            catalog_file_name(at(1, 2, 4))
        );
    }

    #[test]
    fn test_list_catalogs_ignores_other_entries() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("2024-03-02_00-00-00.db"), b"").unwrap();
        fs::write(dir.path().join("2024-03-01_00-00-00.db"), b"").unwrap();
        fs::write(dir.path().join("readme.txt"), b"").unwrap();
        fs::create_dir(blob_dir(dir.path())).unwrap();

        let names: Vec<String> = list_catalogs(dir.path())
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["2024-03-01_00-00-00.db", "2024-03-02_00-00-00.db"]);
    }

    #[test]
    fn test_stored_name_shape() {
        assert!(is_stored_name("0ddbec7820654a28af219fd2fae33eb2.jpg"));
        assert!(is_stored_name("0ddbec7820654a28af219fd2fae33eb2"));
        assert!(!is_stored_name("0ddbec7820654a28af219fd2fae33eb"), "cut short");
        assert!(!is_stored_name("0ddbec7820654a28af219fd2fae33eb2jpg"));
        assert!(!is_stored_name("0DDBEC7820654A28AF219FD2FAE33EB2.jpg"));
        assert!(!is_stored_name("0ddbec7820654a28af219fd2fae33eb2./x"));
    }

    #[test]
    fn test_extension_with_dot() {
        assert_eq!(extension_with_dot(Path::new("a/b.txt")), ".txt");
        assert_eq!(extension_with_dot(Path::new("a/Makefile")), "");
    }
}
