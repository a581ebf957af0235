/// A folder node in a catalog tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbFolder {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
}

/// A distinct piece of content, keyed by hash and stored under `file_name`
/// in the blob directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbFile {
    pub id: i64,
    pub hash: String,
    pub file_name: String,
}

/// One occurrence of a file inside a folder, under its original name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbFolderFile {
    pub folder_id: i64,
    pub file_id: i64,
    pub file_name: String,
}

/// A folder-file row joined with its content, as shown while browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFileEntry {
    pub name: String,
    pub hash: String,
    pub stored_name: String,
}
