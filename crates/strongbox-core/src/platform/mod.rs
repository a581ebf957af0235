#[cfg(target_os = "windows")]
pub mod windows;

use std::fs::Metadata;
use std::path::Path;

/// Whether a directory entry should be treated as hidden and skipped.
#[cfg(target_os = "windows")]
pub fn is_hidden(path: &Path, metadata: &Metadata) -> bool {
    windows::is_hidden(path, metadata)
}

/// Dot-prefixed names are hidden on Unix-like systems.
#[cfg(not(target_os = "windows"))]
pub fn is_hidden(path: &Path, _metadata: &Metadata) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Path as text with a trailing separator, the form directory exclude rules
/// are tested against.
pub fn directory_match_path(path: &Path) -> String {
    let mut text = path.to_string_lossy().into_owned();
    if !text.ends_with(std::path::MAIN_SEPARATOR) {
        text.push(std::path::MAIN_SEPARATOR);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_match_path_adds_one_separator() {
        let sep = std::path::MAIN_SEPARATOR;
        let dir = Path::new("some").join("dir");
        let text = directory_match_path(&dir);
        assert!(text.ends_with(sep));
        assert_eq!(directory_match_path(Path::new(&text)), text);
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_dot_files_are_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let hidden = dir.path().join(".secret");
        let visible = dir.path().join("plain");
        std::fs::write(&hidden, "x").unwrap();
        std::fs::write(&visible, "x").unwrap();

        assert!(is_hidden(&hidden, &std::fs::metadata(&hidden).unwrap()));
        assert!(!is_hidden(&visible, &std::fs::metadata(&visible).unwrap()));
    }
}
