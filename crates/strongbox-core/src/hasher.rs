use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_BUFFER_LENGTH: usize = 64 * 1024; // 64KB

/// Full-content BLAKE3 hash of a file as lowercase hex.
///
/// Streams the file so large blobs never land in memory at once.
pub fn hash_file(file: &Path) -> io::Result<String> {
    let mut f = File::open(file)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0; READ_BUFFER_LENGTH];
    loop {
        let bytes_read = f.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn hash_data(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_hash_file_matches_in_memory_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content = vec![0x5Au8; READ_BUFFER_LENGTH * 2 + 17];
        fs::write(&path, &content).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_data(&content));
    }

    #[test]
    fn test_different_content_different_hash() {
        assert_ne!(hash_data(b"alpha"), hash_data(b"beta"));
        assert_eq!(hash_data(b"alpha").len(), 64);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempdir().unwrap();
        assert!(hash_file(&dir.path().join("nope")).is_err());
    }
}
