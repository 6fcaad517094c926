//! SHA-256 helpers. Hashes are lowercase hex.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader
            .read(&mut chunk)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_and_bytes_agree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("data.txt");
        std::fs::write(&path, b"hello\n").expect("write");

        let from_file = sha256_file(&path).expect("hash");
        assert_eq!(from_file, sha256_bytes(b"hello\n"));
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(sha256_file(&temp.path().join("absent")).is_err());
    }
}
