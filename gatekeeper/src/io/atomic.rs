//! Atomic file replacement for artifacts other processes may read.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Replace `path` with `contents` so readers only ever see the old or the new file.
///
/// The temp file is created in the destination directory so the final rename
/// never crosses a filesystem.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    temp.write_all(contents)
        .with_context(|| format!("write temp file for {}", path.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("sync temp file for {}", path.display()))?;
    temp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Pretty JSON with a trailing newline, written atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_parent_and_replaces_existing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/dir/out.json");

        write_atomic(&path, b"first").expect("write first");
        write_atomic(&path, b"second").expect("write second");

        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .collect();
        assert_eq!(leftovers.len(), 1, "temp files must not linger");
    }

    #[test]
    fn json_ends_with_newline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("value.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.ends_with("}\n"));
    }
}
