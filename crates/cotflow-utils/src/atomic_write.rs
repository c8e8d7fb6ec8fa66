//! Atomic file writes: temp file in the target directory, fsync, rename.
//!
//! Readers of a state file either see the previous complete document or the
//! new complete document, never a torn write.

use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;

/// Atomically replace `path` with `content`, creating parent directories.
///
/// # Errors
///
/// Returns an error if the directory cannot be created, the temporary file
/// cannot be written or synced, or the final rename fails.
pub fn write_file_atomic(path: &Utf8Path, content: &str) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create parent directory: {parent}"))?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in: {parent}"))?;

    temp_file
        .write_all(content.as_bytes())
        .context("Failed to write content to temporary file")?;
    temp_file
        .as_file()
        .sync_all()
        .context("Failed to fsync temporary file")?;

    temp_file
        .persist(path.as_std_path())
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to atomically write file: {path}"))?;

    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// # Errors
///
/// Returns an error on serialization failure or any [`write_file_atomic`] failure.
pub fn write_json_atomic<T: serde::Serialize>(path: &Utf8Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    json.push('\n');
    write_file_atomic(path, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn utf8_dir(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = utf8_dir(&dir).join("a/b/c.txt");
        write_file_atomic(&path, "hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = utf8_dir(&dir).join("state.json");
        write_file_atomic(&path, "first version, longer").unwrap();
        write_file_atomic(&path, "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let root = utf8_dir(&dir);
        write_json_atomic(&root.join("x.json"), &serde_json::json!({"k": 1})).unwrap();
        let entries: Vec<_> = fs::read_dir(&root).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
