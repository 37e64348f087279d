//! All-or-nothing file writes (temp file + fsync + rename).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// Write `contents` to `path` atomically.
///
/// The data lands in a `.tmp` sibling first, is flushed and synced to stable
/// storage, then renamed over the target. A crash mid-write leaves either the
/// old contents or an orphaned `.tmp` sibling, never a truncated target. The
/// temp file is removed on any error.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = tmp_sibling(path);
    let result = (|| -> Result<()> {
        let mut file =
            File::create(&tmp).with_context(|| format!("create temp file {}", tmp.display()))?;
        file.write_all(contents)
            .with_context(|| format!("write temp file {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("sync temp file {}", tmp.display()))?;
        drop(file);
        fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Serialize `value` to pretty-printed JSON with a trailing newline and write
/// it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    write_atomic(path, payload.as_bytes())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_new_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.json");

        write_atomic(&path, b"hello").expect("write");
        assert_eq!(fs::read(&path).expect("read"), b"hello");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn replaces_existing_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.json");

        write_atomic(&path, b"first").expect("write first");
        write_atomic(&path, b"second").expect("write second");
        assert_eq!(fs::read(&path).expect("read"), b"second");
    }

    /// A failed write must not disturb the previous contents or leave the
    /// temp sibling behind.
    #[test]
    fn failed_write_preserves_target_and_cleans_tmp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.json");
        write_atomic(&path, b"old").expect("write");

        // Make the target a directory so the rename fails.
        let blocked = temp.path().join("blocked");
        fs::create_dir(&blocked).expect("mkdir");
        fs::create_dir(blocked.join("sub")).expect("mkdir sub");
        let err = write_atomic(&blocked, b"new");
        assert!(err.is_err());

        let mut tmp = blocked.as_os_str().to_owned();
        tmp.push(".tmp");
        assert!(!PathBuf::from(tmp).exists());
        assert_eq!(fs::read(&path).expect("read"), b"old");
    }

    #[test]
    fn json_writer_pretty_prints_with_trailing_newline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("value.json");

        write_json_atomic(&path, &serde_json::json!({"a": 1})).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "{\n  \"a\": 1\n}\n");
    }
}
