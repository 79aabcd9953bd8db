//! Shared persistence utilities — atomic file writes, JSON load/save.
//!
//! The state store writes every stage transition; the atomic write pattern
//! (write to .tmp then rename) prevents a crash mid-write from corrupting
//! the last good snapshot.

use std::io;
use std::path::Path;

/// Atomically write a value as pretty-printed JSON.
///
/// Serializes, writes to a `.tmp` sibling file, then renames over the
/// target path. Creates parent directories if they don't exist.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        run: String,
        iteration: u32,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let data = Snapshot {
            run: "acme".into(),
            iteration: 2,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<Snapshot> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join("deep").join("state.json");
        atomic_write_json(&path, &"x").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<Snapshot>> = load_json(Path::new("/nonexistent/state.json"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_atomic_write_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean.json");
        atomic_write_json(&path, &"test").unwrap();
        assert!(!path.with_extension("tmp").exists());
    }
}
