//! Atomic JSON file helpers
//!
//! Checkpoints, progress snapshots, and per-query results are written
//! write-then-rename so a crash mid-write never leaves a torn file.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Write JSON atomically: serialize to `<path>.tmp`, then rename over `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, payload: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    });
    let text = serde_json::to_string_pretty(payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and parse a JSON file, returning `None` on any failure.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Load a text file, returning an empty string on failure.
pub fn load_text(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_atomic_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_json_atomic(&path, &json!({"completed": ["q1", "q2"]})).unwrap();
        let loaded: serde_json::Value = load_json(&path).unwrap();
        assert_eq!(loaded["completed"][1], "q2");

        // No .tmp residue after a successful write
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_json_absorbs_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let loaded: Option<serde_json::Value> = load_json(&path);
        assert!(loaded.is_none());
    }
}
