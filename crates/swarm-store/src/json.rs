//! Single-file JSON state: ENOENT-tolerant reads and atomic rewrites.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Read and parse a JSON file. A missing file is `Ok(None)`, not an error,
/// so callers can treat first-run and post-crash layouts uniformly.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let value = serde_json::from_str(&body).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(value))
}

/// Write a JSON file atomically: serialize to `<path>.tmp`, fsync, rename.
/// Readers never observe a half-written file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    let mut file = File::create(&tmp).map_err(|source| StoreError::Write {
        path: tmp.clone(),
        source,
    })?;
    file.write_all(&body).map_err(|source| StoreError::Write {
        path: tmp.clone(),
        source,
    })?;
    file.sync_all().map_err(|source| StoreError::Write {
        path: tmp.clone(),
        source,
    })?;
    drop(file);

    fs::rename(&tmp, path).map_err(|source| StoreError::Rename {
        from: tmp,
        to: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("swarmops-store-{prefix}-{now}"));
        fs::create_dir_all(&path).expect("create temp dir");
        path
    }

    #[test]
    fn read_missing_file_returns_none() {
        let dir = unique_temp_dir("read-missing");
        let loaded: Option<Sample> = read_json(&dir.join("absent.json")).expect("read");
        assert!(loaded.is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = unique_temp_dir("roundtrip");
        let path = dir.join("nested").join("sample.json");
        let value = Sample {
            name: "alpha".to_string(),
            count: 7,
        };

        write_json_atomic(&path, &value).expect("write");
        let loaded: Sample = read_json(&path).expect("read").expect("present");
        assert_eq!(loaded, value);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn atomic_write_leaves_no_tmp_file_behind() {
        let dir = unique_temp_dir("tmp-clean");
        let path = dir.join("state.json");
        write_json_atomic(&path, &Sample {
            name: "x".to_string(),
            count: 1,
        })
        .expect("write");

        assert!(path.exists());
        assert!(!dir.join("state.json.tmp").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_file_is_a_parse_error() {
        let dir = unique_temp_dir("corrupt");
        let path = dir.join("broken.json");
        fs::write(&path, "{not json").expect("write garbage");

        let err = read_json::<Sample>(&path).expect_err("parse failure");
        assert!(matches!(err, StoreError::Parse { .. }));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn rewrite_replaces_previous_contents() {
        let dir = unique_temp_dir("rewrite");
        let path = dir.join("state.json");
        write_json_atomic(&path, &Sample {
            name: "first".to_string(),
            count: 1,
        })
        .expect("write first");
        write_json_atomic(&path, &Sample {
            name: "second".to_string(),
            count: 2,
        })
        .expect("write second");

        let loaded: Sample = read_json(&path).expect("read").expect("present");
        assert_eq!(loaded.name, "second");
        let _ = fs::remove_dir_all(dir);
    }
}
