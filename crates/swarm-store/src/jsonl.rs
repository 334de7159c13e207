//! Append-only JSONL files: one record per line, tolerant folds.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Append one record as a single line. Small single writes are atomic at
/// the OS level, which is all the concurrency the shards need.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut line = serde_json::to_string(record).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(line.as_bytes())
        .map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Fold every parseable record of a JSONL file into `accept`, in file
/// order. Unparsable lines are skipped with a stderr warning rather than
/// poisoning the whole shard; a missing file folds nothing.
pub fn fold_jsonl<T, F>(path: &Path, mut accept: F) -> Result<usize, StoreError>
where
    T: DeserializeOwned,
    F: FnMut(T),
{
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let reader = BufReader::new(file);
    let mut folded = 0usize;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => {
                accept(record);
                folded += 1;
            }
            Err(err) => {
                eprintln!(
                    "[swarm-store] skipping unparsable record {}:{}: {err}",
                    path.display(),
                    idx + 1
                );
            }
        }
    }

    Ok(folded)
}
