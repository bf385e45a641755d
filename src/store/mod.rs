//! Durable, tag-keyed storage for retrieval results.
//!
//! Layout under the store root:
//!
//! ```text
//! store.json              format version
//! dataset.json            the ingested dataset shared by every run
//! results/<tag>.json      one RetrievalResult per tag
//! checkpoints/<tag>.json  resumable sampler state
//! ```
//!
//! Every write goes to a hidden temp file in the target directory, is synced,
//! then renamed into place. Readers therefore see either the previous file or
//! the new one, and writers under distinct tags never touch the same path.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{Checkpoint, Dataset, RetrievalResult, Tag};
use crate::error::{HarnessError, Result};

/// On-disk layout version written to `store.json`.
pub const STORE_FORMAT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "store.json";
const DATASET_FILE: &str = "dataset.json";
const RESULTS_DIR: &str = "results";
const CHECKPOINTS_DIR: &str = "checkpoints";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreManifest {
    format_version: u32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    /// Open a store, creating the layout on first use.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [root.clone(), root.join(RESULTS_DIR), root.join(CHECKPOINTS_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| HarnessError::io(&dir, e))?;
        }

        let manifest_path = root.join(MANIFEST_FILE);
        match read_json::<StoreManifest>(&manifest_path)? {
            Some(manifest) if manifest.format_version != STORE_FORMAT_VERSION => {
                return Err(HarnessError::StoreVersion {
                    root,
                    found: manifest.format_version,
                    expected: STORE_FORMAT_VERSION,
                });
            }
            Some(_) => debug!(root = %root.display(), "opened result store"),
            None => {
                let manifest = StoreManifest {
                    format_version: STORE_FORMAT_VERSION,
                    created_at: Utc::now(),
                };
                write_json_atomic(&manifest_path, &manifest)?;
                info!(root = %root.display(), version = STORE_FORMAT_VERSION, "initialized result store");
            }
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a result under its tag. Last write wins.
    pub fn put(&self, result: &RetrievalResult) -> Result<()> {
        let path = self.result_path(&result.tag);
        write_json_atomic(&path, result)?;
        debug!(tag = %result.tag, samples = result.samples.len(), status = result.status.label(), "result stored");
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Result<RetrievalResult> {
        let tag = Tag::new(tag)?;
        read_json(&self.result_path(&tag))?.ok_or_else(|| HarnessError::NotFound(tag.to_string()))
    }

    pub fn exists(&self, tag: &str) -> bool {
        Tag::new(tag)
            .map(|t| self.result_path(&t).is_file())
            .unwrap_or(false)
    }

    /// Remove a stored result. Returns whether anything was removed.
    pub fn delete(&self, tag: &str) -> Result<bool> {
        let tag = Tag::new(tag)?;
        let removed = remove_if_exists(&self.result_path(&tag))?;
        if removed {
            info!(tag = %tag, "result deleted");
        }
        Ok(removed)
    }

    /// Tags with a stored result, sorted.
    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        let dir = self.root.join(RESULTS_DIR);
        let entries = fs::read_dir(&dir).map_err(|e| HarnessError::io(&dir, e))?;

        let mut tags = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| HarnessError::io(&dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            match Tag::new(stem) {
                Ok(tag) => tags.push(tag),
                Err(err) => warn!(file = name, error = %err, "ignoring unexpected file in result store"),
            }
        }
        tags.sort();
        Ok(tags)
    }

    pub fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_json_atomic(&self.checkpoint_path(&checkpoint.tag), checkpoint)?;
        debug!(tag = %checkpoint.tag, iteration = checkpoint.iteration, "checkpoint written");
        Ok(())
    }

    pub fn get_checkpoint(&self, tag: &Tag) -> Result<Option<Checkpoint>> {
        read_json(&self.checkpoint_path(tag))
    }

    pub fn delete_checkpoint(&self, tag: &Tag) -> Result<bool> {
        remove_if_exists(&self.checkpoint_path(tag))
    }

    pub fn put_dataset(&self, dataset: &Dataset) -> Result<()> {
        write_json_atomic(&self.root.join(DATASET_FILE), dataset)?;
        info!(object = %dataset.object_name, points = dataset.len(), "dataset stored");
        Ok(())
    }

    pub fn get_dataset(&self) -> Result<Dataset> {
        read_json(&self.root.join(DATASET_FILE))?.ok_or_else(|| {
            HarnessError::Dataset(format!(
                "no dataset ingested into store at '{}'",
                self.root.display()
            ))
        })
    }

    fn result_path(&self, tag: &Tag) -> PathBuf {
        self.root.join(RESULTS_DIR).join(format!("{tag}.json"))
    }

    fn checkpoint_path(&self, tag: &Tag) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR).join(format!("{tag}.json"))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(HarnessError::io(path, e)),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Serialize to a sibling temp file, fsync, then rename over `path`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("store");
    let tmp_path = dir.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let mut file = File::create(&tmp_path).map_err(|e| HarnessError::io(&tmp_path, e))?;
    file.write_all(&bytes)
        .map_err(|e| HarnessError::io(&tmp_path, e))?;
    file.sync_all().map_err(|e| HarnessError::io(&tmp_path, e))?;
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(HarnessError::io(path, e));
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(HarnessError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{configuration, result_with, dataset};
    use tempfile::TempDir;

    #[test]
    fn put_then_get_returns_same_result() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let result = result_with(&configuration("nomass"), &[(2.5, -3.0), (4.0, -1.25)]);

        store.put(&result).unwrap();
        assert_eq!(store.get("nomass").unwrap(), result);
        assert!(store.exists("nomass"));
    }

    #[test]
    fn missing_tag_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        assert!(matches!(store.get("never-run"), Err(HarnessError::NotFound(t)) if t == "never-run"));
        assert!(!store.exists("never-run"));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        store
            .put(&result_with(&configuration("a"), &[(3.0, -1.0)]))
            .unwrap();

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(matches!(store.get("a"), Err(HarnessError::NotFound(_))));
    }

    #[test]
    fn list_tags_is_sorted_and_skips_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        for tag in ["mass-freeab", "fixab", "nomass-freeab"] {
            store
                .put(&result_with(&configuration(tag), &[(3.0, -1.0)]))
                .unwrap();
        }
        fs::write(dir.path().join("results/.half-written.tmp"), b"{").unwrap();

        let tags: Vec<String> = store
            .list_tags()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(tags, vec!["fixab", "mass-freeab", "nomass-freeab"]);
    }

    #[test]
    fn reopen_keeps_results_and_checks_version() {
        let dir = TempDir::new().unwrap();
        {
            let store = ResultStore::open(dir.path()).unwrap();
            store
                .put(&result_with(&configuration("a"), &[(3.0, -1.0)]))
                .unwrap();
        }
        let store = ResultStore::open(dir.path()).unwrap();
        assert!(store.exists("a"));

        fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"format_version": 99, "created_at": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(
            ResultStore::open(dir.path()),
            Err(HarnessError::StoreVersion { found: 99, .. })
        ));
    }

    #[test]
    fn concurrent_puts_under_distinct_tags_do_not_interfere() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let results: Vec<RetrievalResult> = (0..8)
            .map(|i| result_with(&configuration(&format!("run-{i}")), &[(3.0, -(i as f64))]))
            .collect();

        std::thread::scope(|scope| {
            for result in &results {
                let store = &store;
                scope.spawn(move || store.put(result).unwrap());
            }
        });

        for result in &results {
            assert_eq!(&store.get(result.tag.as_str()).unwrap(), result);
        }
    }

    #[test]
    fn checkpoint_and_dataset_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let tag = Tag::new("a").unwrap();
        assert!(store.get_checkpoint(&tag).unwrap().is_none());

        let checkpoint = Checkpoint {
            tag: tag.clone(),
            engine: "prior-sampler".to_string(),
            iteration: 7,
            payload: serde_json::json!({ "draws": [] }),
            updated_at: Utc::now(),
        };
        store.put_checkpoint(&checkpoint).unwrap();
        assert_eq!(store.get_checkpoint(&tag).unwrap(), Some(checkpoint));
        assert!(store.delete_checkpoint(&tag).unwrap());

        assert!(matches!(store.get_dataset(), Err(HarnessError::Dataset(_))));
        let ds = dataset();
        store.put_dataset(&ds).unwrap();
        assert_eq!(store.get_dataset().unwrap(), ds);
    }

    #[test]
    fn path_like_tags_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        assert!(matches!(store.get("../x"), Err(HarnessError::InvalidTag { .. })));
    }
}
