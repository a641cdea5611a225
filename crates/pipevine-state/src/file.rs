//! Single-file JSON implementation of [`StateStore`].
//!
//! The whole store is one JSON document: a top-level mapping whose reserved
//! `pipeline_runs` key holds the run ledger as an array, with every other
//! key a generic kv entry (the scheduler writes `scheduler:job:<id>`).
//! Every operation is load-mutate-rewrite under an in-process exclusive
//! lock; lookups are linear scans.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use pipevine_types::PipelineRun;
use serde_json::{Map, Value};

use crate::error::{self, StateError};
use crate::store::StateStore;

/// Reserved top-level key holding the run ledger.
const RUNS_KEY: &str = "pipeline_runs";

/// File-backed state storage.
///
/// Suitable for single-process deployments; the lock serializes mutators
/// within the process only.
pub struct FileStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStateStore {
    /// Create a store backed by the JSON document at `path`.
    ///
    /// The file is created on first write; a missing file reads as an empty
    /// document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the parent directory can't be created.
    pub fn open(path: impl Into<PathBuf>) -> error::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Path of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> error::Result<Map<String, Value>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(Map::new()),
            Ok(text) => match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => Ok(map),
                _ => Ok(Map::new()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, doc: &Map<String, Value>) -> error::Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&Value::Object(doc.clone()))?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn runs_mut(doc: &mut Map<String, Value>) -> &mut Vec<Value> {
        let entry = doc
            .entry(RUNS_KEY.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        entry.as_array_mut().expect("runs entry is an array")
    }

    fn decode_runs(doc: &Map<String, Value>) -> error::Result<Vec<PipelineRun>> {
        match doc.get(RUNS_KEY) {
            Some(Value::Array(entries)) => entries
                .iter()
                .map(|entry| serde_json::from_value(entry.clone()).map_err(StateError::from))
                .collect(),
            _ => Ok(Vec::new()),
        }
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> error::Result<Option<Value>> {
        let _guard = self.lock.lock().map_err(|_| StateError::LockPoisoned)?;
        let doc = self.load()?;
        if key == RUNS_KEY {
            return Ok(None);
        }
        Ok(doc.get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> error::Result<()> {
        // The run ledger is only reachable through the run operations.
        if key == RUNS_KEY {
            return Ok(());
        }
        let _guard = self.lock.lock().map_err(|_| StateError::LockPoisoned)?;
        let mut doc = self.load()?;
        doc.insert(key.to_string(), value.clone());
        self.persist(&doc)
    }

    fn delete(&self, key: &str) -> error::Result<()> {
        if key == RUNS_KEY {
            return Ok(());
        }
        let _guard = self.lock.lock().map_err(|_| StateError::LockPoisoned)?;
        let mut doc = self.load()?;
        if doc.remove(key).is_some() {
            self.persist(&doc)?;
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> error::Result<Vec<String>> {
        let _guard = self.lock.lock().map_err(|_| StateError::LockPoisoned)?;
        let doc = self.load()?;
        let mut keys: Vec<String> = doc
            .keys()
            .filter(|k| k.as_str() != RUNS_KEY && k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn save_pipeline_run(&self, run: &PipelineRun) -> error::Result<()> {
        let _guard = self.lock.lock().map_err(|_| StateError::LockPoisoned)?;
        let mut doc = self.load()?;
        let encoded = serde_json::to_value(run)?;
        let runs = Self::runs_mut(&mut doc);
        match runs
            .iter_mut()
            .find(|entry| entry.get("id").and_then(Value::as_str) == Some(run.id.as_str()))
        {
            Some(existing) => *existing = encoded,
            None => runs.push(encoded),
        }
        self.persist(&doc)
    }

    fn get_pipeline_run(&self, id: &str) -> error::Result<Option<PipelineRun>> {
        let _guard = self.lock.lock().map_err(|_| StateError::LockPoisoned)?;
        let doc = self.load()?;
        Ok(Self::decode_runs(&doc)?.into_iter().find(|r| r.id == id))
    }

    fn get_pipeline_runs(
        &self,
        pipeline_name: &str,
        limit: usize,
    ) -> error::Result<Vec<PipelineRun>> {
        let _guard = self.lock.lock().map_err(|_| StateError::LockPoisoned)?;
        let doc = self.load()?;
        let mut runs: Vec<PipelineRun> = Self::decode_runs(&doc)?
            .into_iter()
            .filter(|r| r.pipeline_name == pipeline_name)
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn cleanup_old_runs(&self, retention_days: u32) -> error::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let _guard = self.lock.lock().map_err(|_| StateError::LockPoisoned)?;
        let mut doc = self.load()?;
        let decoded = Self::decode_runs(&doc)?;
        let before = decoded.len();
        let surviving: Vec<Value> = decoded
            .into_iter()
            .filter(|r| r.started_at >= cutoff)
            .map(|r| serde_json::to_value(&r).map_err(StateError::from))
            .collect::<error::Result<_>>()?;
        let deleted = before - surviving.len();
        doc.insert(RUNS_KEY.to_string(), Value::Array(surviving));
        if deleted > 0 {
            self.persist(&doc)?;
        }
        Ok(deleted as u64)
    }
}
