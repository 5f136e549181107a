use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{Map, Value};

use super::record::{paginate, HistoryPage, HistoryRecord};

/// File-backed key-value store of history records (`history.json`).
///
/// Every read refreshes from disk, and writes merge only the keys this
/// instance touched, so two writers sharing a file do not clobber each other.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    payload: Map<String, Value>,
    dirty_keys: Vec<String>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: Map::new(),
            dirty_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self, id: &str) -> anyhow::Result<Option<HistoryRecord>> {
        self.refresh();
        let Some(raw) = self.payload.get(id) else {
            return Ok(None);
        };
        let record = serde_json::from_value(raw.clone())
            .with_context(|| format!("history record '{id}' is malformed"))?;
        Ok(Some(record))
    }

    pub fn put(&mut self, record: &HistoryRecord) -> anyhow::Result<()> {
        self.refresh();
        let snapshot = serde_json::to_value(record)?;
        if self.payload.get(&record.id) == Some(&snapshot) {
            return Ok(());
        }
        self.payload.insert(record.id.clone(), snapshot);
        if !self.dirty_keys.contains(&record.id) {
            self.dirty_keys.push(record.id.clone());
        }
        self.flush()
    }

    /// Summaries of every readable record, newest first.
    pub fn list(&mut self, page: usize, per_page: usize) -> HistoryPage {
        self.refresh();
        let summaries = self
            .payload
            .values()
            .filter_map(|raw| serde_json::from_value::<HistoryRecord>(raw.clone()).ok())
            .map(|record| record.summary())
            .collect();
        paginate(summaries, page, per_page)
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.dirty_keys.is_empty() {
            return Ok(());
        }
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        for key in &self.dirty_keys {
            if let Some(value) = self.payload.get(key) {
                on_disk.insert(key.clone(), value.clone());
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = on_disk;
        self.dirty_keys.clear();
        Ok(())
    }

    fn refresh(&mut self) {
        self.payload = read_json_object(&self.path).unwrap_or_default();
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
