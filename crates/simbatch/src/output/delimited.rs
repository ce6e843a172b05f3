//! Flat delimited-text writer.
//!
//! Each task gets `<path>/<name>_<task>.csv`. Nested payload mappings are
//! flattened into dotted column names; list values fill rows and scalars are
//! repeated on every row. The `<name>_<task>.meta.json` sidecar is written by
//! `finalize` and marks the artifact as complete. It also keeps the last
//! snapshot as JSON, which is what `load_like` reads back; the CSV is a view
//! for external tools.
//!
//! Batch-level metadata goes to `<path>/<name>.batch.json`.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ArtifactMetadata, OutputSettings, TaskStatus};
use crate::config::Payload;
use crate::error::{OutputError, StateError};

const META_SUFFIX: &str = ".meta.json";
const BATCH_SUFFIX: &str = ".batch.json";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    #[serde(flatten)]
    metadata: ArtifactMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Payload>,
}

#[derive(Debug)]
pub struct CsvWriter {
    settings: OutputSettings,
    /// Latest snapshot per task saved by this writer
    opened: FxHashMap<String, Payload>,
    finalized: FxHashSet<String>,
}

impl CsvWriter {
    pub fn new(settings: OutputSettings) -> Self {
        Self {
            settings,
            opened: FxHashMap::default(),
            finalized: FxHashSet::default(),
        }
    }

    pub fn settings(&self) -> &OutputSettings {
        &self.settings
    }

    fn prefix(&self) -> String {
        format!("{}_", self.settings.name)
    }

    pub fn data_path(&self, task: &str) -> PathBuf {
        self.settings
            .directory()
            .join(format!("{}{task}.csv", self.prefix()))
    }

    pub fn meta_path(&self, task: &str) -> PathBuf {
        self.settings
            .directory()
            .join(format!("{}{task}{META_SUFFIX}", self.prefix()))
    }

    pub fn batch_path(&self) -> PathBuf {
        self.settings
            .directory()
            .join(format!("{}{BATCH_SUFFIX}", self.settings.name))
    }

    /// Reject writes to a task that is closed or protected.
    fn check_writable(&self, task: &str) -> Result<(), OutputError> {
        if self.finalized.contains(task) {
            return Err(StateError::AlreadyFinalized(task.to_string()).into());
        }
        if !self.opened.contains_key(task)
            && !self.settings.force
            && self
                .read_sidecar(task)
                .is_some_and(|s| s.metadata.status == TaskStatus::Success)
        {
            return Err(StateError::ArtifactExists(task.to_string()).into());
        }
        Ok(())
    }

    pub fn save(&mut self, task: &str, payload: &Payload) -> Result<(), OutputError> {
        self.check_writable(task)?;
        fs::create_dir_all(self.settings.directory())?;

        if !self.opened.contains_key(task) {
            // A stale sidecar would mark the new snapshot as finalized
            remove_if_exists(&self.meta_path(task))?;
        }

        let mut columns = Vec::new();
        flatten(None, payload, &mut columns);
        write_table(&self.data_path(task), &columns)?;
        self.opened.insert(task.to_string(), payload.clone());
        Ok(())
    }

    pub fn finalize(&mut self, task: &str, metadata: &ArtifactMetadata) -> Result<(), OutputError> {
        self.check_writable(task)?;
        fs::create_dir_all(self.settings.directory())?;

        let payload = self.opened.get(task).cloned();
        if payload.is_none() {
            // Nothing saved in this run: drop any earlier snapshot
            remove_if_exists(&self.data_path(task))?;
        }

        let sidecar = Sidecar {
            metadata: metadata.stamped(),
            payload,
        };
        let mut file = BufWriter::new(File::create(self.meta_path(task))?);
        serde_json::to_writer_pretty(&mut file, &sidecar)?;
        file.flush()?;

        self.finalized.insert(task.to_string());
        Ok(())
    }

    fn read_sidecar(&self, task: &str) -> Option<Sidecar> {
        let text = fs::read_to_string(self.meta_path(task)).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn metadata(&self, task: &str) -> Option<ArtifactMetadata> {
        self.read_sidecar(task).map(|s| s.metadata)
    }

    pub fn load_like(&self, task: &str) -> Option<Payload> {
        let sidecar = self.read_sidecar(task)?;
        if sidecar.metadata.status != TaskStatus::Success {
            return None;
        }
        Some(sidecar.payload.unwrap_or_default())
    }

    pub fn save_batch_metadata(&mut self, metadata: &Map<String, Value>) -> Result<(), OutputError> {
        fs::create_dir_all(self.settings.directory())?;
        let mut file = BufWriter::new(File::create(self.batch_path())?);
        serde_json::to_writer_pretty(&mut file, metadata)?;
        file.flush()?;
        Ok(())
    }

    pub fn batch_metadata(&self) -> Option<Map<String, Value>> {
        let text = fs::read_to_string(self.batch_path()).ok()?;
        serde_json::from_str(&text)
            .inspect_err(|err| tracing::debug!("corrupt batch metadata: {err}"))
            .ok()
    }

    pub fn dir(&self) -> Vec<String> {
        let prefix = self.prefix();
        let Ok(entries) = fs::read_dir(self.settings.directory()) else {
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name().into_string().ok()?;
                let task = file_name.strip_prefix(&prefix)?.strip_suffix(META_SUFFIX)?;
                (!task.is_empty()).then(|| task.to_string())
            })
            .collect();
        names.sort();
        names
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn flatten(prefix: Option<&str>, map: &Map<String, Value>, out: &mut Vec<(String, Value)>) {
    for (key, value) in map {
        let column = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) => flatten(Some(&column), inner, out),
            other => out.push((column, other.clone())),
        }
    }
}

fn write_table(path: &Path, columns: &[(String, Value)]) -> Result<(), OutputError> {
    let rows = columns
        .iter()
        .map(|(_, v)| v.as_array().map_or(1, Vec::len))
        .max()
        .unwrap_or(0);

    let mut writer = csv::Writer::from_path(path)?;
    if columns.is_empty() {
        writer.flush()?;
        return Ok(());
    }

    writer.write_record(columns.iter().map(|(k, _)| k.as_str()))?;
    for row in 0..rows {
        let record: Vec<String> = columns
            .iter()
            .map(|(_, value)| match value {
                Value::Array(items) => items.get(row).map(to_cell).unwrap_or_default(),
                scalar => to_cell(scalar),
            })
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
